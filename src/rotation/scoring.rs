// src/rotation/scoring.rs
//! Candidate account scoring
//!
//! `score = 0.6 * remaining + 0.2 * health - 0.2 * shared_credential`
//!
//! - `remaining`: `(100 - max window utilization) / 100`, accounts with no
//!   monitoring data count as fully used
//! - `health`: constant 1.0 for every account that passes the filters
//! - `shared_credential`: 1.0 when the candidate shares the source account's
//!   credential fingerprint (and therefore its upstream quota)

use crate::collaborators::AccountInfo;
use serde::Serialize;

const REMAINING_WEIGHT: f64 = 0.6;
const HEALTH_WEIGHT: f64 = 0.2;
const SHARED_CREDENTIAL_WEIGHT: f64 = 0.2;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredAccount {
    pub account: AccountInfo,
    pub score: f64,
    pub remaining: f64,
    pub shared_credential: bool,
}

/// Filter and rank candidates, best first
///
/// `max_utilization` returns the account's highest window percentage;
/// `in_cooldown` reports accounts recently seen rate-limited.
pub fn score_candidates<U, C>(
    accounts: Vec<AccountInfo>,
    exclude_account_id: &str,
    max_utilization: U,
    in_cooldown: C,
) -> Vec<ScoredAccount>
where
    U: Fn(&str) -> Option<f64>,
    C: Fn(&str) -> bool,
{
    let source_fingerprint = accounts
        .iter()
        .find(|a| a.id == exclude_account_id)
        .map(|a| a.credential_fingerprint.clone());

    let mut scored: Vec<ScoredAccount> = accounts
        .into_iter()
        .filter(|a| a.enabled && !a.rate_limited && a.scheduler_eligible)
        .filter(|a| a.id != exclude_account_id)
        .filter(|a| !in_cooldown(&a.id))
        .map(|account| {
            let utilization = max_utilization(&account.id).unwrap_or(100.0);
            let remaining = ((100.0 - utilization) / 100.0).clamp(0.0, 1.0);
            let shared_credential =
                source_fingerprint.as_deref() == Some(account.credential_fingerprint.as_str());
            let penalty = if shared_credential { 1.0 } else { 0.0 };

            ScoredAccount {
                score: REMAINING_WEIGHT * remaining + HEALTH_WEIGHT * 1.0
                    - SHARED_CREDENTIAL_WEIGHT * penalty,
                remaining,
                shared_credential,
                account,
            }
        })
        .collect();

    // stable: equal scores keep directory order
    scored.sort_by(|a, b| b.score.total_cmp(&a.score));
    scored
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn account(id: &str, fingerprint: &str) -> AccountInfo {
        AccountInfo {
            id: id.into(),
            credential_fingerprint: fingerprint.into(),
            enabled: true,
            rate_limited: false,
            scheduler_eligible: true,
        }
    }

    #[test]
    fn test_filters_and_orders() {
        let mut disabled = account("disabled", "fp-d");
        disabled.enabled = false;
        let mut limited = account("limited", "fp-l");
        limited.rate_limited = true;
        let mut parked = account("parked", "fp-p");
        parked.scheduler_eligible = false;

        let accounts = vec![
            account("source", "fp-1"),
            account("twin", "fp-1"),
            account("busy", "fp-2"),
            account("fresh", "fp-3"),
            account("cooling", "fp-4"),
            account("unmonitored", "fp-5"),
            disabled,
            limited,
            parked,
        ];
        let utilization: HashMap<&str, f64> =
            [("twin", 10.0), ("busy", 70.0), ("fresh", 20.0), ("cooling", 0.0)].into();

        let ranked = score_candidates(
            accounts,
            "source",
            |id| utilization.get(id).copied(),
            |id| id == "cooling",
        );
        let ids: Vec<&str> = ranked.iter().map(|s| s.account.id.as_str()).collect();
        assert_eq!(ids, vec!["fresh", "twin", "busy", "unmonitored"]);

        // 0.6 * 0.8 + 0.2
        assert!((ranked[0].score - 0.68).abs() < 1e-9);
        assert!(ranked[1].shared_credential);
        assert!((ranked[1].score - 0.54).abs() < 1e-9);
        assert!((ranked[3].score - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_ties_keep_directory_order() {
        let accounts = vec![account("a", "x"), account("b", "y"), account("c", "z")];
        let ranked = score_candidates(accounts, "none", |_| Some(50.0), |_| false);
        let ids: Vec<&str> = ranked.iter().map(|s| s.account.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    proptest! {
        #[test]
        fn prop_ranked_descending_and_filtered(
            specs in proptest::collection::vec(
                (any::<bool>(), any::<bool>(), any::<bool>(), 0u8..4, proptest::option::of(0.0f64..100.0)),
                0..12,
            ),
            exclude in 0usize..12,
        ) {
            let accounts: Vec<AccountInfo> = specs
                .iter()
                .enumerate()
                .map(|(i, (enabled, limited, eligible, fp, _))| AccountInfo {
                    id: format!("acct-{}", i),
                    credential_fingerprint: format!("fp-{}", fp),
                    enabled: *enabled,
                    rate_limited: *limited,
                    scheduler_eligible: *eligible,
                })
                .collect();
            let utilization: HashMap<String, f64> = specs
                .iter()
                .enumerate()
                .filter_map(|(i, s)| s.4.map(|u| (format!("acct-{}", i), u)))
                .collect();
            let excluded = format!("acct-{}", exclude);

            let ranked = score_candidates(
                accounts,
                &excluded,
                |id| utilization.get(id).copied(),
                |_| false,
            );

            for pair in ranked.windows(2) {
                prop_assert!(pair[0].score >= pair[1].score);
            }
            for scored in &ranked {
                prop_assert!(scored.account.enabled);
                prop_assert!(!scored.account.rate_limited);
                prop_assert!(scored.account.scheduler_eligible);
                prop_assert_ne!(&scored.account.id, &excluded);
                prop_assert!(scored.score >= 0.0 && scored.score <= 0.8 + 1e-9);
            }
        }
    }
}
