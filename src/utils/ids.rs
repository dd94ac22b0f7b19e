// src/utils/ids.rs
//! Prefixed ULID identifiers

use ulid::Ulid;

/// Prefix for agent execution ids
pub const EXECUTION_PREFIX: &str = "exec";

/// Prefix for team execution ids
pub const TEAM_EXECUTION_PREFIX: &str = "team";

/// Prefix for rotation event ids
pub const ROTATION_PREFIX: &str = "rot";

/// Generate a new sortable id such as `exec_01HV...`
pub fn new_id(prefix: &str) -> String {
    format!("{}_{}", prefix, Ulid::new().to_string().to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixed_ids_are_unique() {
        let a = new_id(EXECUTION_PREFIX);
        let b = new_id(EXECUTION_PREFIX);
        assert!(a.starts_with("exec_"));
        assert_ne!(a, b);
    }
}
