// src/runtime/backend.rs
//! Agent CLI backends
//!
//! Each supported backend has its own flag syntax for model selection,
//! allowed directories and structured output:
//!
//! | Backend  | Invocation                                                        |
//! |----------|-------------------------------------------------------------------|
//! | claude   | `claude -p <prompt> --output-format json --model M --add-dir D`   |
//! | opencode | `opencode run --format json --model M <prompt>`                   |
//! | gemini   | `gemini -p <prompt> --output-format json -m M --include-directories D1,D2` |
//! | codex    | `codex exec --json -m M --cd D0 --add-dir D1 <prompt>`            |
//!
//! The module also knows each backend's rate-limit stderr signatures and
//! how to pull token/cost usage out of its JSON output.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Supported agent CLI backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    Claude,
    OpenCode,
    Gemini,
    Codex,
}

impl BackendType {
    /// Default executable name for this backend
    pub fn command(&self) -> &'static str {
        match self {
            BackendType::Claude => "claude",
            BackendType::OpenCode => "opencode",
            BackendType::Gemini => "gemini",
            BackendType::Codex => "codex",
        }
    }

    pub fn as_str(&self) -> &'static str {
        self.command()
    }

    /// Build the argument vector for a run
    pub fn build_args(&self, prompt: &str, model: Option<&str>, allowed_dirs: &[PathBuf]) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();

        match self {
            BackendType::Claude => {
                args.extend(["-p".into(), prompt.to_string()]);
                args.extend(["--output-format".into(), "json".into()]);
                if let Some(model) = model {
                    args.extend(["--model".into(), model.to_string()]);
                }
                for dir in allowed_dirs {
                    args.extend(["--add-dir".into(), dir.display().to_string()]);
                }
            }
            BackendType::OpenCode => {
                args.extend(["run".into(), "--format".into(), "json".into()]);
                if let Some(model) = model {
                    args.extend(["--model".into(), model.to_string()]);
                }
                // opencode scopes itself to the working directory; see
                // `default_working_dir`
                args.push(prompt.to_string());
            }
            BackendType::Gemini => {
                args.extend(["-p".into(), prompt.to_string()]);
                args.extend(["--output-format".into(), "json".into()]);
                if let Some(model) = model {
                    args.extend(["-m".into(), model.to_string()]);
                }
                if !allowed_dirs.is_empty() {
                    let joined = allowed_dirs
                        .iter()
                        .map(|d| d.display().to_string())
                        .collect::<Vec<_>>()
                        .join(",");
                    args.extend(["--include-directories".into(), joined]);
                }
            }
            BackendType::Codex => {
                args.extend(["exec".into(), "--json".into()]);
                if let Some(model) = model {
                    args.extend(["-m".into(), model.to_string()]);
                }
                if let Some((first, rest)) = allowed_dirs.split_first() {
                    args.extend(["--cd".into(), first.display().to_string()]);
                    for dir in rest {
                        args.extend(["--add-dir".into(), dir.display().to_string()]);
                    }
                }
                args.push(prompt.to_string());
            }
        }

        args
    }

    /// Working directory to use when the agent names none
    pub fn default_working_dir(&self, allowed_dirs: &[PathBuf]) -> Option<PathBuf> {
        match self {
            BackendType::OpenCode => allowed_dirs.first().cloned(),
            _ => None,
        }
    }

    /// Lower-cased substrings that mark a stderr line as a rate-limit notice
    ///
    /// A bare HTTP 429 is matched separately, on a status boundary.
    pub fn rate_limit_signatures(&self) -> &'static [&'static str] {
        match self {
            BackendType::Claude => &[
                "rate limit",
                "rate_limit_error",
                "usage limit reached",
                "overloaded_error",
            ],
            BackendType::OpenCode => &["rate limit", "too many requests"],
            BackendType::Gemini => &[
                "resource_exhausted",
                "quota exceeded",
                "rate limit",
            ],
            BackendType::Codex => &[
                "rate_limit_exceeded",
                "you've hit your usage limit",
                "rate limit",
            ],
        }
    }

    /// Check a stderr line against this backend's signatures
    pub fn detect_rate_limit(&self, line: &str) -> Option<RateLimitMatch> {
        let lowered = line.to_lowercase();
        let signature = self
            .rate_limit_signatures()
            .iter()
            .copied()
            .find(|sig| lowered.contains(sig))
            .or_else(|| HTTP_429.is_match(&lowered).then_some(HTTP_429_SIGNATURE))?;

        Some(RateLimitMatch {
            signature,
            retry_after: parse_retry_after(&lowered),
        })
    }

    /// Extract token/cost usage from captured stdout lines
    pub fn extract_usage(&self, stdout: &[String]) -> Option<UsageData> {
        let documents = json_documents(stdout);
        if documents.is_empty() {
            return None;
        }

        let mut usage = UsageData::default();
        let mut found = false;

        for doc in &documents {
            found |= match self {
                BackendType::Claude => claude_usage(doc, &mut usage),
                BackendType::OpenCode => opencode_usage(doc, &mut usage),
                BackendType::Gemini => gemini_usage(doc, &mut usage),
                BackendType::Codex => codex_usage(doc, &mut usage),
            };
        }

        found.then_some(usage)
    }
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.command())
    }
}

/// A matched rate-limit signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitMatch {
    pub signature: &'static str,

    /// Retry hint parsed from the line, if any
    pub retry_after: Option<Duration>,
}

/// Token and cost usage reported by a backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageData {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    pub cost_usd: Option<f64>,
    pub model: Option<String>,
}

impl UsageData {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cache_read_tokens + self.cache_write_tokens
    }

    fn add_cost(&mut self, cost: f64) {
        self.cost_usd = Some(self.cost_usd.unwrap_or(0.0) + cost);
    }
}

static RETRY_AFTER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:retry|try again)(?: after| in)?\s+(\d+(?:\.\d+)?)\s*(ms|milliseconds?|s|secs?|seconds?|m|mins?|minutes?|h|hours?)\b")
        .expect("retry-after pattern is valid")
});

const HTTP_429_SIGNATURE: &str = "429";

/// `429` as a status code, not as part of a number or unrelated text
static HTTP_429: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:\b(?:http|status|code|error)\b\D{0,12}\b429\b)|(?:\b429\b\D{0,12}\btoo many\b)")
        .expect("http 429 pattern is valid")
});

fn parse_retry_after(lowered: &str) -> Option<Duration> {
    let caps = RETRY_AFTER.captures(lowered)?;
    let amount: f64 = caps.get(1)?.as_str().parse().ok()?;
    let unit = caps.get(2)?.as_str();

    let secs = match unit.chars().next()? {
        'h' => amount * 3600.0,
        'm' if unit.starts_with("ms") || unit.starts_with("milli") => amount / 1000.0,
        'm' => amount * 60.0,
        _ => amount,
    };

    // Absurd hints (too large for a Duration) are ignored
    Duration::try_from_secs_f64(secs).ok()
}

/// Parse stdout either as one JSON document or as JSON lines
fn json_documents(stdout: &[String]) -> Vec<Value> {
    let joined = stdout.join("\n");
    if let Ok(doc) = serde_json::from_str::<Value>(joined.trim()) {
        return vec![doc];
    }

    stdout
        .iter()
        .filter_map(|line| serde_json::from_str::<Value>(line.trim()).ok())
        .filter(Value::is_object)
        .collect()
}

fn read_u64(value: &Value, key: &str) -> u64 {
    value.get(key).and_then(Value::as_u64).unwrap_or(0)
}

fn claude_usage(doc: &Value, usage: &mut UsageData) -> bool {
    let mut found = false;

    if let Some(u) = doc.get("usage") {
        usage.input_tokens += read_u64(u, "input_tokens");
        usage.output_tokens += read_u64(u, "output_tokens");
        usage.cache_read_tokens += read_u64(u, "cache_read_input_tokens");
        usage.cache_write_tokens += read_u64(u, "cache_creation_input_tokens");
        found = true;
    }

    if let Some(cost) = doc.get("total_cost_usd").and_then(Value::as_f64) {
        usage.add_cost(cost);
        found = true;
    }

    if let Some(model) = doc
        .get("modelUsage")
        .and_then(Value::as_object)
        .and_then(|models| models.keys().next())
    {
        usage.model = Some(model.clone());
    }

    found
}

fn opencode_usage(doc: &Value, usage: &mut UsageData) -> bool {
    let part = doc.get("part").unwrap_or(doc);
    let Some(tokens) = part.get("tokens") else {
        return false;
    };

    usage.input_tokens += read_u64(tokens, "input");
    usage.output_tokens += read_u64(tokens, "output");
    if let Some(cache) = tokens.get("cache") {
        usage.cache_read_tokens += read_u64(cache, "read");
        usage.cache_write_tokens += read_u64(cache, "write");
    }
    if let Some(cost) = part.get("cost").and_then(Value::as_f64) {
        usage.add_cost(cost);
    }
    true
}

fn gemini_usage(doc: &Value, usage: &mut UsageData) -> bool {
    let Some(models) = doc
        .get("stats")
        .and_then(|s| s.get("models"))
        .and_then(Value::as_object)
    else {
        return false;
    };

    for (name, stats) in models {
        if let Some(tokens) = stats.get("tokens") {
            usage.input_tokens += read_u64(tokens, "prompt");
            usage.output_tokens += read_u64(tokens, "candidates");
            usage.cache_read_tokens += read_u64(tokens, "cached");
        }
        usage.model.get_or_insert_with(|| name.clone());
    }
    true
}

fn codex_usage(doc: &Value, usage: &mut UsageData) -> bool {
    let is_turn_end = doc
        .get("type")
        .and_then(Value::as_str)
        .map(|t| t == "turn.completed")
        .unwrap_or(false);

    let Some(u) = doc.get("usage").filter(|_| is_turn_end) else {
        return false;
    };

    usage.input_tokens += read_u64(u, "input_tokens");
    usage.output_tokens += read_u64(u, "output_tokens");
    usage.cache_read_tokens += read_u64(u, "cached_input_tokens");
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn test_claude_args() {
        let dirs = vec![PathBuf::from("/work/a"), PathBuf::from("/work/b")];
        let args = BackendType::Claude.build_args("fix it", Some("sonnet"), &dirs);
        assert_eq!(
            args,
            vec![
                "-p", "fix it", "--output-format", "json", "--model", "sonnet",
                "--add-dir", "/work/a", "--add-dir", "/work/b",
            ]
        );
    }

    #[test]
    fn test_gemini_joins_directories() {
        let dirs = vec![PathBuf::from("/a"), PathBuf::from("/b")];
        let args = BackendType::Gemini.build_args("hi", Some("gemini-2.5-pro"), &dirs);
        assert!(has_pair(&args, "--include-directories", "/a,/b"));
        assert!(has_pair(&args, "-m", "gemini-2.5-pro"));
        assert!(has_pair(&args, "--output-format", "json"));
    }

    #[test]
    fn test_codex_and_opencode_put_prompt_last() {
        let dirs = vec![PathBuf::from("/repo"), PathBuf::from("/shared")];
        let codex = BackendType::Codex.build_args("task", None, &dirs);
        assert_eq!(codex, vec!["exec", "--json", "--cd", "/repo", "--add-dir", "/shared", "task"]);

        let opencode = BackendType::OpenCode.build_args("task", Some("gpt-5"), &dirs);
        assert_eq!(opencode, vec!["run", "--format", "json", "--model", "gpt-5", "task"]);
        assert_eq!(
            BackendType::OpenCode.default_working_dir(&dirs),
            Some(PathBuf::from("/repo"))
        );
        assert_eq!(BackendType::Claude.default_working_dir(&dirs), None);
    }

    #[test]
    fn test_rate_limit_detection() {
        let hit = BackendType::Claude
            .detect_rate_limit("Error: Claude AI usage limit reached. Please try again in 5 minutes")
            .unwrap();
        assert_eq!(hit.signature, "usage limit reached");
        assert_eq!(hit.retry_after, Some(Duration::from_secs(300)));

        let hit = BackendType::Gemini
            .detect_rate_limit("[API Error: RESOURCE_EXHAUSTED] retry after 30s")
            .unwrap();
        assert_eq!(hit.retry_after, Some(Duration::from_secs(30)));

        assert!(BackendType::Codex.detect_rate_limit("compiling crate foo").is_none());
        assert!(BackendType::Gemini
            .detect_rate_limit("usage limit reached")
            .is_none());
    }

    #[test]
    fn test_http_429_needs_a_status_boundary() {
        let hit = BackendType::OpenCode
            .detect_rate_limit("HTTP 429 Too Many Requests")
            .unwrap();
        assert_eq!(hit.signature, "too many requests");

        let hit = BackendType::Claude
            .detect_rate_limit("API Error: status 429")
            .unwrap();
        assert_eq!(hit.signature, "429");

        for line in ["Compiled 1429 modules in 3.2s", "wrote 429 bytes", "port 4290 open"] {
            assert!(BackendType::Claude.detect_rate_limit(line).is_none(), "{}", line);
            assert!(BackendType::Gemini.detect_rate_limit(line).is_none(), "{}", line);
        }
    }

    #[test]
    fn test_oversized_retry_hint_is_ignored() {
        let hit = BackendType::Claude
            .detect_rate_limit("rate limit hit, retry after 99999999999999999999 hours")
            .unwrap();
        assert_eq!(hit.signature, "rate limit");
        assert_eq!(hit.retry_after, None);
    }

    #[test]
    fn test_claude_usage() {
        let stdout = lines(&[
            r#"{"type":"result","result":"done","total_cost_usd":0.042,"#,
            r#""usage":{"input_tokens":120,"output_tokens":30,"cache_read_input_tokens":1000},"#,
            r#""modelUsage":{"claude-sonnet-4":{}}}"#,
        ]);
        let usage = BackendType::Claude.extract_usage(&stdout).unwrap();
        assert_eq!(usage.input_tokens, 120);
        assert_eq!(usage.output_tokens, 30);
        assert_eq!(usage.cache_read_tokens, 1000);
        assert_eq!(usage.cost_usd, Some(0.042));
        assert_eq!(usage.model.as_deref(), Some("claude-sonnet-4"));
    }

    #[test]
    fn test_codex_usage_from_jsonl() {
        let stdout = lines(&[
            r#"{"type":"thread.started","thread_id":"t1"}"#,
            r#"{"type":"turn.completed","usage":{"input_tokens":50,"cached_input_tokens":10,"output_tokens":7}}"#,
            r#"{"type":"turn.completed","usage":{"input_tokens":5,"output_tokens":3}}"#,
        ]);
        let usage = BackendType::Codex.extract_usage(&stdout).unwrap();
        assert_eq!(usage.input_tokens, 55);
        assert_eq!(usage.output_tokens, 10);
        assert_eq!(usage.cache_read_tokens, 10);
        assert_eq!(usage.cost_usd, None);
    }

    #[test]
    fn test_opencode_and_gemini_usage() {
        let stdout = lines(&[
            r#"{"type":"step_finish","part":{"tokens":{"input":10,"output":4,"cache":{"read":2,"write":1}},"cost":0.01}}"#,
            r#"{"type":"step_finish","part":{"tokens":{"input":1,"output":1},"cost":0.005}}"#,
        ]);
        let usage = BackendType::OpenCode.extract_usage(&stdout).unwrap();
        assert_eq!(usage.total_tokens(), 19);
        assert!((usage.cost_usd.unwrap() - 0.015).abs() < 1e-9);

        let stdout = lines(&[
            r#"{"response":"ok","stats":{"models":{"gemini-2.5-pro":{"tokens":{"prompt":40,"candidates":9,"cached":3}}}}}"#,
        ]);
        let usage = BackendType::Gemini.extract_usage(&stdout).unwrap();
        assert_eq!(usage.input_tokens, 40);
        assert_eq!(usage.model.as_deref(), Some("gemini-2.5-pro"));
    }

    #[test]
    fn test_plain_text_has_no_usage() {
        let stdout = lines(&["hello", "world"]);
        assert!(BackendType::Claude.extract_usage(&stdout).is_none());
    }
}
