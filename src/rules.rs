//! Rule engine: path→rule resolution, bypass and expiration policy (§4.5).

use std::time::Duration;

use serde::Deserialize;

/// Per-rule warmup descriptor.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmupDescriptor {
    #[serde(with = "humantime_serde")]
    pub run_every: Duration,
    pub max_requests_at_a_time: usize,
}

/// A single configured rule, compiled from its `match` expression into a
/// list of path-prefix matchers.
#[derive(Debug, Clone)]
pub struct Rule {
    pub prefixes: Vec<String>,
    pub priority: i64,
    pub bypass: bool,
    pub bypass_when_cookies: Vec<String>,
    pub expiration: Duration,
    pub warmup: Option<WarmupDescriptor>,
}

impl Rule {
    /// A rule's `match` expression is `PathPrefix(/a) | PathPrefix(/b) | ...`.
    pub fn compile_match(expr: &str) -> Vec<String> {
        expr.split('|')
            .filter_map(|token| {
                let token = token.trim();
                let inner = token.strip_prefix("PathPrefix(")?.strip_suffix(')')?;
                Some(inner.to_string())
            })
            .collect()
    }

    pub fn matches_path(&self, path: &str) -> bool {
        self.prefixes.iter().any(|prefix| path.starts_with(prefix.as_str()))
    }
}

/// Resolves an incoming request path to the highest-priority matching rule.
pub struct RuleEngine {
    /// Sorted ascending by priority (lower value = higher priority).
    rules: Vec<Rule>,
}

impl RuleEngine {
    pub fn new(mut rules: Vec<Rule>) -> Self {
        rules.sort_by_key(|r| r.priority);
        Self { rules }
    }

    pub fn pick(&self, path: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.matches_path(path))
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }
}

/// True iff any cookie present on the request header value has a name in
/// `names`. `cookie_header` is the raw `Cookie:` header value, e.g.
/// `"a=1; sessionid=abc; b=2"`.
pub fn has_any_cookie(cookie_header: Option<&str>, names: &[String]) -> bool {
    let Some(header) = cookie_header else {
        return false;
    };
    if names.is_empty() {
        return false;
    }
    header.split(';').any(|pair| {
        let name = pair.split('=').next().unwrap_or("").trim();
        names.iter().any(|n| n == name)
    })
}

/// `now - stored_at > expiration` when `expiration > 0`; always `false` when
/// `expiration == 0` (never stale).
pub fn is_stale(stored_at: u64, now: u64, expiration: Duration) -> bool {
    if expiration.is_zero() {
        return false;
    }
    now.saturating_sub(stored_at) > expiration.as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(prefixes: &[&str], priority: i64, bypass: bool) -> Rule {
        Rule {
            prefixes: prefixes.iter().map(|s| s.to_string()).collect(),
            priority,
            bypass,
            bypass_when_cookies: Vec::new(),
            expiration: Duration::from_secs(60),
            warmup: None,
        }
    }

    #[test]
    fn compile_match_splits_union() {
        let prefixes = Rule::compile_match("PathPrefix(/p1) | PathPrefix(/p2)");
        assert_eq!(prefixes, vec!["/p1".to_string(), "/p2".to_string()]);
    }

    #[test]
    fn picks_lowest_priority_first() {
        let engine = RuleEngine::new(vec![rule(&["/"], 10, false), rule(&["/admin"], 1, true)]);
        let picked = engine.pick("/admin/x").unwrap();
        assert!(picked.bypass);
    }

    #[test]
    fn no_match_returns_none() {
        let engine = RuleEngine::new(vec![rule(&["/blog"], 1, false)]);
        assert!(engine.pick("/shop").is_none());
    }

    #[test]
    fn cookie_presence_detection() {
        let names = vec!["sessionid".to_string()];
        assert!(has_any_cookie(Some("a=1; sessionid=abc"), &names));
        assert!(!has_any_cookie(Some("a=1; b=2"), &names));
        assert!(!has_any_cookie(None, &names));
    }

    #[test]
    fn staleness_respects_zero_expiration() {
        assert!(!is_stale(0, 1000, Duration::ZERO));
        assert!(is_stale(0, 1000, Duration::from_secs(60)));
        assert!(!is_stale(990, 1000, Duration::from_secs(60)));
    }
}
