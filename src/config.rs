//! Validated configuration structure and YAML loader (§6).
//!
//! Mirrors the teacher's `config.rs` idiom — nested structs,
//! `#[serde(default = "fn_name")]` for every optional field — but the wire
//! format is YAML (the spec's config shape) rather than the teacher's TOML,
//! and the shape itself is wait0's own (storage/server/urlsDiscover/
//! logging/rules) instead of the teacher's CDN config.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::sizeparse::ByteSize;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default = "default_server")]
    pub server: ServerConfig,
    #[serde(default)]
    pub urls_discover: Option<UrlsDiscoverConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            server: default_server(),
            urls_discover: None,
            logging: LoggingConfig::default(),
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub ram: RamConfig,
    #[serde(default)]
    pub disk: DiskConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { ram: RamConfig::default(), disk: DiskConfig::default() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RamConfig {
    #[serde(default = "default_ram_max")]
    pub max: ByteSize,
}

impl Default for RamConfig {
    fn default() -> Self {
        Self { max: default_ram_max() }
    }
}

fn default_ram_max() -> ByteSize {
    ByteSize(256 * 1024 * 1024)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskConfig {
    #[serde(default = "default_disk_max")]
    pub max: ByteSize,
    #[serde(default = "default_disk_path")]
    pub path: String,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self { max: default_disk_max(), path: default_disk_path() }
    }
}

fn default_disk_max() -> ByteSize {
    ByteSize(4 * 1024 * 1024 * 1024)
}

fn default_disk_path() -> String {
    "./data/leveldb".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub origin: String,
}

fn default_server() -> ServerConfig {
    ServerConfig { port: 8080, origin: "http://localhost:3000".to_string() }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlsDiscoverConfig {
    #[serde(alias = "initalDelay", with = "humantime_serde", default = "default_initial_delay")]
    pub initial_delay: Duration,
    #[serde(with = "humantime_serde", default)]
    pub rediscover_every: Duration,
    #[serde(default)]
    pub sitemaps: Vec<String>,
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(10)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(with = "humantime_serde", default = "default_log_stats_every")]
    pub log_stats_every: Duration,
    #[serde(default)]
    pub log_warmup: bool,
    #[serde(default)]
    pub log_url_autodiscover: bool,
    /// Historical alias: setting this also implies `log_warmup = true`.
    #[serde(default)]
    pub log_revalidation_every: Option<String>,
    /// Emit `tracing-subscriber`'s JSON formatter instead of the default
    /// human-readable one. Off by default, matching local/dev usage.
    #[serde(default)]
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_stats_every: default_log_stats_every(),
            log_warmup: false,
            log_url_autodiscover: false,
            log_revalidation_every: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    pub fn warmup_logging_enabled(&self) -> bool {
        self.log_warmup || self.log_revalidation_every.is_some()
    }
}

fn default_log_stats_every() -> Duration {
    Duration::from_secs(60)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleConfig {
    #[serde(rename = "match")]
    pub match_expr: String,
    pub priority: i64,
    #[serde(default)]
    pub bypass: bool,
    #[serde(default)]
    pub bypass_when_cookies: Vec<String>,
    #[serde(with = "humantime_serde", default)]
    pub expiration: Duration,
    #[serde(default)]
    pub warm_up: Option<WarmUpConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmUpConfig {
    #[serde(with = "humantime_serde")]
    pub run_every: Duration,
    pub max_requests_at_a_time: usize,
}

impl Config {
    /// Reads and parses a YAML config file. Deliberately out of scope per
    /// spec.md §1: exists so the binary is runnable end-to-end, but nothing
    /// downstream assumes a particular _source_ of a `Config` value — tests
    /// build `Config` values directly.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("reading {}: {e}", path.as_ref().display())))?;
        serde_yaml::from_str(&raw).map_err(|e| Error::Config(format!("parsing YAML config: {e}")))
    }

    pub fn into_rules(&self) -> Result<Vec<crate::rules::Rule>, Error> {
        self.rules
            .iter()
            .map(|r| {
                let prefixes = crate::rules::Rule::compile_match(&r.match_expr);
                if prefixes.is_empty() {
                    return Err(Error::Config(format!("rule '{}' has no valid PathPrefix tokens", r.match_expr)));
                }
                Ok(crate::rules::Rule {
                    prefixes,
                    priority: r.priority,
                    bypass: r.bypass,
                    bypass_when_cookies: r.bypass_when_cookies.clone(),
                    expiration: r.expiration,
                    warmup: r.warm_up.as_ref().map(|w| crate::rules::WarmupDescriptor {
                        run_every: w.run_every,
                        max_requests_at_a_time: w.max_requests_at_a_time,
                    }),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_yaml() {
        let yaml = r#"
storage:
  ram: { max: "100m" }
  disk: { max: "1g" }
server:
  port: 8080
  origin: "http://localhost:3000"
rules:
  - match: "PathPrefix(/)"
    priority: 1
    expiration: "1m"
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.storage.ram.max.bytes(), 100 * 1024 * 1024);
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.rules.len(), 1);
        assert_eq!(cfg.rules[0].expiration, Duration::from_secs(60));
    }

    #[test]
    fn accepts_historical_inital_delay_alias() {
        let yaml = r#"
initalDelay: "5s"
rediscoverEvery: "1h"
sitemaps: ["https://example.com/sitemap.xml"]
"#;
        let cfg: UrlsDiscoverConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.initial_delay, Duration::from_secs(5));
    }

    #[test]
    fn warmup_logging_enabled_via_alias() {
        let mut logging = LoggingConfig::default();
        assert!(!logging.warmup_logging_enabled());
        logging.log_revalidation_every = Some("30s".to_string());
        assert!(logging.warmup_logging_enabled());
    }

    #[test]
    fn rule_match_expression_compiles_to_prefixes() {
        let cfg = Config {
            rules: vec![RuleConfig {
                match_expr: "PathPrefix(/a) | PathPrefix(/b)".to_string(),
                priority: 1,
                bypass: false,
                bypass_when_cookies: Vec::new(),
                expiration: Duration::from_secs(60),
                warm_up: None,
            }],
            ..Config::default()
        };
        let rules = cfg.into_rules().unwrap();
        assert_eq!(rules[0].prefixes, vec!["/a".to_string(), "/b".to_string()]);
    }
}
