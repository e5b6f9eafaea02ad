//! Sitemap discoverer (§4.10): optional one-shot + periodic ingestion of
//! paths from sitemap XML as inactive seeds, so warmup has keys to fetch
//! before any user ever visits them.

use std::collections::VecDeque;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use flate2::read::GzDecoder;
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use tracing::{info, warn};

use crate::disk::DiskTier;
use crate::entry::CacheEntry;
use crate::ram::RamTier;
use crate::rules::RuleEngine;

const PASS_DEADLINE: Duration = Duration::from_secs(120);
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Clone)]
pub struct SitemapConfig {
    pub initial_delay: Duration,
    pub rediscover_every: Duration,
    pub sitemaps: Vec<String>,
    /// Mirrors `logging.log_url_autodiscover` (default off).
    pub log_url_autodiscover: bool,
}

pub struct SitemapDiscoverer {
    client: reqwest::Client,
    origin_base: String,
    config: SitemapConfig,
}

#[derive(Debug, Default, Clone, Copy)]
struct SitemapStats {
    urls: u64,
    fit: u64,
    ignored: u64,
}

impl SitemapDiscoverer {
    pub fn new(client: reqwest::Client, origin_base: String, config: SitemapConfig) -> Self {
        Self { client, origin_base, config }
    }

    fn normalize(&self, loc: &str) -> String {
        if loc.starts_with("http://") || loc.starts_with("https://") {
            loc.to_string()
        } else {
            let base = self.origin_base.trim_end_matches('/');
            let path = if loc.starts_with('/') { loc.to_string() } else { format!("/{loc}") };
            format!("{base}{path}")
        }
    }

    /// Runs one discovery pass across all configured sitemaps (and any
    /// nested sitemap-index entries they reference), bounded by a 2-minute
    /// overall deadline.
    pub async fn discover_once(&self, rules: &RuleEngine, ram: &RamTier, disk: &DiskTier) {
        let deadline = tokio::time::Instant::now() + PASS_DEADLINE;
        let mut queue: VecDeque<String> = self.config.sitemaps.iter().map(|s| self.normalize(s)).collect();

        while let Some(url) = queue.pop_front() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                warn!("sitemap discovery pass exceeded its 2-minute deadline, stopping");
                break;
            }

            let body = match tokio::time::timeout(remaining, self.fetch_body(&url)).await {
                Ok(Ok(b)) => b,
                Ok(Err(e)) => {
                    warn!(url = %url, error = %e, "malformed sitemap, skipping");
                    continue;
                }
                Err(_) => {
                    warn!(url = %url, "sitemap fetch exceeded remaining pass deadline");
                    continue;
                }
            };

            match parse_sitemap(&body) {
                Ok(doc) => {
                    for nested in doc.nested_sitemaps {
                        queue.push_back(self.normalize(&nested));
                    }
                    let stats = self.ingest_urls(&doc.url_locs, rules, ram, disk).await;
                    if self.log_enabled() {
                        info!(url = %url, urls = stats.urls, fit = stats.fit, ignored = stats.ignored, "sitemap processed");
                    }
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "malformed sitemap, discovery continues with next sitemap");
                }
            }
        }
    }

    fn log_enabled(&self) -> bool {
        self.config.log_url_autodiscover
    }

    async fn fetch_body(&self, url: &str) -> Result<Vec<u8>, String> {
        let response = self.client.get(url).send().await.map_err(|e| e.to_string())?;
        let is_gz_url = url.ends_with(".gz");
        let raw = response.bytes().await.map_err(|e| e.to_string())?;
        decompress_if_needed(&raw, is_gz_url)
    }

    async fn ingest_urls(&self, url_locs: &[String], rules: &RuleEngine, ram: &RamTier, disk: &DiskTier) -> SitemapStats {
        let mut stats = SitemapStats::default();
        for loc in url_locs {
            stats.urls += 1;
            let Some(path) = path_of(loc) else {
                stats.ignored += 1;
                continue;
            };

            let Some(rule) = rules.pick(&path) else {
                stats.ignored += 1;
                continue;
            };
            if rule.bypass {
                stats.ignored += 1;
                continue;
            }

            stats.fit += 1;

            let already_active = ram.peek(&path).map(|e| !e.inactive).unwrap_or(false)
                || disk.peek(&path).await.map(|e| !e.inactive).unwrap_or(false);
            if already_active {
                continue;
            }

            disk.put_async(path, CacheEntry::new_seed()).await;
        }
        stats
    }
}

/// Decompresses `body` when `url_says_gz` or the body starts with the gzip
/// magic bytes, tolerating a double-compressed body (decompresses again if
/// the result still looks gzipped).
fn decompress_if_needed(body: &[u8], url_says_gz: bool) -> Result<Vec<u8>, String> {
    let looks_gz = body.len() >= 2 && body[..2] == GZIP_MAGIC;
    if !url_says_gz && !looks_gz {
        return Ok(body.to_vec());
    }

    let once = gunzip(body)?;
    if once.len() >= 2 && once[..2] == GZIP_MAGIC {
        gunzip(&once)
    } else {
        Ok(once)
    }
}

fn gunzip(body: &[u8]) -> Result<Vec<u8>, String> {
    let mut decoder = GzDecoder::new(body);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).map_err(|e| e.to_string())?;
    Ok(out)
}

struct ParsedSitemap {
    url_locs: Vec<String>,
    nested_sitemaps: Vec<String>,
}

/// Parses either a `urlset/url/loc` document or a `sitemapindex/sitemap/loc`
/// document, collecting both kinds of `loc` text into separate buckets.
fn parse_sitemap(body: &[u8]) -> Result<ParsedSitemap, String> {
    let mut reader = Reader::from_reader(body);
    reader.trim_text(true);

    let mut url_locs = Vec::new();
    let mut nested_sitemaps = Vec::new();

    // Element stack tells us whether the current <loc> is under <url> or
    // under <sitemap>.
    let mut stack: Vec<String> = Vec::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                stack.push(String::from_utf8_lossy(e.name().as_ref()).to_string());
            }
            Ok(Event::End(_)) => {
                stack.pop();
            }
            Ok(Event::Text(t)) => {
                if stack.last().map(|s| s.as_str()) == Some("loc") {
                    let text = t.unescape().map_err(|e| e.to_string())?.to_string();
                    let parent = stack.get(stack.len().saturating_sub(2)).cloned().unwrap_or_default();
                    match parent.as_str() {
                        "url" => url_locs.push(text),
                        "sitemap" => nested_sitemaps.push(text),
                        _ => {}
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.to_string()),
            _ => {}
        }
        buf.clear();
    }

    Ok(ParsedSitemap { url_locs, nested_sitemaps })
}

/// Extracts the path component of a sitemap `loc`, ignoring host and query.
fn path_of(loc: &str) -> Option<String> {
    url::Url::parse(loc).ok().map(|u| u.path().to_string())
}

/// Spawns the discovery task: waits `initial_delay`, runs one pass, then
/// ticks at `rediscover_every` if it's non-zero.
pub fn spawn_discovery_task(
    discoverer: Arc<SitemapDiscoverer>,
    rules: Arc<RuleEngine>,
    ram: Arc<RamTier>,
    disk: Arc<DiskTier>,
    mut stop: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    let initial_delay = discoverer.config.initial_delay;
    let rediscover_every = discoverer.config.rediscover_every;

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(initial_delay) => {}
            _ = stop.changed() => return,
        }

        discoverer.discover_once(&rules, &ram, &disk).await;

        if rediscover_every.is_zero() {
            return;
        }

        let mut ticker = tokio::time::interval(rediscover_every);
        ticker.tick().await; // consume the immediate first tick
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    discoverer.discover_once(&rules, &ram, &disk).await;
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_urlset() {
        let xml = br#"<?xml version="1.0"?>
        <urlset><url><loc>https://example.com/a</loc></url><url><loc>https://example.com/b</loc></url></urlset>"#;
        let doc = parse_sitemap(xml).unwrap();
        assert_eq!(doc.url_locs, vec!["https://example.com/a", "https://example.com/b"]);
        assert!(doc.nested_sitemaps.is_empty());
    }

    #[test]
    fn parses_sitemapindex() {
        let xml = br#"<sitemapindex><sitemap><loc>https://example.com/sub.xml</loc></sitemap></sitemapindex>"#;
        let doc = parse_sitemap(xml).unwrap();
        assert!(doc.url_locs.is_empty());
        assert_eq!(doc.nested_sitemaps, vec!["https://example.com/sub.xml"]);
    }

    #[test]
    fn path_of_strips_host_and_query() {
        assert_eq!(path_of("https://example.com/a/b?x=1#f").unwrap(), "/a/b");
    }

    #[test]
    fn decompress_passthrough_for_plain_body() {
        let body = b"<urlset></urlset>";
        let out = decompress_if_needed(body, false).unwrap();
        assert_eq!(out, body);
    }

    #[test]
    fn normalize_relative_sitemap_path() {
        let discoverer = SitemapDiscoverer::new(
            reqwest::Client::new(),
            "http://origin.example".to_string(),
            SitemapConfig {
                initial_delay: Duration::ZERO,
                rediscover_every: Duration::ZERO,
                sitemaps: Vec::new(),
                log_url_autodiscover: false,
            },
        );
        assert_eq!(discoverer.normalize("/sitemap.xml"), "http://origin.example/sitemap.xml");
        assert_eq!(discoverer.normalize("https://elsewhere.example/s.xml"), "https://elsewhere.example/s.xml");
    }

    #[test]
    fn log_enabled_follows_config_flag() {
        let discoverer_off = SitemapDiscoverer::new(
            reqwest::Client::new(),
            "http://origin.example".to_string(),
            SitemapConfig { initial_delay: Duration::ZERO, rediscover_every: Duration::ZERO, sitemaps: Vec::new(), log_url_autodiscover: false },
        );
        assert!(!discoverer_off.log_enabled());

        let discoverer_on = SitemapDiscoverer::new(
            reqwest::Client::new(),
            "http://origin.example".to_string(),
            SitemapConfig { initial_delay: Duration::ZERO, rediscover_every: Duration::ZERO, sitemaps: Vec::new(), log_url_autodiscover: true },
        );
        assert!(discoverer_on.log_enabled());
    }
}
