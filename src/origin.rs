//! Origin fetcher: performs the upstream GET and normalizes the result
//! (§4.6). Single configured origin — no multi-origin virtual hosting.

use std::time::Duration;

use reqwest::{header, Client};
use tracing::debug;

use crate::entry::HeaderMultiMap;
use crate::error::Error;

/// Whether the origin's status makes the response eligible at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Ok,
    IgnoreByStatus,
}

/// Normalized origin response plus its cacheability classification.
#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: u16,
    pub header: HeaderMultiMap,
    pub body: Vec<u8>,
    pub status_kind: StatusKind,
    /// See the module doc on [`is_cacheable`] for the (intentionally
    /// inverted) semantics this implements.
    pub cacheable: bool,
}

pub struct OriginFetcher {
    client: Client,
    base_url: String,
    request_timeout: Duration,
}

impl OriginFetcher {
    pub fn new(base_url: String, request_timeout: Duration) -> Result<Self, Error> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build origin HTTP client: {e}")))?;
        Ok(Self { client, base_url, request_timeout })
    }

    /// Builds `origin + path + "?" + raw_query` — query is forwarded to the
    /// upstream request only; the cache key stays path-only (invariant in
    /// §3's Cache key note).
    pub fn build_url(&self, path: &str, raw_query: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        let path = if path.starts_with('/') { path.to_string() } else { format!("/{path}") };
        if raw_query.is_empty() {
            format!("{base}{path}")
        } else {
            format!("{base}{path}?{raw_query}")
        }
    }

    /// Performs the GET, forcing `Accept-Encoding: identity` so the body is
    /// stored raw, and forwards request headers except `Host`.
    pub async fn fetch(
        &self,
        path: &str,
        raw_query: &str,
        forwarded_headers: &[(String, String)],
    ) -> Result<FetchedResponse, Error> {
        let url = self.build_url(path, raw_query);

        let mut req = self.client.get(&url).timeout(self.request_timeout).header(header::ACCEPT_ENCODING, "identity");
        for (name, value) in forwarded_headers {
            if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("accept-encoding") {
                continue;
            }
            req = req.header(name.as_str(), value.as_str());
        }

        let response = req.send().await?;
        let status = response.status().as_u16();

        let mut header = HeaderMultiMap::new();
        for (name, value) in response.headers().iter() {
            if let Ok(v) = value.to_str() {
                header.push(name.as_str(), v.to_string());
            }
        }

        let body = response.bytes().await?.to_vec();

        debug!(url = %url, status, body_len = body.len(), "origin fetch complete");

        let status_kind = if (200..300).contains(&status) { StatusKind::Ok } else { StatusKind::IgnoreByStatus };
        let cacheable = is_cacheable(&header);

        header.remove("content-length");

        Ok(FetchedResponse { status, header, body, status_kind, cacheable })
    }

    /// Forwards an arbitrary method/body straight through to origin,
    /// unrelated to caching (used for bypass / cookie-bypass / non-GET
    /// requests, which never touch either tier).
    pub async fn proxy_pass(
        &self,
        method: reqwest::Method,
        path: &str,
        raw_query: &str,
        forwarded_headers: &[(String, String)],
        body: Vec<u8>,
    ) -> Result<FetchedResponse, Error> {
        let url = self.build_url(path, raw_query);

        let mut req = self.client.request(method, &url).timeout(self.request_timeout);
        for (name, value) in forwarded_headers {
            if name.eq_ignore_ascii_case("host") {
                continue;
            }
            req = req.header(name.as_str(), value.as_str());
        }
        if !body.is_empty() {
            req = req.body(body);
        }

        let response = req.send().await?;
        let status = response.status().as_u16();

        let mut header = HeaderMultiMap::new();
        for (name, value) in response.headers().iter() {
            if let Ok(v) = value.to_str() {
                header.push(name.as_str(), v.to_string());
            }
        }

        let body = response.bytes().await?.to_vec();
        header.remove("content-length");

        let status_kind = if (200..300).contains(&status) { StatusKind::Ok } else { StatusKind::IgnoreByStatus };
        Ok(FetchedResponse { status, header, body, status_kind, cacheable: false })
    }
}

/// Implements the project's intentionally inverted cache-control semantics
/// (spec.md §4.6, §9 Open Question 1): the presence of `no-cache`,
/// `no-store`, or `max-age=0` marks a response as **dynamic**, and dynamic
/// responses are exactly what this proxy caches. This is the opposite of
/// standard HTTP caching semantics and must not be "fixed" to match it — the
/// whole point of the proxy is caching server-rendered dynamic pages that
/// mark themselves uncacheable for browsers/shared caches.
pub fn is_cacheable(header: &HeaderMultiMap) -> bool {
    let cache_control = header.get_all("cache-control").join(", ").to_ascii_lowercase();
    cache_control.contains("no-store") || cache_control.contains("no-cache") || cache_control.contains("max-age=0")
}
