//! Request handler (§4.7): the stale-while-revalidate serving protocol that
//! ties the rule engine, both cache tiers, and the origin fetcher together.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::Response;
use tracing::{debug, warn};

use crate::app::AppState;
use crate::coalesce::{AcquireResult, CoalescedResponse};
use crate::entry::{now_unix, CacheEntry, DiscoveredBy, HeaderMultiMap};
use crate::origin::{is_cacheable, StatusKind};
use crate::rules::{has_any_cookie, is_stale};

const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// The `X-Wait0` tag stamped on every response (§6).
const TAG_HIT: &str = "hit";
const TAG_MISS: &str = "miss";
const TAG_BYPASS: &str = "bypass";
const TAG_IGNORE_BY_COOKIE: &str = "ignore-by-cookie";
const TAG_IGNORE_BY_STATUS: &str = "ignore-by-status";
const TAG_BAD_GATEWAY: &str = "bad-gateway";

pub async fn handle_request(State(state): State<Arc<AppState>>, req: Request) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let raw_query = req.uri().query().unwrap_or("").to_string();
    let headers = req.headers().clone();

    let cookie_header = headers.get(axum::http::header::COOKIE).and_then(|v| v.to_str().ok());
    let forwarded: Vec<(String, String)> = headers
        .iter()
        .filter_map(|(n, v)| v.to_str().ok().map(|v| (n.to_string(), v.to_string())))
        .collect();

    let rule = state.rule_engine.pick(&path).cloned();

    let Some(rule) = rule else {
        return proxy_pass(&state, &method, &path, &raw_query, &forwarded, req, TAG_BYPASS).await;
    };

    if rule.bypass {
        return proxy_pass(&state, &method, &path, &raw_query, &forwarded, req, TAG_BYPASS).await;
    }

    if has_any_cookie(cookie_header, &rule.bypass_when_cookies) {
        return proxy_pass(&state, &method, &path, &raw_query, &forwarded, req, TAG_IGNORE_BY_COOKIE).await;
    }

    if method != Method::GET {
        return proxy_pass(&state, &method, &path, &raw_query, &forwarded, req, TAG_BYPASS).await;
    }

    if let Some(entry) = state.ram.get(&path) {
        maybe_schedule_revalidation(&state, &path, &raw_query, &entry, rule.expiration);
        state.stats.record(entry.body.len() as u64);
        return entry_response(&entry, TAG_HIT);
    }

    if let Some(entry) = state.disk.get(&path).await {
        state.ram.put(&path, entry.clone(), &state.disk).await;
        maybe_schedule_revalidation(&state, &path, &raw_query, &entry, rule.expiration);
        state.stats.record(entry.body.len() as u64);
        return entry_response(&entry, TAG_HIT);
    }

    miss_path(&state, &path, &raw_query, &forwarded).await
}

fn maybe_schedule_revalidation(state: &Arc<AppState>, path: &str, raw_query: &str, entry: &CacheEntry, expiration: std::time::Duration) {
    if expiration.is_zero() || !is_stale(entry.stored_at, now_unix(), expiration) {
        return;
    }
    state.revalidator.try_spawn(
        path.to_string(),
        path.to_string(),
        raw_query.to_string(),
        crate::entry::RevalidatedBy::User,
        Arc::clone(&state.ram),
        Arc::clone(&state.disk),
        Arc::clone(&state.origin),
    );
}

/// The miss path (§4.7 step 7), deduplicated via the request coalescer so
/// concurrent misses for a brand new key result in at most one origin fetch.
async fn miss_path(state: &Arc<AppState>, path: &str, raw_query: &str, forwarded: &[(String, String)]) -> Response {
    match state.coalescer.try_acquire(path) {
        AcquireResult::Fetch(guard) => {
            let fetched = state.origin.fetch(path, raw_query, forwarded).await;

            let fetched = match fetched {
                Ok(f) => f,
                Err(e) => {
                    warn!(path = %path, error = %e, "origin fetch failed on miss path");
                    guard.complete_error(e.to_string());
                    return stamp(StatusCode::BAD_GATEWAY, HeaderMultiMap::new(), Vec::new(), TAG_BAD_GATEWAY);
                }
            };

            if fetched.status_kind == StatusKind::IgnoreByStatus {
                state.ram.delete(path);
                state.disk.delete(path).await;
                let response = stamp(
                    StatusCode::from_u16(fetched.status).unwrap_or(StatusCode::BAD_GATEWAY),
                    fetched.header.clone(),
                    fetched.body.clone(),
                    TAG_IGNORE_BY_STATUS,
                );
                guard.complete(CoalescedResponse { status: fetched.status, header: fetched.header, body: fetched.body, tag: TAG_IGNORE_BY_STATUS });
                return response;
            }

            if !fetched.cacheable {
                let response = stamp(
                    StatusCode::from_u16(fetched.status).unwrap_or(StatusCode::OK),
                    fetched.header.clone(),
                    fetched.body.clone(),
                    TAG_BYPASS,
                );
                guard.complete(CoalescedResponse { status: fetched.status, header: fetched.header, body: fetched.body, tag: TAG_BYPASS });
                return response;
            }

            let entry = CacheEntry::new_active(fetched.status, fetched.header, fetched.body, DiscoveredBy::User);
            state.ram.put(path, entry.clone(), &state.disk).await;
            state.disk.put_async(path.to_string(), entry.clone()).await;
            state.stats.record(entry.body.len() as u64);

            let response = entry_response(&entry, TAG_MISS);
            guard.complete(CoalescedResponse { status: entry.status, header: entry.header.clone(), body: entry.body.clone(), tag: TAG_MISS });
            response
        }
        AcquireResult::Wait(mut rx) => match rx.recv().await {
            Ok(Ok(shared)) => stamp(
                StatusCode::from_u16(shared.status).unwrap_or(StatusCode::OK),
                shared.header,
                shared.body,
                shared.tag,
            ),
            Ok(Err(_)) | Err(_) => stamp(StatusCode::BAD_GATEWAY, HeaderMultiMap::new(), Vec::new(), TAG_BAD_GATEWAY),
        },
    }
}

/// Forwards `req` to origin verbatim and relays the response, for bypass /
/// cookie-bypass / non-GET paths. Never touches either cache tier.
async fn proxy_pass(
    state: &Arc<AppState>,
    method: &Method,
    path: &str,
    raw_query: &str,
    forwarded: &[(String, String)],
    req: Request,
    tag: &'static str,
) -> Response {
    let body = match to_bytes(req.into_body(), MAX_BODY_BYTES).await {
        Ok(b) => b.to_vec(),
        Err(_) => Vec::new(),
    };

    match state.origin.proxy_pass(method.clone(), path, raw_query, forwarded, body).await {
        Ok(fetched) => stamp(StatusCode::from_u16(fetched.status).unwrap_or(StatusCode::OK), fetched.header, fetched.body, tag),
        Err(e) => {
            debug!(path = %path, error = %e, "proxy-pass origin fetch failed");
            stamp(StatusCode::BAD_GATEWAY, HeaderMultiMap::new(), Vec::new(), TAG_BAD_GATEWAY)
        }
    }
}

fn entry_response(entry: &CacheEntry, tag: &'static str) -> Response {
    stamp(StatusCode::from_u16(entry.status).unwrap_or(StatusCode::OK), entry.header.clone(), entry.body.clone(), tag)
}

/// Builds the outgoing response: copies stored/origin headers verbatim
/// (except `Content-Length`, regenerated by the HTTP writer), stamps
/// `X-Wait0`, and merges `Access-Control-Expose-Headers` without
/// duplicating `X-Wait0` if already present (§4.7, §6).
fn stamp(status: StatusCode, header: HeaderMultiMap, body: Vec<u8>, tag: &'static str) -> Response {
    let mut headers = HeaderMap::new();
    for (name, values) in header.iter() {
        if name == "content-length" {
            continue;
        }
        let Ok(header_name) = HeaderName::try_from(name.as_str()) else {
            continue;
        };
        for value in values {
            if let Ok(header_value) = HeaderValue::from_str(value) {
                headers.append(header_name.clone(), header_value);
            }
        }
    }

    headers.insert("x-wait0", HeaderValue::from_static(tag));
    merge_expose_headers(&mut headers);

    let mut builder = Response::builder().status(status);
    *builder.headers_mut().unwrap() = headers;
    builder.body(Body::from(body)).unwrap_or_else(|_| Response::new(Body::empty()))
}

fn merge_expose_headers(headers: &mut HeaderMap) {
    const NAME: &str = "access-control-expose-headers";
    let existing = headers
        .get(NAME)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let merged = match existing {
        None => "X-Wait0".to_string(),
        Some(existing) => {
            let already_present = existing.split(',').any(|h| h.trim().eq_ignore_ascii_case("x-wait0"));
            if already_present {
                existing
            } else {
                format!("{existing}, X-Wait0")
            }
        }
    };

    if let Ok(value) = HeaderValue::from_str(&merged) {
        headers.insert(NAME, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_expose_headers_adds_when_absent() {
        let mut headers = HeaderMap::new();
        merge_expose_headers(&mut headers);
        assert_eq!(headers.get("access-control-expose-headers").unwrap(), "X-Wait0");
    }

    #[test]
    fn merge_expose_headers_appends_without_duplicating() {
        let mut headers = HeaderMap::new();
        headers.insert("access-control-expose-headers", HeaderValue::from_static("X-Custom"));
        merge_expose_headers(&mut headers);
        assert_eq!(headers.get("access-control-expose-headers").unwrap(), "X-Custom, X-Wait0");

        merge_expose_headers(&mut headers);
        let value = headers.get("access-control-expose-headers").unwrap().to_str().unwrap();
        assert_eq!(value.matches("X-Wait0").count(), 1, "must not duplicate");
    }

    #[test]
    fn stamp_strips_content_length() {
        let mut header = HeaderMultiMap::new();
        header.push("Content-Length", "100".to_string());
        header.push("Content-Type", "text/plain".to_string());
        let response = stamp(StatusCode::OK, header, b"hi".to_vec(), TAG_HIT);
        assert!(response.headers().get("content-length").is_none());
        assert_eq!(response.headers().get("x-wait0").unwrap(), "hit");
    }
}
