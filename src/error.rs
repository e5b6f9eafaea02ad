//! Error taxonomy (§7). Variants name *kinds*, matching the teacher's
//! `CdnError` shape: a status-code mapping for anything that can reach the
//! request path, plus `From` impls for the external failure types we wrap.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("cannot bind listener: {0}")]
    Listen(#[source] std::io::Error),

    #[error("origin fetch failed: {0}")]
    OriginFetch(String),

    #[error("origin returned non-2xx status {0}")]
    OriginNon2xx(u16),

    #[error("response is not cacheable")]
    NonCacheable,

    #[error("cache tier overflow: {0}")]
    CacheOverflow(String),

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("malformed sitemap: {0}")]
    MalformedSitemap(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::OriginFetch(_) | Error::OriginNon2xx(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, self.to_string()).into_response()
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::OriginFetch(e.to_string())
    }
}

impl From<sled::Error> for Error {
    fn from(e: sled::Error) -> Self {
        Error::Persistence(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Persistence(e.to_string())
    }
}
