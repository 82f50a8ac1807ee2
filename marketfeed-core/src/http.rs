//! Generic JSON-over-HTTP adapter.
//!
//! Handles the plumbing shared by exchange-style endpoints: default headers,
//! a session warm-up request whose cookies are replayed, per-source timeouts
//! and mapping HTTP failures onto [`FailureReason`]. Building the request URL
//! and picking the payload out of the response stay with the caller.

use crate::adapter::{AdapterOutcome, FetcherAdapter};
use crate::query::QueryKey;
use crate::registry::{SourceConfig, SourceSpec};
use crate::result::FailureReason;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::StatusCode;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Mutex, PoisonError};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

type UrlBuilder = dyn Fn(&SourceConfig, &QueryKey) -> Option<String> + Send + Sync;
type Extractor = dyn Fn(Value, &QueryKey) -> Result<Value, FailureReason> + Send + Sync;

/// Adapter for sources that answer a GET with a JSON document.
pub struct HttpJsonAdapter {
    client: Client,
    url_for: Box<UrlBuilder>,
    extract: Box<Extractor>,
    warmed: Mutex<HashSet<String>>,
}

impl HttpJsonAdapter {
    /// `url_for` returns `None` when the source cannot serve the key, which
    /// is reported as [`FailureReason::NotFound`].
    pub fn new<U>(url_for: U) -> Result<Self, reqwest::Error>
    where
        U: Fn(&SourceConfig, &QueryKey) -> Option<String> + Send + Sync + 'static,
    {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .cookie_store(true)
            .build()?;
        Ok(Self {
            client,
            url_for: Box::new(url_for),
            extract: Box::new(|value, _| Ok(value)),
            warmed: Mutex::new(HashSet::new()),
        })
    }

    /// Post-process the decoded document. The default passes it through.
    pub fn with_extractor<E>(mut self, extract: E) -> Self
    where
        E: Fn(Value, &QueryKey) -> Result<Value, FailureReason> + Send + Sync + 'static,
    {
        self.extract = Box::new(extract);
        self
    }

    fn with_headers(&self, mut req: RequestBuilder, config: &SourceConfig) -> RequestBuilder {
        for (name, value) in &config.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        req
    }

    /// Hit the cookie URL once per session so later requests carry its cookies.
    fn warm_up(&self, source: &SourceSpec) -> Result<(), FailureReason> {
        let config = &source.config;
        if !(config.requires_session || config.requires_cookies) {
            return Ok(());
        }
        let Some(cookie_url) = config.cookie_url.as_deref() else {
            return Ok(());
        };
        if self.is_warm(cookie_url) {
            return Ok(());
        }

        tracing::debug!(source = %source.name, url = cookie_url, "warming up session");
        let resp = self
            .with_headers(self.client.get(cookie_url), config)
            .timeout(source.timeout)
            .send()
            .map_err(transport_failure)?;
        check_status(&resp)?;

        self.warmed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(cookie_url.to_string());
        Ok(())
    }

    fn is_warm(&self, cookie_url: &str) -> bool {
        self.warmed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(cookie_url)
    }

    /// Forget warmed sessions so the next request re-establishes cookies.
    pub fn reset_sessions(&self) {
        self.warmed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl FetcherAdapter for HttpJsonAdapter {
    fn fetch(&self, key: &QueryKey, source: &SourceSpec) -> AdapterOutcome {
        let url = (self.url_for)(&source.config, key).ok_or(FailureReason::NotFound)?;
        self.warm_up(source)?;

        let resp = self
            .with_headers(self.client.get(&url), &source.config)
            .timeout(source.timeout)
            .send()
            .map_err(transport_failure)?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            // Stale session cookies; warm up again on the next attempt.
            self.reset_sessions();
        }
        check_status(&resp)?;

        let body: Value = resp
            .json()
            .map_err(|e| FailureReason::ParseError(format!("invalid JSON from {url}: {e}")))?;
        (self.extract)(body, key)
    }
}

impl fmt::Debug for HttpJsonAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpJsonAdapter").finish_non_exhaustive()
    }
}

fn check_status(resp: &Response) -> Result<(), FailureReason> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    Err(match status {
        StatusCode::NOT_FOUND => FailureReason::NotFound,
        StatusCode::TOO_MANY_REQUESTS => FailureReason::RateLimited {
            retry_after_secs: retry_after(resp),
        },
        // Exchanges answer a blocked client with 403.
        StatusCode::FORBIDDEN => FailureReason::RateLimited {
            retry_after_secs: None,
        },
        other => FailureReason::TransportError(format!("HTTP {other} from {}", resp.url())),
    })
}

fn retry_after(resp: &Response) -> Option<u64> {
    resp.headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

fn transport_failure(err: reqwest::Error) -> FailureReason {
    if err.is_timeout() {
        FailureReason::Timeout
    } else {
        FailureReason::TransportError(err.to_string())
    }
}

/// Joins `base_url` and a path, tolerating a trailing slash on the base.
pub fn join_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_url_handles_slashes() {
        assert_eq!(join_url("https://x.test/", "/api/q"), "https://x.test/api/q");
        assert_eq!(join_url("https://x.test", "api/q"), "https://x.test/api/q");
    }

    #[test]
    fn unservable_key_is_not_found() {
        let adapter = HttpJsonAdapter::new(|_, _| None).unwrap();
        let out = adapter.fetch(&"TCS".into(), &SourceSpec::new("nse_api", 2));
        assert_eq!(out, Err(FailureReason::NotFound));
    }
}
