//! Search backend seam and the HTTP transport it runs on.
//!
//! Backends are synchronous (the worker drives them from blocking tool code);
//! the transport is a trait so tests exercise the full classification matrix
//! without network access.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

use crate::web::errors::WebError;

#[derive(Clone, Debug, Serialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

pub trait SearchBackend: Send + Sync {
    fn backend_id(&self) -> &'static str;

    fn search(
        &self,
        query: &str,
        max_results: usize,
        timeout_ms: u64,
    ) -> Result<Vec<SearchResult>, WebError>;

    /// Best-effort shutdown; errors are swallowed.
    fn close(&self) {}
}

/// Minimal response view the backends need.
#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
    pub final_url: String,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("network: {0}")]
    Network(String),
}

impl From<TransportError> for WebError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Timeout(m) => WebError::Timeout(truncate(&m)),
            TransportError::Network(m) => WebError::Network(truncate(&m)),
        }
    }
}

fn truncate(s: &str) -> String {
    s.chars().take(500).collect()
}

/// One GET with explicit redirect policy.
pub trait HttpTransport: Send + Sync {
    fn get(
        &self,
        url: &str,
        headers: &[(String, String)],
        follow_redirects: bool,
        timeout: Duration,
    ) -> Result<HttpResponse, TransportError>;
}

/// Production transport on a blocking reqwest client; one client per call
/// configuration is avoided by keying on redirect policy.
pub struct ReqwestTransport {
    proxy: Option<String>,
}

impl ReqwestTransport {
    pub fn new(proxy: Option<String>) -> Self {
        Self { proxy }
    }

    fn client(
        &self,
        follow_redirects: bool,
        timeout: Duration,
    ) -> Result<reqwest::blocking::Client, TransportError> {
        let mut builder = reqwest::blocking::Client::builder().timeout(timeout).redirect(
            if follow_redirects {
                reqwest::redirect::Policy::limited(5)
            } else {
                reqwest::redirect::Policy::none()
            },
        );
        if let Some(proxy) = &self.proxy {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| TransportError::Network(e.to_string()))?;
            builder = builder.proxy(proxy);
        }
        builder.build().map_err(|e| TransportError::Network(e.to_string()))
    }
}

impl HttpTransport for ReqwestTransport {
    fn get(
        &self,
        url: &str,
        headers: &[(String, String)],
        follow_redirects: bool,
        timeout: Duration,
    ) -> Result<HttpResponse, TransportError> {
        let client = self.client(follow_redirects, timeout)?;
        let mut request = client.get(url);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        let response = request.send().map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(e.to_string())
            } else {
                TransportError::Network(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let mut header_map = HashMap::new();
        for (name, value) in response.headers() {
            if let Ok(v) = value.to_str() {
                header_map.insert(name.as_str().to_lowercase(), v.to_string());
            }
        }
        let body = response
            .text()
            .map_err(|e| TransportError::Network(e.to_string()))?;
        Ok(HttpResponse {
            status,
            headers: header_map,
            body,
            final_url,
        })
    }
}

/// Offline backend returning deterministic synthetic results.
pub struct StubSearchBackend;

impl SearchBackend for StubSearchBackend {
    fn backend_id(&self) -> &'static str {
        "stub"
    }

    fn search(
        &self,
        query: &str,
        max_results: usize,
        _timeout_ms: u64,
    ) -> Result<Vec<SearchResult>, WebError> {
        Ok((0..max_results.clamp(1, 3))
            .map(|i| SearchResult {
                title: format!("Stub result {} for '{query}'", i + 1),
                url: format!("https://example.invalid/{}", i + 1),
                snippet: format!("Synthetic snippet {} about {query}.", i + 1),
            })
            .collect())
    }
}

/// Build the configured backend. Backends this build does not ship fall back
/// to the stub with a warning.
pub fn build_search_backend_from_env() -> Box<dyn SearchBackend> {
    use config::WebSearchBackend::*;
    match config::web_search_backend() {
        Stub => Box::new(StubSearchBackend),
        BaiduHtml => Box::new(crate::web::baidu_html::BaiduHtmlSearchBackend::from_env()),
        other => {
            warn!(
                backend = other.as_str(),
                "search backend not built in, falling back to stub"
            );
            Box::new(StubSearchBackend)
        }
    }
}
