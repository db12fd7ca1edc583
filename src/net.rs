//! Request/response snapshots and the network seam every outbound fetch goes through.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;

/// Response header carrying the time a snapshot was written to a partition.
pub const CACHED_AT_HEADER: &str = "x-cached-at";

/// Request header asking for the network result instead of a stale cached copy.
pub const FORCE_REFRESH_HEADER: &str = "x-force-refresh";

/// Errors surfaced by the network layer.
#[derive(Debug, Clone, Error)]
pub enum NetworkError {
  #[error("network unreachable: {0}")]
  Unreachable(String),
  #[error("failed to read response body: {0}")]
  Body(String),
  #[error("invalid url '{url}': {reason}")]
  InvalidUrl { url: String, reason: String },
}

/// An outbound request. Identity for caching purposes is `(method, url)`.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: HeaderMap,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: HeaderMap::new(),
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  /// Build a GET request, resolving `url` against `base` when it is relative.
  pub fn get_relative(base: &Url, url: &str) -> Result<Self, NetworkError> {
    base
      .join(url)
      .map(Self::get)
      .map_err(|e| NetworkError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
      })
  }

  pub fn with_header(mut self, name: HeaderName, value: &str) -> Self {
    if let Ok(value) = HeaderValue::from_str(value) {
      self.headers.insert(name, value);
    }
    self
  }

  /// Mark this request as a document navigation.
  pub fn accept_html(self) -> Self {
    self.with_header(ACCEPT, "text/html,application/xhtml+xml")
  }

  pub fn force_refresh(self) -> Self {
    self.with_header(HeaderName::from_static(FORCE_REFRESH_HEADER), "1")
  }

  /// Whether the caller would render an HTML document from this request.
  pub fn wants_html(&self) -> bool {
    self
      .headers
      .get(ACCEPT)
      .and_then(|v| v.to_str().ok())
      .is_some_and(|v| v.contains("text/html"))
  }

  pub fn is_forced(&self) -> bool {
    self.headers.contains_key(FORCE_REFRESH_HEADER)
  }

  /// Stable key for the exact request identity.
  pub fn cache_key(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_str().as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_str().as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// A response snapshot. Once written to a partition it is never patched, only replaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn html(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self::new(status, body).with_header(CONTENT_TYPE.as_str(), "text/html; charset=utf-8")
  }

  /// Only 200 responses are eligible for caching.
  pub fn is_ok(&self) -> bool {
    self.status == 200
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// Set a header, replacing any existing value with the same name.
  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  /// Copy of this response carrying its capture timestamp.
  pub fn stamped(&self, at: DateTime<Utc>) -> Self {
    self.clone().with_header(CACHED_AT_HEADER, &at.to_rfc3339())
  }

  pub fn cached_at(&self) -> Option<DateTime<Utc>> {
    self
      .header(CACHED_AT_HEADER)
      .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
      .map(|dt| dt.with_timezone(&Utc))
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

/// Whether the URL's host belongs to one of the allowlisted remote hosts (substring match).
pub fn is_remote_host(remote_hosts: &[String], url: &Url) -> bool {
  url
    .host_str()
    .is_some_and(|host| remote_hosts.iter().any(|h| host.contains(h.as_str())))
}

/// Anything able to perform a request against the real network.
#[async_trait]
pub trait Network: Send + Sync + 'static {
  async fn fetch(&self, request: &Request) -> Result<Response, NetworkError>;
}

/// reqwest-backed network access.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
  remote_hosts: Vec<String>,
  api_key: Option<String>,
}

impl HttpNetwork {
  pub fn new(remote_hosts: Vec<String>, api_key: Option<String>) -> color_eyre::Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("kiosk-cache/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| color_eyre::eyre::eyre!("Failed to build HTTP client: {}", e))?;

    Ok(Self {
      client,
      remote_hosts,
      api_key,
    })
  }

  /// The API key is only ever sent to the remote data host.
  fn api_key_for(&self, url: &Url) -> Option<&str> {
    if is_remote_host(&self.remote_hosts, url) {
      self.api_key.as_deref()
    } else {
      None
    }
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
    let mut headers = request.headers.clone();
    headers.remove(FORCE_REFRESH_HEADER);

    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone())
      .headers(headers);
    if let Some(key) = self.api_key_for(&request.url) {
      builder = builder.header("apikey", key).bearer_auth(key);
    }

    let response = builder
      .send()
      .await
      .map_err(|e| NetworkError::Unreachable(e.to_string()))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response
      .bytes()
      .await
      .map_err(|e| NetworkError::Body(e.to_string()))?
      .to_vec();

    Ok(Response {
      status,
      headers,
      body,
    })
  }
}
