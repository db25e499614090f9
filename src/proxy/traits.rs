//! Core types for the offline cache proxy.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use url::Url;

/// Identity of an intercepted request: method plus absolute URL.
///
/// This is the cache key. Headers and bodies are not part of the identity:
/// only GET responses are ever cached, and a GET's identity is its URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
  pub method: Method,
  pub url: Url,
}

impl RequestDescriptor {
  /// Descriptor for a GET of the given URL.
  pub fn get(url: &str) -> Result<Self> {
    Self::new(Method::GET, url)
  }

  pub fn new(method: Method, url: &str) -> Result<Self> {
    let url = Url::parse(url).map_err(|e| eyre!("Invalid request URL {}: {}", url, e))?;
    Ok(Self { method, url })
  }

  pub fn is_get(&self) -> bool {
    self.method == Method::GET
  }

  /// Stable fixed-length store key for this descriptor.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_str().as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_str().as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl std::fmt::Display for RequestDescriptor {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// One intercepted request: the descriptor that identifies it, plus whatever
/// the page attached for passthrough (headers, body). GET requests normally
/// carry neither.
#[derive(Debug, Clone)]
pub struct PageRequest {
  pub descriptor: RequestDescriptor,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
}

impl PageRequest {
  /// A plain GET request for the given URL.
  pub fn get(url: &str) -> Result<Self> {
    Ok(Self {
      descriptor: RequestDescriptor::get(url)?,
      headers: Vec::new(),
      body: None,
    })
  }

  pub fn new(method: Method, url: &str) -> Result<Self> {
    Ok(Self {
      descriptor: RequestDescriptor::new(method, url)?,
      headers: Vec::new(),
      body: None,
    })
  }

  /// Attach a JSON body (and content type) for a write request.
  pub fn with_json<T: serde::Serialize>(mut self, value: &T) -> Result<Self> {
    let body =
      serde_json::to_vec(value).map_err(|e| eyre!("Failed to serialize request body: {}", e))?;
    self
      .headers
      .push(("content-type".to_string(), "application/json".to_string()));
    self.body = Some(body);
    Ok(self)
  }
}

/// An owned copy of a network response: status, headers, body.
///
/// The underlying transport body is a one-shot stream; by the time a snapshot
/// exists it has been fully read, so handing one copy to the page and a clone
/// to the cache writer is safe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseSnapshot {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl ResponseSnapshot {
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// First header value with the given name (case-insensitive).
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  pub fn text(&self) -> Result<String> {
    String::from_utf8(self.body.clone()).map_err(|e| eyre!("Response body is not UTF-8: {}", e))
  }

  pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
    serde_json::from_slice(&self.body)
      .map_err(|e| eyre!("Failed to parse response body as JSON: {}", e))
  }
}

/// Result of a fetch-intercept, including where the response came from.
#[derive(Debug, Clone)]
pub struct ServedResponse {
  /// The response handed back to the page
  pub response: ResponseSnapshot,
  /// Where the response came from
  pub source: ResponseSource,
  /// When the response was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl ServedResponse {
  /// A response served live from the network.
  pub fn from_network(response: ResponseSnapshot) -> Self {
    Self {
      response,
      source: ResponseSource::Network,
      cached_at: None,
    }
  }

  /// A response served from the cache after the network failed.
  pub fn from_cache(response: ResponseSnapshot, cached_at: DateTime<Utc>) -> Self {
    Self {
      response,
      source: ResponseSource::Cache,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Fresh response from the live network
  Network,
  /// Network unreachable, served from the cache store
  Cache,
}

/// A live network fetcher.
///
/// Implementations resolve with a snapshot for *any* HTTP status, 4xx and
/// 5xx included, and return an error only on transport failure (connect,
/// DNS, body read). The proxy's fallback path keys on exactly this boundary.
#[async_trait]
pub trait Fetch: Send + Sync {
  async fn fetch(&self, request: &PageRequest) -> Result<ResponseSnapshot>;
}
