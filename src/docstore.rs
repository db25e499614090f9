//! Remote document-store collaborator.
//!
//! The store is a plain keyed document collection reached over HTTP:
//! `GET {base}/{collection}/{id}` returns the document or 404, and
//! `PUT {base}/{collection}/{id}` replaces it. All traffic is routed through
//! the offline cache proxy, so reads stay available offline while writes pass
//! through uncached.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde_json::Value;
use std::sync::Arc;
use url::Url;

use crate::proxy::{CacheStore, Fetch, OfflineCacheProxy, PageRequest};

/// Narrow interface to the remote document store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
  /// Fetch a document, or `None` if it does not exist.
  async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>>;

  /// Create or replace a document.
  async fn set(&self, collection: &str, id: &str, document: &Value) -> Result<()>;
}

/// Document store reached through the offline cache proxy.
pub struct ProxiedDocumentStore<S: CacheStore, F: Fetch> {
  proxy: Arc<OfflineCacheProxy<S, F>>,
  base_url: Url,
}

impl<S: CacheStore, F: Fetch + 'static> ProxiedDocumentStore<S, F> {
  pub fn new(proxy: Arc<OfflineCacheProxy<S, F>>, mut base_url: Url) -> Self {
    // A trailing slash makes Url::join treat the base as a directory
    if !base_url.path().ends_with('/') {
      base_url.set_path(&format!("{}/", base_url.path()));
    }

    Self { proxy, base_url }
  }

  fn document_url(&self, collection: &str, id: &str) -> Result<Url> {
    self
      .base_url
      .join(&format!("{}/{}", collection, id))
      .map_err(|e| eyre!("Invalid document path {}/{}: {}", collection, id, e))
  }
}

#[async_trait]
impl<S: CacheStore, F: Fetch + 'static> DocumentStore for ProxiedDocumentStore<S, F> {
  async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
    let url = self.document_url(collection, id)?;
    let request = PageRequest::get(url.as_str())?;

    let served = self.proxy.fetch_intercept(&request).await?;

    if served.response.status == 404 {
      return Ok(None);
    }
    if !served.response.is_success() {
      return Err(eyre!(
        "Document store returned status {} for {}/{}",
        served.response.status,
        collection,
        id
      ));
    }

    Ok(Some(served.response.json()?))
  }

  async fn set(&self, collection: &str, id: &str, document: &Value) -> Result<()> {
    let url = self.document_url(collection, id)?;
    let request = PageRequest::new(Method::PUT, url.as_str())?.with_json(document)?;

    let served = self.proxy.fetch_intercept(&request).await?;

    if !served.response.is_success() {
      return Err(eyre!(
        "Document store rejected write to {}/{} with status {}",
        collection,
        id,
        served.response.status
      ));
    }

    Ok(())
  }
}
