//! Service-worker style lifecycle for the offline cache proxy.
//!
//! The proxy is a small state machine driven by three externally-triggered
//! phases: install (precache the asset manifest into a fresh generation),
//! activate (purge every other generation), and fetch-intercept (network-first
//! with cache fallback). Each phase is an explicit async method whose future
//! completes only when the phase's work is durably done; this is the
//! `waitUntil` contract made into an ordinary await.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use url::Url;

use super::store::CacheStore;
use super::traits::{Fetch, PageRequest, RequestDescriptor, ResponseSnapshot, ServedResponse};

/// Lifecycle phase of a proxy instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
  /// Freshly constructed; the configured generation is not known to exist
  Uninitialized,
  /// Install finished; the generation is durably precached but not promoted
  Precached,
  /// Activation finished; this generation answers fetch-intercepts
  Current,
}

/// Offline cache proxy: network-first request interception over a versioned
/// cache store.
///
/// The generation label and precache manifest are fixed at construction; a
/// version bump is a new proxy value, not an edit to shared state.
pub struct OfflineCacheProxy<S: CacheStore, F: Fetch> {
  store: Arc<S>,
  fetcher: Arc<F>,
  generation: String,
  precache: Vec<Url>,
  phase: Phase,
  /// Spawned opportunistic cache writes not yet known to have finished
  pending_writes: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: CacheStore, F: Fetch + 'static> OfflineCacheProxy<S, F> {
  pub fn new(store: S, fetcher: F, generation: impl Into<String>, precache: Vec<Url>) -> Self {
    Self {
      store: Arc::new(store),
      fetcher: Arc::new(fetcher),
      generation: generation.into(),
      precache,
      phase: Phase::Uninitialized,
      pending_writes: Mutex::new(Vec::new()),
    }
  }

  pub fn phase(&self) -> Phase {
    self.phase
  }

  pub fn generation(&self) -> &str {
    &self.generation
  }

  /// Install: fetch every manifest URL and store the results under this
  /// proxy's generation, all or nothing.
  ///
  /// Every manifest response must arrive and carry a success status before
  /// anything is written; on any failure the store is left exactly as it
  /// was and the phase stays `Uninitialized`, so a partial precache can
  /// never be promoted.
  pub async fn install(&mut self) -> Result<()> {
    if self.phase != Phase::Uninitialized {
      return Err(eyre!("Install called twice on the same proxy instance"));
    }

    let requests: Vec<PageRequest> = self
      .precache
      .iter()
      .map(|url| PageRequest::get(url.as_str()))
      .collect::<Result<_>>()?;

    let responses = try_join_all(requests.iter().map(|req| self.fetcher.fetch(req)))
      .await
      .map_err(|e| e.wrap_err("Precache fetch failed; install abandoned"))?;

    let mut entries = Vec::with_capacity(requests.len());
    for (request, response) in requests.into_iter().zip(responses) {
      if !response.is_success() {
        return Err(eyre!(
          "Precache fetch for {} returned status {}; install abandoned",
          request.descriptor.url,
          response.status
        ));
      }
      entries.push((request.descriptor, response));
    }

    self.store.add_all(&self.generation, &entries)?;

    info!(
      generation = %self.generation,
      entries = entries.len(),
      "precache installed"
    );
    self.phase = Phase::Precached;

    Ok(())
  }

  /// Activate: delete every generation whose label differs from this one,
  /// then promote this generation to answer fetch-intercepts.
  ///
  /// A failed deletion leaks that generation but does not block promotion;
  /// all deletions are attempted before this returns.
  pub async fn activate(&mut self) -> Result<()> {
    if self.phase != Phase::Precached {
      return Err(eyre!("Activate called before install completed"));
    }

    for label in self.store.list_generations()? {
      if label == self.generation {
        continue;
      }
      if let Err(e) = self.store.delete_generation(&label) {
        warn!(generation = %label, "failed to delete stale generation: {e:#}");
      }
    }

    info!(generation = %self.generation, "generation activated");
    self.phase = Phase::Current;

    Ok(())
  }

  /// Adopt a generation a previous process already installed and promoted,
  /// without refetching the manifest. This is the offline startup path.
  pub fn resume(&mut self) -> Result<()> {
    if self.phase != Phase::Uninitialized {
      return Err(eyre!("Resume called on an already-initialized proxy"));
    }

    let installed = self
      .store
      .list_generations()?
      .iter()
      .any(|g| g == &self.generation);
    if !installed {
      return Err(eyre!(
        "Generation {} is not installed; run install/activate first",
        self.generation
      ));
    }

    self.phase = Phase::Current;
    Ok(())
  }

  /// Fetch-intercept: resolve one request, network-first.
  ///
  /// Non-GET requests pass through to the network untouched: they are not
  /// idempotent, so they are never cached and never served from cache. GET
  /// requests try the live network; on success the response is returned
  /// immediately and a duplicate is written to the cache by a spawned task,
  /// on transport failure the cache is consulted by descriptor.
  pub async fn fetch_intercept(&self, request: &PageRequest) -> Result<ServedResponse> {
    if self.phase != Phase::Current {
      return Err(eyre!(
        "Fetch intercepted before activation completed (phase {:?})",
        self.phase
      ));
    }

    if !request.descriptor.is_get() {
      let response = self.fetcher.fetch(request).await?;
      return Ok(ServedResponse::from_network(response));
    }

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        self.spawn_cache_write(&request.descriptor, response.clone())?;
        Ok(ServedResponse::from_network(response))
      }
      Err(net_err) => match self.store.lookup(&self.generation, &request.descriptor) {
        Ok(Some(cached)) => {
          info!(url = %request.descriptor.url, "network unreachable, served from cache");
          Ok(ServedResponse::from_cache(cached.response, cached.cached_at))
        }
        Ok(None) => Err(net_err.wrap_err(format!(
          "Network failed and no cached response for {}",
          request.descriptor.url
        ))),
        Err(store_err) => {
          // The page observes a plain network failure, never a store error
          warn!(url = %request.descriptor.url, "cache fallback lookup failed: {store_err:#}");
          Err(net_err)
        }
      },
    }
  }

  /// Duplicate a fresh network response into the cache without blocking the
  /// caller. Write failures are logged and swallowed; the response has
  /// already been handed to the page.
  fn spawn_cache_write(&self, descriptor: &RequestDescriptor, response: ResponseSnapshot) -> Result<()> {
    let store = Arc::clone(&self.store);
    let generation = self.generation.clone();
    let descriptor = descriptor.clone();

    let handle = tokio::spawn(async move {
      if let Err(e) = store.put(&generation, &descriptor, &response) {
        warn!(url = %descriptor.url, "opportunistic cache write failed: {e:#}");
      }
    });

    self
      .pending_writes
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?
      .push(handle);

    Ok(())
  }

  /// Wait for every spawned cache write to finish. Callers must reach this
  /// join point before tearing the proxy down, or in-flight writes may be
  /// abandoned.
  pub async fn settle_writes(&self) -> Result<()> {
    let handles: Vec<JoinHandle<()>> = {
      let mut pending = self
        .pending_writes
        .lock()
        .map_err(|e| eyre!("Lock poisoned: {}", e))?;
      pending.drain(..).collect()
    };

    for handle in handles {
      // A panicked write task is already logged by the runtime; nothing to recover
      let _ = handle.await;
    }

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::proxy::store::MemoryStore;
  use crate::proxy::traits::{ResponseSnapshot, ResponseSource};
  use async_trait::async_trait;
  use reqwest::Method;
  use std::collections::HashMap;
  use std::sync::Mutex as StdMutex;

  #[derive(Clone)]
  enum Outcome {
    Respond(ResponseSnapshot),
    Fail,
  }

  /// Fetcher answering from a script, recording every request it sees.
  #[derive(Default)]
  struct ScriptedFetcher {
    outcomes: StdMutex<HashMap<String, Outcome>>,
    log: StdMutex<Vec<(Method, String)>>,
  }

  impl ScriptedFetcher {
    fn respond(&self, url: &str, body: &str) {
      self.outcomes.lock().unwrap().insert(
        url.to_string(),
        Outcome::Respond(ok_snapshot(body)),
      );
    }

    fn respond_with_status(&self, url: &str, status: u16, body: &str) {
      let mut snapshot = ok_snapshot(body);
      snapshot.status = status;
      self
        .outcomes
        .lock()
        .unwrap()
        .insert(url.to_string(), Outcome::Respond(snapshot));
    }

    fn fail(&self, url: &str) {
      self
        .outcomes
        .lock()
        .unwrap()
        .insert(url.to_string(), Outcome::Fail);
    }

    fn requests_seen(&self) -> Vec<(Method, String)> {
      self.log.lock().unwrap().clone()
    }
  }

  #[async_trait]
  impl Fetch for ScriptedFetcher {
    async fn fetch(&self, request: &PageRequest) -> Result<ResponseSnapshot> {
      self.log.lock().unwrap().push((
        request.descriptor.method.clone(),
        request.descriptor.url.to_string(),
      ));

      let outcome = self
        .outcomes
        .lock()
        .unwrap()
        .get(request.descriptor.url.as_str())
        .cloned();

      match outcome {
        Some(Outcome::Respond(snapshot)) => Ok(snapshot),
        Some(Outcome::Fail) | None => Err(eyre!("connection refused")),
      }
    }
  }

  fn ok_snapshot(body: &str) -> ResponseSnapshot {
    ResponseSnapshot {
      status: 200,
      headers: vec![("content-type".to_string(), "text/plain".to_string())],
      body: body.as_bytes().to_vec(),
    }
  }

  fn shell_urls() -> Vec<Url> {
    vec![
      Url::parse("https://liftlog.app/").unwrap(),
      Url::parse("https://liftlog.app/app.js").unwrap(),
    ]
  }

  fn descriptor(url: &str) -> RequestDescriptor {
    RequestDescriptor::get(url).unwrap()
  }

  async fn current_proxy(
    fetcher: ScriptedFetcher,
  ) -> OfflineCacheProxy<MemoryStore, ScriptedFetcher> {
    fetcher.respond("https://liftlog.app/", "shell");
    fetcher.respond("https://liftlog.app/app.js", "js");

    let mut proxy = OfflineCacheProxy::new(MemoryStore::new(), fetcher, "v2", shell_urls());
    proxy.install().await.unwrap();
    proxy.activate().await.unwrap();
    proxy
  }

  #[tokio::test]
  async fn test_install_precaches_manifest() {
    let fetcher = ScriptedFetcher::default();
    let proxy = current_proxy(fetcher).await;

    let cached = proxy
      .store
      .lookup("v2", &descriptor("https://liftlog.app/app.js"))
      .unwrap()
      .unwrap();
    assert_eq!(cached.response.body, b"js");
  }

  #[tokio::test]
  async fn test_failed_install_leaves_store_untouched() {
    let fetcher = ScriptedFetcher::default();
    fetcher.respond("https://liftlog.app/", "shell");
    fetcher.fail("https://liftlog.app/app.js");

    let store = MemoryStore::new();
    store
      .put("v1", &descriptor("https://liftlog.app/"), &ok_snapshot("old"))
      .unwrap();

    let mut proxy = OfflineCacheProxy::new(store, fetcher, "v2", shell_urls());
    assert!(proxy.install().await.is_err());
    assert_eq!(proxy.phase(), Phase::Uninitialized);

    // Previous generation is the only one present, exactly as before
    assert_eq!(proxy.store.list_generations().unwrap(), vec!["v1"]);

    // The partial generation cannot be promoted
    assert!(proxy.activate().await.is_err());
  }

  #[tokio::test]
  async fn test_install_rejects_non_success_status() {
    let fetcher = ScriptedFetcher::default();
    fetcher.respond("https://liftlog.app/", "shell");
    fetcher.respond_with_status("https://liftlog.app/app.js", 404, "not found");

    let mut proxy = OfflineCacheProxy::new(MemoryStore::new(), fetcher, "v2", shell_urls());
    assert!(proxy.install().await.is_err());
    assert!(proxy.store.list_generations().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_activation_leaves_single_generation() {
    let fetcher = ScriptedFetcher::default();
    fetcher.respond("https://liftlog.app/", "shell");
    fetcher.respond("https://liftlog.app/app.js", "js");

    let store = MemoryStore::new();
    store
      .put("v0", &descriptor("https://liftlog.app/"), &ok_snapshot("ancient"))
      .unwrap();
    store
      .put("v1", &descriptor("https://liftlog.app/"), &ok_snapshot("old"))
      .unwrap();

    let mut proxy = OfflineCacheProxy::new(store, fetcher, "v2", shell_urls());
    proxy.install().await.unwrap();
    proxy.activate().await.unwrap();

    // Strictly after activation, only the current label remains
    assert_eq!(proxy.store.list_generations().unwrap(), vec!["v2"]);
    assert_eq!(proxy.phase(), Phase::Current);
  }

  #[tokio::test]
  async fn test_network_first_returns_and_caches_fresh_response() {
    let fetcher = ScriptedFetcher::default();
    let proxy = current_proxy(fetcher).await;

    // The shell URL was precached with "shell"; the network now has newer bytes
    proxy.fetcher.respond("https://liftlog.app/", "shell-v2");

    let request = PageRequest::get("https://liftlog.app/").unwrap();
    let served = proxy.fetch_intercept(&request).await.unwrap();

    assert_eq!(served.source, ResponseSource::Network);
    assert_eq!(served.response.body, b"shell-v2");

    proxy.settle_writes().await.unwrap();

    // Cache now holds the network response byte-for-byte
    let cached = proxy
      .store
      .lookup("v2", &request.descriptor)
      .unwrap()
      .unwrap();
    assert_eq!(cached.response, served.response);
  }

  #[tokio::test]
  async fn test_falls_back_to_cache_on_network_failure() {
    let fetcher = ScriptedFetcher::default();
    let proxy = current_proxy(fetcher).await;

    proxy.fetcher.fail("https://liftlog.app/app.js");

    let request = PageRequest::get("https://liftlog.app/app.js").unwrap();
    let served = proxy.fetch_intercept(&request).await.unwrap();

    assert_eq!(served.source, ResponseSource::Cache);
    assert_eq!(served.response.body, b"js");
    assert!(served.cached_at.is_some());
  }

  #[tokio::test]
  async fn test_network_failure_with_cache_miss_is_an_error() {
    let fetcher = ScriptedFetcher::default();
    let proxy = current_proxy(fetcher).await;

    let request = PageRequest::get("https://liftlog.app/never-seen.css").unwrap();
    assert!(proxy.fetch_intercept(&request).await.is_err());
  }

  #[tokio::test]
  async fn test_non_get_passes_through_and_is_never_cached() {
    let fetcher = ScriptedFetcher::default();
    let proxy = current_proxy(fetcher).await;

    proxy
      .fetcher
      .respond("https://store.example.com/users/amy", "ack");

    let request = PageRequest::new(Method::PUT, "https://store.example.com/users/amy")
      .unwrap()
      .with_json(&serde_json::json!({"clients": []}))
      .unwrap();

    let served = proxy.fetch_intercept(&request).await.unwrap();
    assert_eq!(served.source, ResponseSource::Network);

    proxy.settle_writes().await.unwrap();
    assert!(proxy
      .store
      .lookup("v2", &request.descriptor)
      .unwrap()
      .is_none());

    // The write reached the network
    assert!(proxy
      .fetcher
      .requests_seen()
      .contains(&(Method::PUT, "https://store.example.com/users/amy".to_string())));
  }

  #[tokio::test]
  async fn test_non_get_never_served_from_cache() {
    let fetcher = ScriptedFetcher::default();
    let proxy = current_proxy(fetcher).await;

    // Even with a cached entry under the same URL, a failing POST stays failed
    proxy.fetcher.fail("https://liftlog.app/");
    proxy
      .store
      .put(
        "v2",
        &RequestDescriptor::new(Method::POST, "https://liftlog.app/").unwrap(),
        &ok_snapshot("stale ack"),
      )
      .unwrap();

    let request = PageRequest::new(Method::POST, "https://liftlog.app/").unwrap();
    assert!(proxy.fetch_intercept(&request).await.is_err());
  }

  #[tokio::test]
  async fn test_fetch_before_activation_is_rejected() {
    let fetcher = ScriptedFetcher::default();
    fetcher.respond("https://liftlog.app/", "shell");
    fetcher.respond("https://liftlog.app/app.js", "js");

    let mut proxy = OfflineCacheProxy::new(MemoryStore::new(), fetcher, "v2", shell_urls());
    let request = PageRequest::get("https://liftlog.app/").unwrap();

    assert!(proxy.fetch_intercept(&request).await.is_err());

    proxy.install().await.unwrap();
    assert!(proxy.fetch_intercept(&request).await.is_err());

    proxy.activate().await.unwrap();
    assert!(proxy.fetch_intercept(&request).await.is_ok());
  }

  #[tokio::test]
  async fn test_cache_write_failure_does_not_affect_response() {
    /// Store whose writes always fail after construction.
    struct ReadOnlyStore(MemoryStore);

    impl CacheStore for ReadOnlyStore {
      fn add_all(
        &self,
        generation: &str,
        entries: &[(RequestDescriptor, ResponseSnapshot)],
      ) -> Result<()> {
        self.0.add_all(generation, entries)
      }
      fn put(&self, _: &str, _: &RequestDescriptor, _: &ResponseSnapshot) -> Result<()> {
        Err(eyre!("disk full"))
      }
      fn lookup(
        &self,
        generation: &str,
        request: &RequestDescriptor,
      ) -> Result<Option<crate::proxy::store::CachedResponse>> {
        self.0.lookup(generation, request)
      }
      fn list_generations(&self) -> Result<Vec<String>> {
        self.0.list_generations()
      }
      fn delete_generation(&self, generation: &str) -> Result<bool> {
        self.0.delete_generation(generation)
      }
    }

    let fetcher = ScriptedFetcher::default();
    fetcher.respond("https://liftlog.app/", "shell");
    fetcher.respond("https://liftlog.app/app.js", "js");

    let mut proxy = OfflineCacheProxy::new(
      ReadOnlyStore(MemoryStore::new()),
      fetcher,
      "v2",
      shell_urls(),
    );
    proxy.install().await.unwrap();
    proxy.activate().await.unwrap();

    let request = PageRequest::get("https://liftlog.app/").unwrap();
    let served = proxy.fetch_intercept(&request).await.unwrap();
    assert_eq!(served.response.body, b"shell");

    // The failed opportunistic write settles without surfacing an error
    proxy.settle_writes().await.unwrap();
  }

  #[tokio::test]
  async fn test_resume_adopts_installed_generation() {
    // A previous process installed and promoted v2 into this store
    let store = MemoryStore::new();
    store
      .put("v2", &descriptor("https://liftlog.app/app.js"), &ok_snapshot("js"))
      .unwrap();

    // The next process starts with no connectivity (every fetch fails)
    let offline = ScriptedFetcher::default();
    let mut proxy = OfflineCacheProxy::new(store, offline, "v2", shell_urls());

    proxy.resume().unwrap();
    assert_eq!(proxy.phase(), Phase::Current);

    let request = PageRequest::get("https://liftlog.app/app.js").unwrap();
    let served = proxy.fetch_intercept(&request).await.unwrap();
    assert_eq!(served.source, ResponseSource::Cache);
    assert_eq!(served.response.body, b"js");
  }

  #[tokio::test]
  async fn test_resume_requires_installed_generation() {
    let fetcher = ScriptedFetcher::default();
    let mut proxy = OfflineCacheProxy::new(MemoryStore::new(), fetcher, "v2", shell_urls());
    assert!(proxy.resume().is_err());
  }
}
