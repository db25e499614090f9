use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::Client;

use crate::proxy::{Fetch, PageRequest, ResponseSnapshot};

/// Live network fetcher backed by reqwest.
#[derive(Clone)]
pub struct HttpFetcher {
  client: Client,
}

impl HttpFetcher {
  pub fn new() -> Result<Self> {
    let client = Client::builder()
      .user_agent(concat!("liftlog/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Fetch for HttpFetcher {
  /// Issue the request against the live network.
  ///
  /// Any HTTP status resolves to a snapshot; only transport failures
  /// (connect, DNS, body read) are errors. The proxy's cache fallback keys
  /// on that distinction.
  async fn fetch(&self, request: &PageRequest) -> Result<ResponseSnapshot> {
    let mut builder = self
      .client
      .request(request.descriptor.method.clone(), request.descriptor.url.clone());

    for (name, value) in &request.headers {
      builder = builder.header(name, value);
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Network request for {} failed: {}", request.descriptor.url, e))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .map(|(name, value)| {
        (
          name.as_str().to_string(),
          String::from_utf8_lossy(value.as_bytes()).into_owned(),
        )
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read response body from {}: {}", request.descriptor.url, e))?
      .to_vec();

    Ok(ResponseSnapshot {
      status,
      headers,
      body,
    })
  }
}
