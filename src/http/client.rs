use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::time::Duration;

use super::{is_hop_by_hop, Request, Response};

/// Why a request never produced a response.
///
/// An HTTP error status is not a fetch error: it comes back as a `Response`
/// whose `is_ok()` is false, exactly like the Fetch API.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
  #[error("Network error: {0}")]
  Network(String),

  #[error("Request timed out: {0}")]
  Timeout(String),
}

/// Anything that can turn a request into a live response.
#[async_trait]
pub trait Fetcher: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError>;
}

/// Network fetcher backed by reqwest.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .redirect(reqwest::redirect::Policy::none())
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());

    // reqwest negotiates the encodings it can decode itself
    for (name, value) in &request.headers {
      if !is_hop_by_hop(name) && !name.eq_ignore_ascii_case("accept-encoding") {
        builder = builder.header(name.as_str(), value.as_str());
      }
    }
    if !request.body.is_empty() {
      builder = builder.body(request.body.clone());
    }

    let response = builder.send().await.map_err(into_fetch_error)?;
    let status = response.status().as_u16();

    // reqwest drops content-encoding itself when it decodes the body
    let headers = response
      .headers()
      .iter()
      .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = response.bytes().await.map_err(into_fetch_error)?;

    Ok(Response {
      status,
      headers,
      body: body.to_vec(),
    })
  }
}

fn into_fetch_error(e: reqwest::Error) -> FetchError {
  if e.is_timeout() {
    FetchError::Timeout(e.to_string())
  } else {
    FetchError::Network(e.to_string())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use axum::{http::HeaderMap, routing::get, Router};
  use url::Url;

  /// Serve `app` on an ephemeral local port and return its base URL.
  async fn spawn(app: Router) -> Url {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      axum::serve(listener, app).await.unwrap();
    });
    Url::parse(&format!("http://{}/", addr)).unwrap()
  }

  #[tokio::test]
  async fn test_undecoded_body_keeps_its_encoding() {
    let base = spawn(Router::new().route(
      "/font.woff2",
      get(|| async { ([("content-encoding", "br")], vec![0x8bu8, 0x02, 0x80, 0x68, 0x69]) }),
    ))
    .await;

    let fetcher = HttpFetcher::new(Duration::from_secs(5)).unwrap();
    let response = fetcher
      .fetch(&Request::get(base.join("/font.woff2").unwrap()))
      .await
      .unwrap();

    assert_eq!(response.header("content-encoding"), Some("br"));
    assert_eq!(response.body, vec![0x8b, 0x02, 0x80, 0x68, 0x69]);
  }

  #[tokio::test]
  async fn test_browser_accept_encoding_is_not_forwarded() {
    let base = spawn(Router::new().route(
      "/",
      get(|headers: HeaderMap| async move {
        headers
          .get("accept-encoding")
          .and_then(|v| v.to_str().ok())
          .unwrap_or("")
          .to_string()
      }),
    ))
    .await;

    let fetcher = HttpFetcher::new(Duration::from_secs(5)).unwrap();
    let request = Request::get(base).with_header("accept-encoding", "gzip, deflate, br, zstd");
    let response = fetcher.fetch(&request).await.unwrap();

    let seen = String::from_utf8(response.body).unwrap();
    assert!(!seen.contains("br"), "{}", seen);
    assert!(!seen.contains("zstd"), "{}", seen);
  }
}
