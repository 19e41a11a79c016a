//! Request/response model shared by the controller, the storage backends and the proxy.
//!
//! These types are deliberately transport-agnostic: the proxy converts axum requests
//! into them, the fetcher converts them into reqwest requests, and tests build them by hand.

pub mod client;

pub use client::{FetchError, Fetcher, HttpFetcher};
pub use reqwest::Method;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::cache::RequestKey;

/// Headers that describe a single connection and must not be forwarded or stored.
const HOP_BY_HOP: &[&str] = &[
  "connection",
  "keep-alive",
  "proxy-authenticate",
  "proxy-authorization",
  "te",
  "trailer",
  "transfer-encoding",
  "upgrade",
  "host",
  "content-length",
];

/// Returns true for headers that only make sense on the hop they arrived on.
pub fn is_hop_by_hop(name: &str) -> bool {
  HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// What kind of resource the browser is loading (the `Sec-Fetch-Dest` header).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Destination {
  Document,
  Image,
  Style,
  Script,
  Font,
  /// fetch()/XHR and htmx partial requests
  Empty,
  #[default]
  Other,
}

impl Destination {
  /// Parse a `Sec-Fetch-Dest` value. Unknown values map to `Other`.
  pub fn from_fetch_dest(value: &str) -> Self {
    match value.trim().to_ascii_lowercase().as_str() {
      "document" | "iframe" | "frame" => Self::Document,
      "image" => Self::Image,
      "style" => Self::Style,
      "script" | "worker" | "sharedworker" => Self::Script,
      "font" => Self::Font,
      "empty" => Self::Empty,
      _ => Self::Other,
    }
  }
}

/// An intercepted request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub destination: Destination,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Request {
  /// Build a bare GET request for a URL.
  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      destination: Destination::Other,
      headers: Vec::new(),
      body: Vec::new(),
    }
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn with_body(mut self, body: Vec<u8>) -> Self {
    self.body = body;
    self
  }

  /// First value of a header, matched case-insensitively.
  pub fn header(&self, name: &str) -> Option<&str> {
    find_header(&self.headers, name)
  }

  /// Identity of this request inside a cache partition.
  pub fn key(&self) -> RequestKey {
    RequestKey::new(self.method.as_str(), self.url.as_str())
  }
}

/// A response snapshot, either live from the network or replayed from a partition.
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

  /// An HTML response with the matching content type.
  pub fn html(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self::new(status, body).with_header("content-type", "text/html; charset=utf-8")
  }

  /// Served when the network is down and not even the offline page is cached.
  pub fn offline_placeholder() -> Self {
    Self::html(
      503,
      "<!doctype html><title>Offline</title><h1>You are offline</h1>",
    )
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  /// Same meaning as `Response.ok` in the Fetch API.
  pub fn is_ok(&self) -> bool {
    (200..=299).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    find_header(&self.headers, name)
  }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
  headers
    .iter()
    .find(|(k, _)| k.eq_ignore_ascii_case(name))
    .map(|(_, v)| v.as_str())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_destination_parsing() {
    assert_eq!(Destination::from_fetch_dest("image"), Destination::Image);
    assert_eq!(Destination::from_fetch_dest("Document"), Destination::Document);
    assert_eq!(Destination::from_fetch_dest("empty"), Destination::Empty);
    assert_eq!(Destination::from_fetch_dest("audioworklet"), Destination::Other);
  }

  #[test]
  fn test_response_ok_range() {
    assert!(Response::new(200, "").is_ok());
    assert!(Response::new(204, "").is_ok());
    assert!(!Response::new(304, "").is_ok());
    assert!(!Response::new(404, "").is_ok());
    assert!(!Response::offline_placeholder().is_ok());
  }

  #[test]
  fn test_header_lookup_is_case_insensitive() {
    let request = Request::get(Url::parse("http://shelf.local/").unwrap())
      .with_header("HX-Request", "true");
    assert_eq!(request.header("hx-request"), Some("true"));
    assert_eq!(request.header("accept"), None);
  }

  #[test]
  fn test_hop_by_hop() {
    assert!(is_hop_by_hop("Transfer-Encoding"));
    assert!(is_hop_by_hop("host"));
    assert!(!is_hop_by_hop("content-type"));
  }

  #[test]
  fn test_request_key_includes_method() {
    let url = Url::parse("http://shelf.local/catalogue").unwrap();
    let get = Request::get(url.clone()).key();
    let head = Request::new(Method::HEAD, url).key();
    assert_ne!(get.cache_hash(), head.cache_hash());
  }
}
