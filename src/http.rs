//! Request and response snapshots passed between the router, the strategies
//! and the cache.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

/// Resource kind the host expects the request to produce.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Destination {
  Document,
  Image,
  Script,
  Style,
  Font,
  #[default]
  Other,
}

/// An intercepted outgoing request.
#[derive(Debug, Clone)]
pub struct Request {
  /// Uppercased HTTP method
  pub method: String,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub destination: Destination,
  /// Set for top-level page navigations
  pub navigate: bool,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn new(method: &str, url: Url) -> Self {
    Self {
      method: method.to_ascii_uppercase(),
      url,
      headers: Vec::new(),
      destination: Destination::Other,
      navigate: false,
      body: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new("GET", url)
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  pub fn navigation(mut self) -> Self {
    self.navigate = true;
    self.destination = Destination::Document;
    self
  }

  pub fn with_body(mut self, body: Vec<u8>) -> Self {
    self.body = Some(body);
    self
  }

  pub fn is_get(&self) -> bool {
    self.method == "GET"
  }

  /// Case-insensitive header lookup.
  pub fn header(&self, name: &str) -> Option<&str> {
    find_header(&self.headers, name)
  }
}

/// An immutable response snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

const OFFLINE_JSON: &str = r#"{"error":"Offline","message":"No network connection available"}"#;

const IMAGE_PLACEHOLDER_SVG: &str = "<svg width=\"100\" height=\"100\" xmlns=\"http://www.w3.org/2000/svg\"><rect width=\"100%\" height=\"100%\" fill=\"#ddd\"/><text x=\"50%\" y=\"50%\" text-anchor=\"middle\" dy=\"0.3em\">\u{1F4F1}</text></svg>";

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  /// 2xx responses are the only ones ever written to a cache.
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  #[cfg(test)]
  pub fn header(&self, name: &str) -> Option<&str> {
    find_header(&self.headers, name)
  }

  /// Terminal response for API reads with no network and no cached copy.
  pub fn offline_json() -> Self {
    Self::new(503, OFFLINE_JSON).with_header("Content-Type", "application/json")
  }

  /// Stand-in for images that could be neither fetched nor found in cache.
  pub fn image_placeholder() -> Self {
    Self::new(200, IMAGE_PLACEHOLDER_SVG).with_header("Content-Type", "image/svg+xml")
  }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
  headers
    .iter()
    .find(|(k, _)| k.eq_ignore_ascii_case(name))
    .map(|(_, v)| v.as_str())
}

/// Canonical identity of a request inside a cache namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
  /// Build the key from method, absolute URL (fragment dropped) and the
  /// values of `relevant_headers`, hashed for stable fixed-length keys.
  pub fn for_request(request: &Request, relevant_headers: &[String]) -> Self {
    let mut url = request.url.clone();
    url.set_fragment(None);

    let mut headers: Vec<(String, &str)> = relevant_headers
      .iter()
      .map(|name| {
        (
          name.to_ascii_lowercase(),
          request.header(name).unwrap_or("").trim(),
        )
      })
      .collect();
    headers.sort();

    let mut input = format!("{} {}", request.method, url);
    for (name, value) in headers {
      input.push('\n');
      input.push_str(&name);
      input.push(':');
      input.push_str(value);
    }

    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    Self(hex::encode(hasher.finalize()))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}
