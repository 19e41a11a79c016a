//! Request classification.
//!
//! Pure function of the request's method, origin, destination and path: no
//! network and no storage involved.

use url::{Origin, Url};

use crate::config::CacheConfig;
use crate::http::{Destination, Method, Request};

/// How an intercepted request is fulfilled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
  /// Not intercepted at all; goes straight to the network
  Passthrough,
  /// Intercepted but never cached (API calls)
  NetworkOnly,
  /// Static partition first, network on a miss
  CacheFirst,
  /// Network first, dynamic partition then offline page on failure
  NetworkFirst,
  /// Network first, image partition on failure
  ImageNetworkFirst,
}

/// Inputs to classification that do not come from the request.
#[derive(Debug, Clone)]
pub struct Rules {
  /// Requests from any other origin are cross-origin
  pub origin: Origin,
  pub api_prefix: String,
  pub static_prefix: String,
  pub cache_images: bool,
}

impl Rules {
  pub fn new(scope: &Url, config: &CacheConfig) -> Self {
    Self {
      origin: scope.origin(),
      api_prefix: config.api_prefix.clone(),
      static_prefix: config.static_prefix.clone(),
      cache_images: config.cache_images,
    }
  }
}

/// Classify a request. Earlier rules take precedence.
pub fn classify(request: &Request, rules: &Rules) -> Policy {
  if request.method != Method::GET {
    return Policy::Passthrough;
  }

  if request.url.origin() != rules.origin {
    if rules.cache_images && request.destination == Destination::Image {
      return Policy::ImageNetworkFirst;
    }
    return Policy::Passthrough;
  }

  let path = request.url.path();
  if path.starts_with(&rules.api_prefix) {
    Policy::NetworkOnly
  } else if path.starts_with(&rules.static_prefix) {
    Policy::CacheFirst
  } else {
    Policy::NetworkFirst
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn rules(cache_images: bool) -> Rules {
    let scope = Url::parse("http://shelf.local:8000/").unwrap();
    let config = CacheConfig {
      cache_images,
      ..CacheConfig::default()
    };
    Rules::new(&scope, &config)
  }

  fn get(url: &str) -> Request {
    Request::get(Url::parse(url).unwrap())
  }

  #[test]
  fn test_non_get_is_never_intercepted() {
    for method in [Method::POST, Method::PUT, Method::DELETE, Method::HEAD] {
      let request = Request::new(method, Url::parse("http://shelf.local:8000/static/a.css").unwrap());
      assert_eq!(classify(&request, &rules(true)), Policy::Passthrough);
    }
  }

  #[test]
  fn test_api_is_network_only() {
    assert_eq!(
      classify(&get("http://shelf.local:8000/api/media?page=2"), &rules(true)),
      Policy::NetworkOnly
    );
  }

  #[test]
  fn test_static_is_cache_first() {
    assert_eq!(
      classify(&get("http://shelf.local:8000/static/css/app.css"), &rules(true)),
      Policy::CacheFirst
    );
  }

  #[test]
  fn test_navigation_is_network_first() {
    for url in [
      "http://shelf.local:8000/",
      "http://shelf.local:8000/catalogue?type=film",
      "http://shelf.local:8000/apix",
      "http://shelf.local:8000/staticky",
    ] {
      assert_eq!(classify(&get(url), &rules(true)), Policy::NetworkFirst, "{}", url);
    }
  }

  #[test]
  fn test_cross_origin_passes_through() {
    assert_eq!(
      classify(&get("https://api.themoviedb.org/3/movie/1"), &rules(true)),
      Policy::Passthrough
    );
    // Different port is a different origin
    assert_eq!(
      classify(&get("http://shelf.local:9000/static/a.css"), &rules(true)),
      Policy::Passthrough
    );
  }

  #[test]
  fn test_cross_origin_images() {
    let poster = get("https://image.tmdb.org/t/p/w500/poster.jpg").with_destination(Destination::Image);
    assert_eq!(classify(&poster, &rules(true)), Policy::ImageNetworkFirst);
    assert_eq!(classify(&poster, &rules(false)), Policy::Passthrough);
  }

  #[test]
  fn test_same_origin_image_follows_path_rules() {
    let icon = get("http://shelf.local:8000/static/icons/icon-192.png").with_destination(Destination::Image);
    assert_eq!(classify(&icon, &rules(true)), Policy::CacheFirst);
  }
}
