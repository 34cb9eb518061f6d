//! Request classification for the fetch interceptor.

use crate::http::{Method, Request};

/// How the interceptor treats a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  /// API data: network-first
  Api,
  /// Document request: stale-while-revalidate with the offline page as last resort
  StaticHtml,
  /// Any other asset: stale-while-revalidate with a 503 as last resort
  StaticOther,
  /// Not a GET: passed to the network untouched
  Ignored,
}

/// Classify a request by method, URL path and `Accept` header.
pub fn classify(request: &Request, api_prefix: &str) -> RequestClass {
  if request.method != Method::Get {
    return RequestClass::Ignored;
  }

  if request.url.path().starts_with(api_prefix) {
    return RequestClass::Api;
  }

  if request.accepts_html() {
    RequestClass::StaticHtml
  } else {
    RequestClass::StaticOther
  }
}
