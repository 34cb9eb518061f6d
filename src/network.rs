//! Network access used by the worker and client pages.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use tracing::trace;

use crate::http::{Headers, Request, Response};

/// An opaque asynchronous fetch.
///
/// `Err` means the request never produced a response (offline, DNS, TLS, reset).
/// HTTP error statuses are successful fetches; callers decide what they mean.
pub trait Network: Send + Sync + 'static {
  fn fetch(&self, request: Request) -> BoxFuture<'static, Result<Response>>;
}

/// reqwest-backed network.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("aromatna/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl Network for HttpNetwork {
  fn fetch(&self, request: Request) -> BoxFuture<'static, Result<Response>> {
    let client = self.client.clone();

    Box::pin(async move {
      let Request {
        method,
        url,
        headers,
        body,
      } = request;

      let reqwest_method = reqwest::Method::from_bytes(method.as_str().as_bytes())
        .map_err(|e| eyre!("Invalid method {}: {}", method, e))?;

      let mut builder = client.request(reqwest_method, url.clone());
      for (name, value) in &headers {
        builder = builder.header(name.as_str(), value.as_str());
      }
      if let Some(body) = body {
        builder = builder.body(body);
      }

      trace!(%method, %url, "Fetching");

      let response = builder
        .send()
        .await
        .map_err(|e| eyre!("Failed to fetch {} {}: {}", method, url, e))?;

      let status = response.status().as_u16();
      let headers: Headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
          value
            .to_str()
            .ok()
            .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect();

      let body = response
        .bytes()
        .await
        .map_err(|e| eyre!("Failed to read body of {} {}: {}", method, url, e))?
        .to_vec();

      Ok(Response {
        status,
        headers,
        body,
      })
    })
  }
}
