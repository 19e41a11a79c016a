//! Local offline proxy.
//!
//! Every browser request to the proxy goes through the active controller, the
//! same way it would go through a service worker. Navigations are also fed to
//! the filter state so `/__shelf/resume` can send users back to their last
//! catalogue view.

use axum::{
  body::Body,
  extract::{Request as AxumRequest, State},
  http::{HeaderName, HeaderValue, StatusCode},
  response::{IntoResponse, Redirect, Response as AxumResponse},
  routing::{get, post},
  Router,
};
use color_eyre::{eyre::eyre, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::cache::{CacheStorage, Served};
use crate::controller::Registration;
use crate::filter_state::{FilterState, MemorySessionStore, UiEvent};
use crate::http::{is_hop_by_hop, Destination, Fetcher, Method, Request};

/// Largest request body forwarded upstream.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Response header naming where a response came from.
pub const SOURCE_HEADER: &str = "x-shelf-source";

/// Shared state of the proxy handlers.
pub struct ProxyState<S: CacheStorage, F: Fetcher> {
  pub registration: Arc<Registration<S, F>>,
  /// One session per proxy process
  pub filters: Arc<FilterState<MemorySessionStore>>,
}

impl<S: CacheStorage, F: Fetcher> Clone for ProxyState<S, F> {
  fn clone(&self) -> Self {
    Self {
      registration: Arc::clone(&self.registration),
      filters: Arc::clone(&self.filters),
    }
  }
}

/// Creates the proxy router.
pub fn router<S, F>(state: ProxyState<S, F>) -> Router
where
  S: CacheStorage + 'static,
  F: Fetcher + 'static,
{
  Router::new()
    .route("/__shelf/resume", get(resume::<S, F>))
    .route("/__shelf/resume/clear", post(clear_resume::<S, F>))
    .fallback(forward::<S, F>)
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}

/// Serve until Ctrl-C.
pub async fn serve(addr: SocketAddr, app: Router) -> Result<()> {
  let listener = tokio::net::TcpListener::bind(addr)
    .await
    .map_err(|e| eyre!("Failed to bind {}: {}", addr, e))?;
  info!(%addr, "Offline proxy listening");

  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|e| eyre!("Proxy server failed: {}", e))?;

  Ok(())
}

async fn shutdown_signal() {
  if let Err(e) = tokio::signal::ctrl_c().await {
    warn!("Failed to listen for Ctrl-C: {}", e);
    std::future::pending::<()>().await;
  }
  info!("Shutting down");
}

async fn resume<S: CacheStorage + 'static, F: Fetcher + 'static>(
  State(state): State<ProxyState<S, F>>,
) -> Redirect {
  Redirect::to(&state.filters.get())
}

async fn clear_resume<S: CacheStorage + 'static, F: Fetcher + 'static>(
  State(state): State<ProxyState<S, F>>,
) -> StatusCode {
  state.filters.clear();
  StatusCode::NO_CONTENT
}

async fn forward<S, F>(State(state): State<ProxyState<S, F>>, req: AxumRequest) -> AxumResponse
where
  S: CacheStorage + 'static,
  F: Fetcher + 'static,
{
  let Some(controller) = state.registration.active() else {
    return (StatusCode::SERVICE_UNAVAILABLE, "No active offline controller").into_response();
  };

  let request = match into_request(state.registration.scope(), req).await {
    Ok(request) => request,
    Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
  };

  if request.method == Method::GET {
    if request.header("hx-request").is_some() {
      state.filters.on_event(UiEvent::ContentSwapped, &request.url);
    } else if request.destination == Destination::Document {
      state.filters.on_event(UiEvent::PageLoad, &request.url);
    }
  }

  match controller.handle(&request).await {
    Ok(served) => into_response(served),
    Err(e) => {
      warn!(url = %request.url, "Upstream unreachable: {}", e);
      (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
    }
  }
}

/// Convert an incoming request into one addressed at the upstream.
async fn into_request(scope: &url::Url, req: AxumRequest) -> Result<Request> {
  let (parts, body) = req.into_parts();

  // Only the path and query are taken from the request, so the host never changes
  let mut url = scope.clone();
  url.set_path(parts.uri.path());
  url.set_query(parts.uri.query());

  let destination = parts
    .headers
    .get("sec-fetch-dest")
    .and_then(|v| v.to_str().ok())
    .map(Destination::from_fetch_dest)
    .unwrap_or_default();

  let headers = parts
    .headers
    .iter()
    .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
    .filter_map(|(name, value)| {
      value
        .to_str()
        .ok()
        .map(|v| (name.as_str().to_string(), v.to_string()))
    })
    .collect();

  let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
    .await
    .map_err(|e| eyre!("Failed to read request body: {}", e))?;

  Ok(Request {
    method: parts.method,
    url,
    destination,
    headers,
    body: body.to_vec(),
  })
}

fn into_response(served: Served) -> AxumResponse {
  let status = StatusCode::from_u16(served.response.status).unwrap_or(StatusCode::BAD_GATEWAY);
  let mut response = AxumResponse::new(Body::from(served.response.body));
  *response.status_mut() = status;

  let headers = response.headers_mut();
  for (name, value) in &served.response.headers {
    if is_hop_by_hop(name) {
      continue;
    }
    if let (Ok(name), Ok(value)) = (
      HeaderName::from_bytes(name.as_bytes()),
      HeaderValue::from_str(value),
    ) {
      headers.append(name, value);
    }
  }
  headers.insert(
    SOURCE_HEADER,
    HeaderValue::from_static(served.source.as_str()),
  );

  response
}
