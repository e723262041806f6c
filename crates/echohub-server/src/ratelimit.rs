//! Fixed-window admission control keyed by client IP.
//!
//! Wraps every route, including the WebSocket upgrade. Frames sent after
//! an upgrade are not counted.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RateLimitSection;

#[derive(Clone, Copy, Debug)]
struct Window {
    count: u32,
    reset_at: Instant,
}

impl Window {
    fn expired(&self, now: Instant) -> bool {
        now > self.reset_at
    }
}

pub struct RateLimiter {
    windows: Mutex<HashMap<IpAddr, Window>>,
    limit: u32,
    window: Duration,
    enabled: bool,
    trust_proxy_headers: bool,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            limit,
            window,
            enabled: true,
            trust_proxy_headers: false,
        }
    }

    pub fn from_config(config: &RateLimitSection) -> Self {
        Self {
            enabled: config.enabled,
            trust_proxy_headers: config.trust_proxy_headers,
            ..Self::new(config.limit, config.window())
        }
    }

    /// Count one request from `client`. The first request of a window is
    /// always allowed; later ones are rejected once `limit` is reached.
    pub fn allow(&self, client: IpAddr) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        match windows.get_mut(&client) {
            Some(w) if !w.expired(now) => {
                if w.count >= self.limit {
                    return false;
                }
                w.count += 1;
                true
            }
            _ => {
                windows.insert(
                    client,
                    Window {
                        count: 1,
                        reset_at: now + self.window,
                    },
                );
                true
            }
        }
    }

    /// Drop every expired window. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, w| !w.expired(now));
        before - windows.len()
    }

    pub fn len(&self) -> usize {
        self.windows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sweep once per window length until `shutdown` fires.
    pub fn spawn_sweeper(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.window);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = self.sweep();
                        if removed > 0 {
                            debug!(removed, remaining = self.len(), "rate limiter sweep");
                        }
                    }
                }
            }
        })
    }
}

/// Client address for admission purposes. Proxy headers are consulted only
/// when explicitly trusted.
fn extract_client_ip(
    remote_addr: Option<SocketAddr>,
    headers: &HeaderMap,
    trust_proxy: bool,
) -> Option<IpAddr> {
    if trust_proxy {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse().ok());
        if forwarded.is_some() {
            return forwarded;
        }
        let real_ip = headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok());
        if real_ip.is_some() {
            return real_ip;
        }
    }
    remote_addr.map(|addr| addr.ip())
}

pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !limiter.enabled {
        return next.run(request).await;
    }

    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0);
    let Some(client) = extract_client_ip(remote, request.headers(), limiter.trust_proxy_headers)
    else {
        warn!("rate limit: could not determine client ip");
        return next.run(request).await;
    };

    if limiter.allow(client) {
        next.run(request).await
    } else {
        warn!(client = %client, path = request.uri().path(), "rate limit exceeded");
        (
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({ "error": "Too many requests" })),
        )
            .into_response()
    }
}
