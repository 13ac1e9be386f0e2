//! Middleware components for the API server
//!
//! Request tracing, security headers, request ids, and the per-process rate
//! limiter guarding the redirect endpoint.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use futures::future::BoxFuture;
use std::net::{IpAddr, SocketAddr};
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::Span;
use uuid::Uuid;

use crate::error::ApiError;

/// Client address. Behind `trusted_proxies` reverse proxies the client is the
/// hop that many places from the right of `X-Forwarded-For`; anything left of
/// it was supplied by the client. With no trusted proxies the header is
/// ignored and the socket peer is used.
pub fn client_ip(
    headers: &HeaderMap,
    connect_info: Option<&ConnectInfo<SocketAddr>>,
    trusted_proxies: usize,
) -> Option<IpAddr> {
    let peer = connect_info.map(|ConnectInfo(addr)| addr.ip());
    if trusted_proxies == 0 {
        return peer;
    }

    let hops: Vec<&str> = headers
        .get_all("X-Forwarded-For")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|s| s.split(','))
        .map(str::trim)
        .filter(|hop| !hop.is_empty())
        .collect();
    let hop = match hops.len().checked_sub(trusted_proxies) {
        Some(index) => hops.get(index),
        None => hops.first(),
    };
    hop.and_then(|ip| ip.parse().ok()).or(peer)
}

/// Rate limiting middleware
pub mod rate_limit {
    use super::*;
    use dashmap::DashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tracing::{debug, warn};

    /// Expired windows are dropped once every this many checks.
    const PRUNE_EVERY: usize = 256;

    /// Rate limiting configuration
    #[derive(Debug, Clone)]
    pub struct RateLimitConfig {
        /// Maximum requests per window
        pub max_requests: u32,
        /// Time window in seconds
        pub window_secs: u64,
        /// See [`client_ip`]
        pub trusted_proxies: usize,
    }

    impl Default for RateLimitConfig {
        fn default() -> Self {
            Self {
                max_requests: 60,
                window_secs: 60,
                trusted_proxies: 0,
            }
        }
    }

    #[derive(Debug, Clone, Copy)]
    struct Window {
        started: Instant,
        count: u32,
    }

    /// Fixed-window counter per client IP. State is per process, so with
    /// several instances the effective limit is a multiple of the configured one.
    #[derive(Debug, Clone)]
    pub struct RateLimiter {
        config: RateLimitConfig,
        windows: Arc<DashMap<IpAddr, Window>>,
        checks: Arc<AtomicUsize>,
    }

    impl RateLimiter {
        pub fn new(config: RateLimitConfig) -> Self {
            Self {
                config,
                windows: Arc::new(DashMap::new()),
                checks: Arc::new(AtomicUsize::new(0)),
            }
        }

        pub fn trusted_proxies(&self) -> usize {
            self.config.trusted_proxies
        }

        fn window(&self) -> Duration {
            Duration::from_secs(self.config.window_secs)
        }

        /// Check if request is allowed and record it
        pub fn check_and_record(&self, ip: IpAddr) -> bool {
            self.check_at(ip, Instant::now())
        }

        fn check_at(&self, ip: IpAddr, now: Instant) -> bool {
            // Pruned before the entry guard below is taken; retain locks every shard.
            if self.checks.fetch_add(1, Ordering::Relaxed) % PRUNE_EVERY == PRUNE_EVERY - 1 {
                self.prune(now);
            }

            let window = self.window();
            let mut entry = self.windows.entry(ip).or_insert(Window {
                started: now,
                count: 0,
            });

            if now.duration_since(entry.started) >= window {
                entry.started = now;
                entry.count = 0;
            }

            if entry.count >= self.config.max_requests {
                false
            } else {
                entry.count += 1;
                true
            }
        }

        /// Get current request count for an IP
        pub fn get_request_count(&self, ip: IpAddr) -> u32 {
            let window = self.window();
            self.windows
                .get(&ip)
                .filter(|entry| entry.started.elapsed() < window)
                .map(|entry| entry.count)
                .unwrap_or(0)
        }

        fn prune(&self, now: Instant) {
            let window = self.window();
            let before = self.windows.len();
            self.windows
                .retain(|_, entry| now.saturating_duration_since(entry.started) < window);
            debug!(dropped = before.saturating_sub(self.windows.len()), "Pruned rate limit windows");
        }

        pub fn tracked_clients(&self) -> usize {
            self.windows.len()
        }
    }

    /// `axum::middleware::from_fn_with_state` adapter. Requests without a
    /// resolvable client address are let through.
    pub async fn rate_limit(
        State(limiter): State<RateLimiter>,
        request: Request,
        next: Next,
    ) -> Response {
        let client = client_ip(
            request.headers(),
            request.extensions().get::<ConnectInfo<SocketAddr>>(),
            limiter.trusted_proxies(),
        );

        if let Some(ip) = client {
            if !limiter.check_and_record(ip) {
                warn!("Rate limit exceeded for IP: {}", ip);
                metrics::increment_counter!("marketplace_rate_limited_total");
                return ApiError::rate_limit("Too many requests, please try again later")
                    .into_response();
            }
        }

        next.run(request).await
    }

}

/// Security middleware
pub mod security {
    use super::*;

    #[derive(Clone)]
    pub struct SecurityHeadersLayer;

    impl<S> Layer<S> for SecurityHeadersLayer {
        type Service = SecurityHeaders<S>;

        fn layer(&self, inner: S) -> Self::Service {
            SecurityHeaders { inner }
        }
    }

    #[derive(Clone)]
    pub struct SecurityHeaders<S> {
        inner: S,
    }

    impl<S> Service<Request> for SecurityHeaders<S>
    where
        S: Service<Request, Response = Response> + Send + 'static,
        S::Future: Send + 'static,
    {
        type Response = Response;
        type Error = S::Error;
        type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

        fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            self.inner.poll_ready(cx)
        }

        fn call(&mut self, request: Request) -> Self::Future {
            let future = self.inner.call(request);
            Box::pin(async move {
                let mut response = future.await?;
                let headers = response.headers_mut();

                headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
                headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
                headers.insert(
                    header::REFERRER_POLICY,
                    HeaderValue::from_static("strict-origin-when-cross-origin"),
                );

                Ok(response)
            })
        }
    }
}

/// Utility middleware
pub mod utils {
    use super::*;

    pub const REQUEST_ID_HEADER: &str = "X-Request-ID";

    #[derive(Clone)]
    pub struct RequestIdLayer;

    impl<S> Layer<S> for RequestIdLayer {
        type Service = RequestIdService<S>;
        fn layer(&self, inner: S) -> Self::Service {
            RequestIdService { inner }
        }
    }

    #[derive(Clone)]
    pub struct RequestIdService<S> {
        inner: S,
    }

    impl<S> Service<Request> for RequestIdService<S>
    where
        S: Service<Request, Response = Response> + Send + 'static,
        S::Future: Send + 'static,
    {
        type Response = Response;
        type Error = S::Error;
        type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

        fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            self.inner.poll_ready(cx)
        }

        fn call(&mut self, request: Request) -> Self::Future {
            let request_id = request
                .headers()
                .get(REQUEST_ID_HEADER)
                .cloned()
                .unwrap_or_else(|| {
                    HeaderValue::from_str(&Uuid::new_v4().to_string())
                        .unwrap_or_else(|_| HeaderValue::from_static("unknown"))
                });
            let future = self.inner.call(request);
            Box::pin(async move {
                let mut response = future.await?;
                response.headers_mut().insert(REQUEST_ID_HEADER, request_id);
                Ok(response)
            })
        }
    }
}

/// Middleware configuration and builder
pub struct MiddlewareBuilder {
    logging_enabled: bool,
    security_enabled: bool,
    request_id_enabled: bool,
}

impl Default for MiddlewareBuilder {
    fn default() -> Self {
        Self {
            logging_enabled: true,
            security_enabled: true,
            request_id_enabled: true,
        }
    }
}

impl MiddlewareBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn logging(mut self, enabled: bool) -> Self {
        self.logging_enabled = enabled;
        self
    }

    pub fn security(mut self, enabled: bool) -> Self {
        self.security_enabled = enabled;
        self
    }

    pub fn request_id(mut self, enabled: bool) -> Self {
        self.request_id_enabled = enabled;
        self
    }

    /// Apply the configured middleware to a router
    pub fn apply_to<S>(self, mut router: axum::Router<S>) -> axum::Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        if self.logging_enabled {
            use tower_http::trace::TraceLayer;

            router = router.layer(
                TraceLayer::new_for_http()
                    .make_span_with(|request: &Request| {
                        tracing::info_span!(
                            "http_request",
                            method = ?request.method(),
                            path = %request.uri().path(),
                            version = ?request.version(),
                        )
                    })
                    .on_response(|response: &Response, latency: std::time::Duration, _span: &Span| {
                        let status = response.status();
                        let latency_ms = latency.as_millis();

                        if status.is_server_error() {
                            tracing::error!(
                                status = status.as_u16(),
                                latency_ms = latency_ms,
                                "request failed"
                            );
                        } else {
                            tracing::info!(
                                status = status.as_u16(),
                                latency_ms = latency_ms,
                                "request completed"
                            );
                        }
                    }),
            );
        }

        if self.security_enabled {
            router = router.layer(security::SecurityHeadersLayer);
        }

        if self.request_id_enabled {
            router = router.layer(utils::RequestIdLayer);
        }

        router
    }
}
