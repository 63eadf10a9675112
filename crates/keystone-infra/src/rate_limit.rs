//! Per-key fixed-window rate limiter
//!
//! Buckets live in memory and are sharded by key hash so unrelated keys do not contend on
//! one mutex. The HTTP middleware keys by tenant once a request is authenticated and by
//! client address before that.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use keystone_core::RequestContext;
use tokio::sync::Mutex;

use crate::error::ErrorResponse;

const DEFAULT_SHARDS: usize = 16;
const MAX_BUCKETS_PER_SHARD: usize = 10_000;

#[derive(Debug, Clone)]
struct Bucket {
    count: u32,
    reset_at: Instant,
}

impl Bucket {
    fn new(window: Duration) -> Self {
        Self {
            count: 0,
            reset_at: Instant::now() + window,
        }
    }

    fn check_and_increment(&mut self, limit: u32, window: Duration) -> Result<u32, Duration> {
        let now = Instant::now();
        if now >= self.reset_at {
            self.count = 0;
            self.reset_at = now + window;
        }
        if self.count < limit {
            self.count += 1;
            Ok(limit - self.count)
        } else {
            Err(self.reset_at.saturating_duration_since(now))
        }
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    shards: Vec<Arc<Mutex<HashMap<String, Bucket>>>>,
    limit: u32,
    window: Duration,
}

impl RateLimiter {
    /// `limit` requests per key per minute.
    pub fn per_minute(limit: u32) -> Self {
        Self::with_window(limit, Duration::from_secs(60))
    }

    pub fn with_window(limit: u32, window: Duration) -> Self {
        let shards = (0..DEFAULT_SHARDS)
            .map(|_| Arc::new(Mutex::new(HashMap::new())))
            .collect();
        Self {
            shards,
            limit,
            window,
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    fn shard(&self, key: &str) -> &Mutex<HashMap<String, Bucket>> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    /// Counts one hit for `key`. Returns the remaining allowance, or how long until the
    /// window resets when the key is over its limit.
    pub async fn check(&self, key: &str) -> Result<u32, Duration> {
        let mut buckets = self.shard(key).lock().await;

        if buckets.len() >= MAX_BUCKETS_PER_SHARD {
            let now = Instant::now();
            buckets.retain(|_, bucket| bucket.reset_at > now);
            if buckets.len() >= MAX_BUCKETS_PER_SHARD {
                let oldest = buckets
                    .iter()
                    .min_by_key(|(_, bucket)| bucket.reset_at)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    buckets.remove(&oldest);
                }
            }
        }

        buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket::new(self.window))
            .check_and_increment(self.limit, self.window)
    }

    /// Drops buckets whose window has passed.
    pub async fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut cleaned = 0;
        for shard in &self.shards {
            let mut buckets = shard.lock().await;
            let before = buckets.len();
            buckets.retain(|_, bucket| bucket.reset_at > now);
            cleaned += before - buckets.len();
        }
        if cleaned > 0 {
            tracing::debug!(buckets_cleaned = cleaned, "Expired rate limit buckets dropped");
        }
        cleaned
    }
}

fn client_key(request: &Request) -> String {
    if let Some(ctx) = request.extensions().get::<RequestContext>() {
        return format!("tenant:{}", ctx.tenant_id);
    }
    let forwarded = request
        .headers()
        .get("X-Forwarded-For")
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty());
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());
    format!(
        "ip:{}",
        forwarded.or(peer).unwrap_or_else(|| "unknown".to_string())
    )
}

pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let key = client_key(&request);
    let limit = limiter.limit();

    match limiter.check(&key).await {
        Ok(remaining) => {
            let mut response = next.run(request).await;
            let headers = response.headers_mut();
            headers.insert("X-RateLimit-Limit", HeaderValue::from(limit));
            headers.insert("X-RateLimit-Remaining", HeaderValue::from(remaining));
            response
        }
        Err(reset_in) => {
            tracing::warn!(
                event_type = "rate_limit_exceeded",
                key = %key,
                path = %request.uri().path(),
                limit,
                "Rate limit exceeded"
            );
            let status = StatusCode::TOO_MANY_REQUESTS;
            let body = ErrorResponse::new(
                "rate_limited",
                "Too many requests. Please slow down.",
                status.as_u16(),
            );
            let mut response = (status, axum::Json(body)).into_response();
            let headers = response.headers_mut();
            headers.insert("X-RateLimit-Limit", HeaderValue::from(limit));
            headers.insert("X-RateLimit-Remaining", HeaderValue::from(0u32));
            headers.insert("Retry-After", HeaderValue::from(reset_in.as_secs().max(1)));
            response
        }
    }
}
