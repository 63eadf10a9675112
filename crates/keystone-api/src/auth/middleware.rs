use crate::error::HttpAppError;
use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use keystone_core::AppError;
use keystone_infra::RequestId;
use keystone_services::{AuthService, TokenType};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Blocks a client address after too many rejected bearer tokens within a window.
#[derive(Clone)]
pub struct AuthFailureLimiter {
    inner: Arc<Mutex<HashMap<String, (u32, Instant)>>>,
    max_failures: u32,
    window: Duration,
}

impl AuthFailureLimiter {
    pub fn new(max_failures: u32, window_seconds: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            max_failures,
            window: Duration::from_secs(window_seconds),
        }
    }

    /// Returns true once the address has reached the limit.
    pub async fn record_failure(&self, ip: &str) -> bool {
        let mut guard = self.inner.lock().await;
        let now = Instant::now();
        let (count, reset_at) = guard
            .entry(ip.to_string())
            .or_insert((0, now + self.window));
        if now >= *reset_at {
            *count = 0;
            *reset_at = now + self.window;
        }
        *count += 1;
        *count >= self.max_failures
    }

    pub async fn is_blocked(&self, ip: &str) -> bool {
        let mut guard = self.inner.lock().await;
        if let Some((count, reset_at)) = guard.get(ip) {
            if Instant::now() >= *reset_at {
                guard.remove(ip);
                return false;
            }
            return *count >= self.max_failures;
        }
        false
    }
}

#[derive(Clone)]
pub struct AuthState {
    pub auth: AuthService,
    pub failure_limiter: Option<Arc<AuthFailureLimiter>>,
}

fn client_ip(request: &Request) -> String {
    request
        .headers()
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

fn bearer_token(request: &Request) -> Result<&str, AppError> {
    let header = request
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("Missing authorization header".to_string()))?;
    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AppError::Unauthorized("Invalid authorization header format".to_string()))
}

async fn reject(
    auth_state: &AuthState,
    ip: &str,
    error: AppError,
) -> Response {
    if let Some(ref limiter) = auth_state.failure_limiter {
        if limiter.record_failure(ip).await {
            tracing::warn!(
                event_type = "auth_failure_limit",
                client_ip = %ip,
                "Client blocked after repeated authentication failures"
            );
        }
    }
    tracing::info!(
        event_type = "authentication_failed",
        client_ip = %ip,
        reason = %error,
        "Bearer token rejected"
    );
    HttpAppError(error).into_response()
}

/// Verify the access token and bind the caller's [`keystone_core::RequestContext`] to the
/// request. Refresh, reset and other scoped tokens are refused here.
pub async fn auth_middleware(
    State(auth_state): State<Arc<AuthState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let ip = client_ip(&request);
    if let Some(ref limiter) = auth_state.failure_limiter {
        if limiter.is_blocked(&ip).await {
            return HttpAppError(AppError::Unauthorized(
                "Too many failed authentication attempts".to_string(),
            ))
            .into_response();
        }
    }

    let claims = match bearer_token(&request)
        .and_then(|token| auth_state.auth.tokens().decode(token, TokenType::Access))
    {
        Ok(claims) => claims,
        Err(e) => return reject(&auth_state, &ip, e).await,
    };

    let mut ctx = match auth_state.auth.request_context(&claims).await {
        Ok(ctx) => ctx,
        Err(e) => return reject(&auth_state, &ip, e).await,
    };
    if let Some(RequestId(id)) = request.extensions().get::<RequestId>() {
        ctx = ctx.with_request_id(id.clone());
    }

    tracing::debug!(
        tenant_id = %ctx.tenant_id,
        user_id = %ctx.user_id,
        user_type = ?ctx.user_type,
        "Request authenticated"
    );
    request.extensions_mut().insert(ctx);
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_limiter_blocks_after_max_failures() {
        let limiter = AuthFailureLimiter::new(3, 60);
        assert!(!limiter.record_failure("10.0.0.1").await);
        assert!(!limiter.record_failure("10.0.0.1").await);
        assert!(!limiter.is_blocked("10.0.0.1").await);
        assert!(limiter.record_failure("10.0.0.1").await);
        assert!(limiter.is_blocked("10.0.0.1").await);
        assert!(!limiter.is_blocked("10.0.0.2").await);
    }

    #[tokio::test]
    async fn test_limiter_window_resets() {
        let limiter = AuthFailureLimiter::new(1, 0);
        limiter.record_failure("10.0.0.1").await;
        assert!(!limiter.is_blocked("10.0.0.1").await);
    }
}
