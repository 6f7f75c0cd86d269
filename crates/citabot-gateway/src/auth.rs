//! API-key check for admin routes and the best-effort in-process rate
//! limiter. Multi-instance deployments get per-instance limits; the
//! counters carry no correctness weight.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use dashmap::DashMap;
use serde_json::{json, Value};

use crate::app::AppState;

/// Fixed-window counter per key.
#[derive(Clone)]
pub struct RateLimiter {
    enabled: bool,
    limit_per_minute: u32,
    windows: Arc<DashMap<String, (Instant, u32)>>,
}

impl RateLimiter {
    pub fn new(enabled: bool, limit_per_minute: u32) -> Self {
        Self {
            enabled,
            limit_per_minute,
            windows: Arc::new(DashMap::new()),
        }
    }

    /// Returns `Err(retry_after_secs)` once the key exceeds its window.
    pub fn check(&self, key: &str) -> Result<(), u64> {
        if !self.enabled {
            return Ok(());
        }
        let now = Instant::now();
        let mut entry = self
            .windows
            .entry(key.to_string())
            .or_insert((now, 0));
        let (window_start, count) = *entry;

        if now.duration_since(window_start) >= Duration::from_secs(60) {
            *entry = (now, 1);
            return Ok(());
        }
        if count >= self.limit_per_minute {
            let retry = 60u64.saturating_sub(now.duration_since(window_start).as_secs());
            return Err(retry.max(1));
        }
        *entry = (window_start, count + 1);
        Ok(())
    }
}

/// Validate the configured API-key header for admin routes.
pub fn require_api_key(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<(), (StatusCode, Json<Value>)> {
    let security = &state.config.security;
    if security.api_keys.is_empty() {
        // No keys configured: refuse rather than run open.
        return Err(error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "CONFIGURATION_ERROR",
            "no API keys configured",
        ));
    }

    let provided = headers
        .get(security.api_key_header.as_str())
        .and_then(|v| v.to_str().ok());

    match provided {
        Some(key) if security.api_keys.iter().any(|k| k == key) => Ok(()),
        Some(_) => Err(error_response(
            StatusCode::UNAUTHORIZED,
            "AUTHENTICATION_ERROR",
            "invalid API key",
        )),
        None => Err(error_response(
            StatusCode::UNAUTHORIZED,
            "AUTHENTICATION_ERROR",
            "missing API key",
        )),
    }
}

pub fn error_response(
    status: StatusCode,
    code: &str,
    message: &str,
) -> (StatusCode, Json<Value>) {
    (
        status,
        Json(json!({"error": {"code": code, "message": message, "details": {}}})),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_limiter_always_allows() {
        let limiter = RateLimiter::new(false, 1);
        for _ in 0..100 {
            assert!(limiter.check("k").is_ok());
        }
    }

    #[test]
    fn limiter_caps_within_window() {
        let limiter = RateLimiter::new(true, 3);
        assert!(limiter.check("k").is_ok());
        assert!(limiter.check("k").is_ok());
        assert!(limiter.check("k").is_ok());
        let retry = limiter.check("k").unwrap_err();
        assert!(retry >= 1 && retry <= 60);
        // Other keys are unaffected.
        assert!(limiter.check("other").is_ok());
    }
}
