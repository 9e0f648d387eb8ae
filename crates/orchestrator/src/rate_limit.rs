//! Fixed-window request throttling. The counter store is injected so a
//! shared backend can replace the in-memory map; a store failure lets the
//! request through (availability over strict quota enforcement).

use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::Method;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use sha2::{Digest, Sha256};

use crate::auth::API_KEY_HEADER;
use crate::error::ApiError;
use crate::{unix_now, AppState};

pub const WINDOW_SECS: u64 = 60;

#[derive(Debug, thiserror::Error)]
#[error("counter store unavailable: {0}")]
pub struct CounterError(pub String);

pub trait CounterStore: Send + Sync {
    /// Increment `key`'s counter for the fixed window containing `now` and
    /// return the post-increment count.
    fn incr(&self, key: &str, now: u64) -> Result<u64, CounterError>;
}

#[derive(Default)]
pub struct InMemoryCounters {
    windows: DashMap<String, (u64, u64)>,
}

impl InMemoryCounters {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CounterStore for InMemoryCounters {
    fn incr(&self, key: &str, now: u64) -> Result<u64, CounterError> {
        let window = now - now % WINDOW_SECS;
        let mut entry = self.windows.entry(key.to_string()).or_insert((window, 0));
        if entry.0 != window {
            *entry = (window, 0);
        }
        entry.1 += 1;
        Ok(entry.1)
    }
}

/// Read paths throttled by the second, tighter ceiling: model weight
/// retrieval, provider listing, cluster inspection.
fn is_sensitive_read(path: &str) -> bool {
    (path.starts_with("/job/") && path.ends_with("/model"))
        || path == "/provider/"
        || path.starts_with("/cluster/")
}

pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    per_minute: u64,
    sensitive_per_minute: u64,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, per_minute: u64, sensitive_per_minute: u64) -> Self {
        Self {
            store,
            per_minute,
            sensitive_per_minute,
        }
    }

    /// Apply the general ceiling, plus the sensitive-read ceiling for
    /// enumerated GET paths. Store errors fail open.
    pub fn check(&self, bucket: &str, method: &Method, path: &str, now: u64) -> Result<(), ApiError> {
        match self.store.incr(&format!("rl:{bucket}"), now) {
            Ok(count) if count > self.per_minute => return Err(ApiError::RateLimited),
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "rate limiter failing open");
                return Ok(());
            }
        }

        if method == Method::GET && is_sensitive_read(path) {
            match self.store.incr(&format!("srl:{bucket}:{path}"), now) {
                Ok(count) if count > self.sensitive_per_minute => {
                    return Err(ApiError::RateLimited)
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "sensitive rate limiter failing open"),
            }
        }
        Ok(())
    }
}

/// Bucket key: verified token subject, else a hash of the presented API key
/// (never the key itself), else the caller's network address.
pub fn bucket_for(state: &AppState, req: &Request) -> String {
    if let Some(sub) = state.auth.peek_subject(req.headers()) {
        return format!("jwt:{sub}");
    }
    if let Some(key) = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        let digest = Sha256::digest(key.as_bytes());
        return format!("api:{}", &hex::encode(digest)[..16]);
    }
    req.extensions()
        .get::<ConnectInfo<std::net::SocketAddr>>()
        .map(|ci| ci.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

pub async fn rate_limit_layer(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let bucket = bucket_for(&state, &req);
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    if let Err(e) = state.limiter.check(&bucket, &method, &path, unix_now()) {
        return e.into_response();
    }
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingStore;

    impl CounterStore for FailingStore {
        fn incr(&self, _key: &str, _now: u64) -> Result<u64, CounterError> {
            Err(CounterError("connection refused".into()))
        }
    }

    #[test]
    fn request_n_accepted_n_plus_one_rejected() {
        let limiter = RateLimiter::new(Arc::new(InMemoryCounters::new()), 3, 100);
        let now = 1_000_000;
        for _ in 0..3 {
            assert!(limiter.check("jwt:alice", &Method::POST, "/job", now).is_ok());
        }
        assert!(matches!(
            limiter.check("jwt:alice", &Method::POST, "/job", now),
            Err(ApiError::RateLimited)
        ));
        // A different bucket is unaffected.
        assert!(limiter.check("jwt:bob", &Method::POST, "/job", now).is_ok());
    }

    #[test]
    fn window_reset_clears_the_counter() {
        let limiter = RateLimiter::new(Arc::new(InMemoryCounters::new()), 1, 100);
        let now = 1_000_020;
        assert!(limiter.check("b", &Method::POST, "/job", now).is_ok());
        assert!(limiter.check("b", &Method::POST, "/job", now).is_err());
        assert!(limiter
            .check("b", &Method::POST, "/job", now + WINDOW_SECS)
            .is_ok());
    }

    #[test]
    fn sensitive_reads_have_their_own_ceiling() {
        let limiter = RateLimiter::new(Arc::new(InMemoryCounters::new()), 100, 2);
        let now = 2_000_000;
        for _ in 0..2 {
            assert!(limiter
                .check("b", &Method::GET, "/job/1/model", now)
                .is_ok());
        }
        assert!(matches!(
            limiter.check("b", &Method::GET, "/job/1/model", now),
            Err(ApiError::RateLimited)
        ));
        // Non-sensitive reads only count against the general ceiling.
        assert!(limiter.check("b", &Method::GET, "/job/1/status", now).is_ok());
    }

    #[test]
    fn sensitive_path_set_matches_expected_routes() {
        assert!(is_sensitive_read("/job/42/model"));
        assert!(is_sensitive_read("/provider/"));
        assert!(is_sensitive_read("/cluster/42"));
        assert!(!is_sensitive_read("/job/42/status"));
        assert!(!is_sensitive_read("/healthz"));
    }

    #[test]
    fn unreachable_store_fails_open() {
        let limiter = RateLimiter::new(Arc::new(FailingStore), 1, 1);
        let now = 3_000_000;
        for _ in 0..10 {
            assert!(limiter.check("b", &Method::POST, "/job", now).is_ok());
            assert!(limiter.check("b", &Method::GET, "/provider/", now).is_ok());
        }
    }
}
