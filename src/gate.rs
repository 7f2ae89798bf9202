//! Local rate limiting for outbound ACME traffic.
//!
//! Let's Encrypt cuts off clients that hammer the API, so every request is
//! admitted through a process-wide gate before it leaves the machine. The
//! gate only ever answers yes or no; waiting out a denial is the caller's
//! job (the poller folds it into its backoff schedule).

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Parameters of one admission bucket: at most `limit` admissions per
/// `scale_ms` sliding window.
///
/// Buckets are identified by the whole triple; two sessions configured with
/// the same `(id, scale_ms, limit)` share a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimit {
    pub id: String,
    pub scale_ms: u64,
    pub limit: u32,
}

impl RateLimit {
    pub fn new(id: impl Into<String>, scale_ms: u64, limit: u32) -> Self {
        RateLimit {
            id: id.into(),
            scale_ms,
            limit,
        }
    }

    /// Default per-session bucket for signed requests.
    pub fn http_default() -> Self {
        RateLimit::new("http", 1_000, 10)
    }

    /// Fixed bucket shared by all `newNonce` fetches.
    pub(crate) fn nonce() -> Self {
        RateLimit::new("nonce", 1_000, 20)
    }

    fn window(&self) -> Duration {
        Duration::from_millis(self.scale_ms)
    }
}

impl Default for RateLimit {
    fn default() -> Self {
        RateLimit::http_default()
    }
}

/// Process-wide keyed admission gate.
///
/// The only shared mutable state in the crate; safe under concurrent
/// admission checks from any number of sessions.
#[derive(Debug, Default)]
pub struct RateLimitGate {
    buckets: Mutex<HashMap<RateLimit, VecDeque<Instant>>>,
}

impl RateLimitGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// The gate shared by sessions that don't inject their own.
    pub fn global() -> Arc<RateLimitGate> {
        static GLOBAL: OnceLock<Arc<RateLimitGate>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(RateLimitGate::new())))
    }

    /// Admit one request through `limit`'s bucket, or deny with
    /// [`Error::Throttled`]. Never sleeps.
    pub fn try_admit(&self, limit: &RateLimit) -> Result<()> {
        let mut buckets = self.buckets.lock();
        let admissions = buckets.entry(limit.clone()).or_default();

        let now = Instant::now();
        let window = limit.window();
        while admissions
            .front()
            .is_some_and(|first| now.duration_since(*first) >= window)
        {
            admissions.pop_front();
        }

        if admissions.len() < limit.limit as usize {
            admissions.push_back(now);
            Ok(())
        } else {
            log::trace!("rate limit gate denied admission for {}", limit.id);
            Err(Error::Throttled {
                bucket: limit.id.clone(),
            })
        }
    }
}
