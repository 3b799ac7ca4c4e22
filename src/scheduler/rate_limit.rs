//! Per-endpoint sliding-window rate limiting.
//!
//! Every downstream call acquires a slot for its `(class, endpoint)` pair
//! first. A pair allows `rate_limit_per_minute` calls in any 60-second
//! window; callers beyond that wait until the oldest call leaves the window.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use super::cost::CostModel;
use super::event::EventClass;

/// Length of the rate-limit window.
pub const WINDOW: Duration = Duration::from_secs(60);

type BucketKey = (EventClass, String);

/// Shared limiter over all `(class, endpoint)` buckets.
#[derive(Debug)]
pub struct RateLimiter {
    cost: Arc<CostModel>,
    calls: Mutex<HashMap<BucketKey, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(cost: Arc<CostModel>) -> Self {
        Self {
            cost,
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Waits for a free slot and records the call.
    ///
    /// Returns how long the caller was held back.
    pub async fn acquire(&self, class: EventClass, endpoint: &str) -> Duration {
        let started = Instant::now();
        loop {
            match self.try_record(class, endpoint) {
                Ok(now) => return now.duration_since(started),
                Err(wake_at) => tokio::time::sleep_until(wake_at).await,
            }
        }
    }

    /// Like [`acquire`](Self::acquire), but only for a slot that opens
    /// before `deadline`.
    ///
    /// When the window stays full past the deadline the caller waits until
    /// the deadline and gets `None`; no call is recorded.
    pub async fn acquire_before(
        &self,
        class: EventClass,
        endpoint: &str,
        deadline: Instant,
    ) -> Option<Duration> {
        let started = Instant::now();
        loop {
            match self.try_record(class, endpoint) {
                Ok(now) if now < deadline => return Some(now.duration_since(started)),
                Ok(now) => {
                    self.release(class, endpoint, now);
                    return None;
                }
                Err(wake_at) if wake_at >= deadline => {
                    tokio::time::sleep_until(deadline).await;
                    return None;
                }
                Err(wake_at) => tokio::time::sleep_until(wake_at).await,
            }
        }
    }

    /// Records a call now if the window has room. Otherwise returns when the
    /// oldest call leaves the window.
    fn try_record(&self, class: EventClass, endpoint: &str) -> Result<Instant, Instant> {
        let limit = self.cost.rate_limit(class).max(1) as usize;
        let mut calls = self.lock();
        let now = Instant::now();
        let window = calls.entry((class, endpoint.to_string())).or_default();
        while window
            .front()
            .is_some_and(|t| now.duration_since(*t) >= WINDOW)
        {
            window.pop_front();
        }

        if window.len() < limit {
            window.push_back(now);
            return Ok(now);
        }

        debug!(
            class = %class,
            endpoint,
            limit,
            "Rate limit window full; waiting"
        );
        // Full window: the front entry is the next to expire.
        Err(window.front().map_or(now, |oldest| *oldest + WINDOW))
    }

    fn release(&self, class: EventClass, endpoint: &str, at: Instant) {
        if let Some(window) = self.lock().get_mut(&(class, endpoint.to_string())) {
            if let Some(pos) = window.iter().rposition(|t| *t == at) {
                window.remove(pos);
            }
        }
    }

    /// Calls recorded for the pair in the current window.
    pub fn in_window(&self, class: EventClass, endpoint: &str) -> usize {
        let now = Instant::now();
        self.lock()
            .get(&(class, endpoint.to_string()))
            .map(|window| {
                window
                    .iter()
                    .filter(|t| now.duration_since(**t) < WINDOW)
                    .count()
            })
            .unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<BucketKey, VecDeque<Instant>>> {
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
