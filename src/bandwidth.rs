//! Global throughput ceiling (spec.md §4.7 step 5, `max_speed`). A token
//! bucket shared by every connection worker: `acquire` blocks only as long
//! as necessary to keep the observed rate at or below the configured cap.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tokio::sync::Mutex;

const MAX_BURST_BYTES: u64 = 131_072;

pub struct BandwidthLimiter {
    limit: AtomicU64,
    available: Mutex<f64>,
    last_refill: Mutex<Instant>,
}

impl BandwidthLimiter {
    /// `limit` in bytes/sec; 0 means unlimited.
    pub fn new(limit: u64) -> Self {
        Self {
            limit: AtomicU64::new(limit),
            available: Mutex::new(MAX_BURST_BYTES as f64),
            last_refill: Mutex::new(Instant::now()),
        }
    }

    pub fn set_limit(&self, limit: u64) {
        self.limit.store(limit, Ordering::Relaxed);
    }

    pub fn limit(&self) -> u64 {
        self.limit.load(Ordering::Relaxed)
    }

    /// Block until `bytes` worth of tokens are available. Returns
    /// immediately when unlimited.
    pub async fn acquire(&self, bytes: u64) {
        let limit = self.limit.load(Ordering::Relaxed);
        if limit == 0 {
            return;
        }

        let sleep_for = {
            let mut available = self.available.lock().await;
            let mut last_refill = self.last_refill.lock().await;

            let elapsed = last_refill.elapsed().as_secs_f64();
            *available = (*available + elapsed * limit as f64).min(MAX_BURST_BYTES as f64);
            *last_refill = Instant::now();

            if *available >= bytes as f64 {
                *available -= bytes as f64;
                return;
            }

            let deficit = bytes as f64 - *available;
            *available -= bytes as f64;
            deficit / limit as f64
        };

        tokio::time::sleep(std::time::Duration::from_secs_f64(sleep_for)).await;
    }
}
