//! Wall-clock aligned ticker.
//!
//! Tick boundaries fall on multiples of the period on the wall clock, so
//! every job in every plugin fires on the same second. The delivered value
//! is the epoch second of the boundary.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub struct Ticker {
    every: Duration,
}

impl Ticker {
    pub fn new(every: Duration) -> Self {
        Ticker {
            every: every.max(Duration::from_millis(1)),
        }
    }

    /// Sleep until the next period boundary and return its epoch second.
    pub async fn tick(&mut self) -> i64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let every_ms = self.every.as_millis().max(1);
        let now_ms = now.as_millis();
        let next_ms = (now_ms / every_ms + 1) * every_ms;
        tokio::time::sleep(Duration::from_millis((next_ms - now_ms) as u64)).await;
        (next_ms / 1000) as i64
    }
}
