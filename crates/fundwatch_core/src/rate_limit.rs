use std::sync::Mutex;
use std::thread::sleep;
use std::time::Duration;

use tokio::time::Instant;

/// Shared async limiter: a single-token bucket refilled `rate` times per second.
///
/// Each caller reserves the next free slot under a short lock and then sleeps
/// outside it, so slots are handed out exactly `1/rate` apart and any
/// one-second window holds at most `rate` releases.
#[derive(Debug)]
pub struct TokenBucket {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl TokenBucket {
    pub fn new(rate_per_second: u32) -> Self {
        Self {
            interval: Duration::from_secs_f64(1.0 / f64::from(rate_per_second.max(1))),
            next_slot: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait for a token; returns the instant the token was released.
    pub async fn acquire(&self) -> Instant {
        let slot = self.reserve(Instant::now());
        tokio::time::sleep_until(slot).await;
        slot
    }

    fn reserve(&self, now: Instant) -> Instant {
        let mut next = match self.next_slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let slot = match *next {
            Some(candidate) if candidate > now => candidate,
            _ => now,
        };
        *next = Some(slot + self.interval);
        slot
    }
}

/// Minimum spacing between consecutive requests from one blocking worker.
#[derive(Debug)]
pub struct Pacer {
    min_interval: Duration,
    last_request_at: Option<std::time::Instant>,
}

impl Pacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request_at: None,
        }
    }

    pub fn per_second(rate_per_second: u32) -> Self {
        Self::new(Duration::from_secs_f64(1.0 / f64::from(rate_per_second.max(1))))
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub fn wait(&mut self) {
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < self.min_interval {
                sleep(self.min_interval - elapsed);
            }
        }
        self.last_request_at = Some(std::time::Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::time::Instant;

    use super::{Pacer, TokenBucket};

    fn max_in_any_window(mut stamps: Vec<Instant>, window: Duration) -> usize {
        stamps.sort();
        let mut best = 0;
        let mut start = 0;
        for end in 0..stamps.len() {
            while stamps[end] - stamps[start] >= window {
                start += 1;
            }
            best = best.max(end - start + 1);
        }
        best
    }

    #[tokio::test(start_paused = true)]
    async fn thousand_concurrent_acquires_stay_under_ceiling() {
        let bucket = Arc::new(TokenBucket::new(8));
        let mut handles = Vec::with_capacity(1000);
        for _ in 0..1000 {
            let bucket = Arc::clone(&bucket);
            handles.push(tokio::spawn(async move { bucket.acquire().await }));
        }
        let mut stamps = Vec::with_capacity(1000);
        for handle in handles {
            stamps.push(handle.await.expect("acquire task"));
        }

        assert_eq!(stamps.len(), 1000);
        assert!(max_in_any_window(stamps, Duration::from_secs(1)) <= 8);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_bucket_releases_immediately() {
        let bucket = TokenBucket::new(8);
        let before = Instant::now();
        let first = bucket.acquire().await;
        assert_eq!(first, before);
        let second = bucket.acquire().await;
        assert_eq!(second - first, bucket.interval());
    }

    #[test]
    fn pacer_spacing_follows_rate() {
        let pacer = Pacer::per_second(4);
        assert_eq!(pacer.min_interval(), Duration::from_millis(250));
    }

    #[test]
    fn pacer_waits_between_requests() {
        let mut pacer = Pacer::new(Duration::from_millis(20));
        let start = std::time::Instant::now();
        pacer.wait();
        pacer.wait();
        pacer.wait();
        assert!(start.elapsed() >= Duration::from_millis(40));
    }
}
