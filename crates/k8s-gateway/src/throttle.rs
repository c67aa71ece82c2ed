//! Client-side request pacing.
//!
//! The orchestrator API is the one shared external resource, so every
//! gateway call passes through a token bucket sized by a sustained QPS and
//! a burst allowance.

use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

/// Token bucket gating requests against the API server.
pub struct RateGate {
    qps: f64,
    burst: f64,
    state: Mutex<Bucket>,
}

struct Bucket {
    tokens: f64,
    refilled: Instant,
}

impl RateGate {
    pub fn new(qps: u32, burst: u32) -> Self {
        let qps = f64::from(qps.max(1));
        let burst = f64::from(burst.max(1));
        Self {
            qps,
            burst,
            state: Mutex::new(Bucket {
                tokens: burst,
                refilled: Instant::now(),
            }),
        }
    }

    /// Waits until a request slot is available.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.refilled).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
                bucket.refilled = now;
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / self.qps)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn burst_is_served_immediately() {
        let gate = RateGate::new(10, 3);
        let start = Instant::now();
        for _ in 0..3 {
            gate.acquire().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn drained_bucket_paces_at_qps() {
        let gate = RateGate::new(10, 1);
        gate.acquire().await;

        let start = Instant::now();
        gate.acquire().await;
        // One token refills in 1/qps seconds of (auto-advanced) test time.
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_time_refills_up_to_burst() {
        let gate = RateGate::new(10, 2);
        gate.acquire().await;
        gate.acquire().await;

        tokio::time::advance(Duration::from_secs(60)).await;

        let start = Instant::now();
        gate.acquire().await;
        gate.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        // Third request exceeds the burst and must wait.
        let start = Instant::now();
        gate.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(100));
    }
}
