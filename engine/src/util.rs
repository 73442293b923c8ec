// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use std::time::{Duration, Instant};

/// Token-bucket gate for log statements that can fire per packet.
///
/// A storm of identical failures (bad upcalls, put errors, stats anomalies)
/// must not flood the log; callers check `admit` and count drops instead.
#[derive(Debug)]
pub struct RateLimit {
    tokens: u32,
    burst: u32,
    per_token: Duration,
    last_fill: Option<Instant>,
    pub n_dropped: u64,
}

impl RateLimit {
    /// `rate` events per minute, bursting to `burst`.
    #[must_use]
    pub fn new(rate_per_min: u32, burst: u32) -> RateLimit {
        RateLimit {
            tokens: burst,
            burst,
            per_token: Duration::from_secs(60) / rate_per_min.max(1),
            last_fill: None,
            n_dropped: 0,
        }
    }

    /// May one more event be logged at `now`?
    pub fn admit(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last_fill {
            let refill = (now.saturating_duration_since(last).as_nanos()
                / self.per_token.as_nanos().max(1)) as u32;
            if refill > 0 {
                self.tokens = (self.tokens + refill).min(self.burst);
                self.last_fill = Some(now);
            }
        } else {
            self.last_fill = Some(now);
        }
        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            self.n_dropped += 1;
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_then_refuse() {
        let mut rl = RateLimit::new(60, 3);
        let now = Instant::now();
        assert!(rl.admit(now));
        assert!(rl.admit(now));
        assert!(rl.admit(now));
        assert!(!rl.admit(now));
        assert_eq!(rl.n_dropped, 1);
    }

    #[test]
    fn refills_over_time() {
        let mut rl = RateLimit::new(60, 1);
        let now = Instant::now();
        assert!(rl.admit(now));
        assert!(!rl.admit(now));
        assert!(rl.admit(now + Duration::from_secs(2)));
    }
}
