// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use std::time::{Duration, Instant};

/// Exponentially weighted moving average with a configurable e-folding time.
#[derive(Debug)]
pub struct Ewma {
    last: Option<(Instant, f64)>,
    tau: f64,
}

impl Ewma {
    #[must_use]
    pub fn new(tau: Duration) -> Ewma {
        Ewma {
            last: None,
            tau: tau.as_nanos() as f64 / 1_000_000_000.0,
        }
    }

    #[must_use]
    pub fn get(&self) -> f64 {
        self.last.map(|(_, v)| v).unwrap_or_default()
    }

    pub fn update(&mut self, now: Instant, value: f64) -> f64 {
        let Some((last_time, last_val)) = self.last else {
            self.last = Some((now, value));
            return value;
        };
        if last_time >= now {
            self.last = Some((now, value));
            return value;
        }
        let step = (now - last_time).as_nanos() as f64 / 1_000_000_000.0;
        let alpha = (-step / self.tau).exp();
        let new = value * (1.0 - alpha) + last_val * alpha;
        self.last = Some((now, new));
        new
    }
}

/// Paired add/del averages over one window.
#[derive(Debug)]
pub struct AddDelRate {
    pub add: Ewma,
    pub del: Ewma,
}

impl AddDelRate {
    #[must_use]
    pub fn new(tau: Duration) -> AddDelRate {
        AddDelRate {
            add: Ewma::new(tau),
            del: Ewma::new(tau),
        }
    }
}

/// Subfacet churn accounting for one backer, surfaced by `dpif/show`.
#[derive(Debug)]
pub struct SubfacetRates {
    pub hourly: AddDelRate,
    pub daily: AddDelRate,
    pub max_n_subfacets: usize,
    pub total_lifespan: Duration,
    pub n_destroyed: u64,
    pub n_update_stats: u64,
    window_adds: f64,
    window_dels: f64,
    window_start: Option<Instant>,
}

impl SubfacetRates {
    #[must_use]
    pub fn new() -> SubfacetRates {
        SubfacetRates {
            hourly: AddDelRate::new(Duration::from_secs(3600)),
            daily: AddDelRate::new(Duration::from_secs(24 * 3600)),
            max_n_subfacets: 0,
            total_lifespan: Duration::ZERO,
            n_destroyed: 0,
            n_update_stats: 0,
            window_adds: 0.0,
            window_dels: 0.0,
            window_start: None,
        }
    }

    pub fn note_add(&mut self, n_subfacets: usize) {
        self.window_adds += 1.0;
        self.max_n_subfacets = self.max_n_subfacets.max(n_subfacets);
    }

    pub fn note_del(&mut self, lifespan: Duration) {
        self.window_dels += 1.0;
        self.n_destroyed += 1;
        self.total_lifespan += lifespan;
    }

    /// Mean subfacet lifetime in milliseconds.
    #[must_use]
    pub fn avg_lifespan_ms(&self) -> u64 {
        if self.n_destroyed == 0 {
            return 0;
        }
        (self.total_lifespan.as_millis() / u128::from(self.n_destroyed)) as u64
    }

    /// Fold the window counters into the averages; called once per stats
    /// pull.
    pub fn roll(&mut self, now: Instant) {
        if self.window_start.is_some() {
            self.hourly.add.update(now, self.window_adds);
            self.hourly.del.update(now, self.window_dels);
            self.daily.add.update(now, self.window_adds);
            self.daily.del.update(now, self.window_dels);
        }
        self.window_start = Some(now);
        self.window_adds = 0.0;
        self.window_dels = 0.0;
    }
}

impl Default for SubfacetRates {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ewma_converges_toward_input() {
        let t0 = Instant::now();
        let mut e = Ewma::new(Duration::from_secs(10));
        e.update(t0, 0.0);
        let mut v = 0.0;
        for i in 1..=100 {
            v = e.update(t0 + Duration::from_secs(i), 10.0);
        }
        assert!(v > 9.9, "converged to {v}");
    }

    #[test]
    fn ewma_weights_recent_more_with_small_tau() {
        let t0 = Instant::now();
        let mut fast = Ewma::new(Duration::from_secs(1));
        let mut slow = Ewma::new(Duration::from_secs(100));
        fast.update(t0, 0.0);
        slow.update(t0, 0.0);
        let f = fast.update(t0 + Duration::from_secs(5), 10.0);
        let s = slow.update(t0 + Duration::from_secs(5), 10.0);
        assert!(f > s);
    }

    #[test]
    fn lifespan_average() {
        let mut r = SubfacetRates::new();
        r.note_del(Duration::from_millis(100));
        r.note_del(Duration::from_millis(300));
        assert_eq!(r.avg_lifespan_ms(), 200);
    }
}
