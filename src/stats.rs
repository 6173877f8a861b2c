/* src/stats.rs */

use crate::materializer::supported_types;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

pub const QUERY_KEY: &str = "query";

/// Fire-and-forget counters. Nothing in the query path reads them back.
pub trait Stats: Send + Sync {
    fn add_to_meter(&self, key: &str, delta: i64);
}

/// Counts one inbound question: `query.total` and `query.<type>`.
pub fn meter_query(stats: &dyn Stats, rtype: &str) {
    stats.add_to_meter(&format!("{QUERY_KEY}.total"), 1);
    stats.add_to_meter(&format!("{QUERY_KEY}.{rtype}"), 1);
}

/// Exponentially weighted moving averages are advanced every five seconds.
const TICK: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
struct Ewma {
    alpha: f64,
    /// Events per second.
    rate: f64,
    primed: bool,
}

impl Ewma {
    fn over_minutes(minutes: f64) -> Self {
        Self {
            alpha: 1.0 - (-TICK.as_secs_f64() / 60.0 / minutes).exp(),
            rate: 0.0,
            primed: false,
        }
    }

    fn tick(&mut self, events: i64) {
        let instant = events as f64 / TICK.as_secs_f64();
        if self.primed {
            self.rate += self.alpha * (instant - self.rate);
        } else {
            self.rate = instant;
            self.primed = true;
        }
    }
}

/// 1, 5 and 15 minute load averages, ticked lazily on access.
#[derive(Debug)]
struct Rates {
    last_tick: Instant,
    uncounted: i64,
    windows: [Ewma; 3],
}

impl Rates {
    fn new(now: Instant) -> Self {
        Self {
            last_tick: now,
            uncounted: 0,
            windows: [
                Ewma::over_minutes(1.0),
                Ewma::over_minutes(5.0),
                Ewma::over_minutes(15.0),
            ],
        }
    }

    fn catch_up(&mut self, now: Instant) {
        while now.saturating_duration_since(self.last_tick) >= TICK {
            for window in &mut self.windows {
                window.tick(self.uncounted);
            }
            self.uncounted = 0;
            self.last_tick += TICK;
        }
    }

    fn mark(&mut self, now: Instant, delta: i64) {
        self.catch_up(now);
        self.uncounted += delta;
    }
}

#[derive(Debug)]
struct Meter {
    count: AtomicI64,
    rates: Mutex<Rates>,
}

impl Meter {
    fn new(now: Instant) -> Self {
        Self {
            count: AtomicI64::new(0),
            rates: Mutex::new(Rates::new(now)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeterSnapshot {
    pub count: i64,
    #[serde(rename = "1m.rate")]
    pub rate1: f64,
    #[serde(rename = "5m.rate")]
    pub rate5: f64,
    #[serde(rename = "15m.rate")]
    pub rate15: f64,
    #[serde(rename = "mean.rate")]
    pub mean_rate: f64,
}

/// Named meters, safe to bump from every transport at once. Keys are
/// lowercased on the way in.
pub struct MeterRegistry {
    started: Instant,
    meters: RwLock<HashMap<String, Arc<Meter>>>,
}

impl Default for MeterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MeterRegistry {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            meters: RwLock::new(HashMap::new()),
        }
    }

    /// A registry with a zeroed meter for the total and each served type.
    pub fn with_query_meters() -> Self {
        let registry = Self::new();
        registry.add_to_meter(&format!("{QUERY_KEY}.total"), 0);
        for rtype in supported_types() {
            registry.add_to_meter(&format!("{QUERY_KEY}.{rtype}"), 0);
        }
        registry
    }

    #[cfg(test)]
    pub fn count(&self, key: &str) -> i64 {
        self.meters
            .read()
            .get(&key.to_lowercase())
            .map(|meter| meter.count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> BTreeMap<String, MeterSnapshot> {
        let now = Instant::now();
        let elapsed = now
            .saturating_duration_since(self.started)
            .as_secs_f64()
            .max(f64::EPSILON);
        self.meters
            .read()
            .iter()
            .map(|(key, meter)| {
                let count = meter.count.load(Ordering::Relaxed);
                let mut rates = meter.rates.lock();
                rates.catch_up(now);
                let [rate1, rate5, rate15] = rates.windows.map(|w| w.rate);
                let snapshot = MeterSnapshot {
                    count,
                    rate1,
                    rate5,
                    rate15,
                    mean_rate: count as f64 / elapsed,
                };
                (key.clone(), snapshot)
            })
            .collect()
    }

    fn meter(&self, key: &str) -> Arc<Meter> {
        if let Some(meter) = self.meters.read().get(key) {
            return meter.clone();
        }
        self.meters
            .write()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Meter::new(Instant::now())))
            .clone()
    }
}

impl Stats for MeterRegistry {
    fn add_to_meter(&self, key: &str, delta: i64) {
        let meter = self.meter(&key.to_lowercase());
        meter.count.fetch_add(delta, Ordering::Relaxed);
        meter.rates.lock().mark(Instant::now(), delta);
    }
}
