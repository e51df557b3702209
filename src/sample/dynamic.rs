//! The rate-adaptive sampler. Per-key traffic counts accumulate in a
//! sliding window; at each window boundary every key is assigned a new rate
//! aimed at an aggregate goal rate, with quiet traffic exempted by an
//! events-per-second floor. Keys get a share of the budget proportional to
//! the log of their count, so heavy keys are squeezed hard and rare keys
//! survive. State is confined here; the only surface is `get_rate`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub struct DynamicSampler {
    goal_rate: i64,
    window: Duration,
    min_events_per_sec: f64,
    inner: Mutex<Inner>,
}

struct Inner {
    window_start: Instant,
    current_counts: HashMap<String, u64>,
    saved_rates: HashMap<String, i64>,
}

impl DynamicSampler {
    pub fn new(goal_rate: i64, window_secs: u64, min_events_per_sec: i64) -> DynamicSampler {
        DynamicSampler {
            goal_rate: ::std::cmp::max(1, goal_rate),
            window: Duration::from_secs(::std::cmp::max(1, window_secs)),
            min_events_per_sec: min_events_per_sec as f64,
            inner: Mutex::new(Inner {
                window_start: Instant::now(),
                current_counts: HashMap::new(),
                saved_rates: HashMap::new(),
            }),
        }
    }

    /// Record one occurrence of `key` and return the rate in force for it.
    /// Unseen keys sample at 1 until the next window roll has data for them.
    pub fn get_rate(&self, key: &str) -> i64 {
        let mut inner = self.inner.lock().expect("dynamic sampler lock poisoned");
        if inner.window_start.elapsed() >= self.window {
            self.roll_window(&mut inner);
        }
        *inner.current_counts.entry(key.to_string()).or_insert(0) += 1;
        *inner.saved_rates.get(key).unwrap_or(&1)
    }

    fn roll_window(&self, inner: &mut Inner) {
        let counts = ::std::mem::replace(&mut inner.current_counts, HashMap::new());
        inner.window_start = Instant::now();
        inner.saved_rates = self.compute_rates(&counts);
    }

    fn compute_rates(&self, counts: &HashMap<String, u64>) -> HashMap<String, i64> {
        let mut rates = HashMap::new();
        if counts.is_empty() {
            return rates;
        }
        let sum_events: u64 = counts.values().sum();
        // below the floor nothing is worth dropping
        let per_sec = sum_events as f64 / self.window.as_secs() as f64;
        if per_sec < self.min_events_per_sec {
            for key in counts.keys() {
                rates.insert(key.clone(), 1);
            }
            return rates;
        }

        let goal_count = sum_events as f64 / self.goal_rate as f64;
        let log_sum: f64 = counts.values().map(|&c| (c as f64).log10()).sum();
        if log_sum == 0.0 {
            for key in counts.keys() {
                rates.insert(key.clone(), 1);
            }
            return rates;
        }
        let goal_ratio = goal_count / log_sum;

        // iterate keys in a fixed order so the redistribution of unspent
        // budget is reproducible
        let mut keys: Vec<&String> = counts.keys().collect();
        keys.sort();
        let mut keys_remaining = keys.len();
        let mut extra = 0.0_f64;
        for key in keys {
            let count = counts[key] as f64;
            let mut goal_for_key = f64::max(1.0, count.log10() * goal_ratio);
            let extra_for_key = extra / keys_remaining as f64;
            goal_for_key += extra_for_key;
            extra -= extra_for_key;
            keys_remaining -= 1;
            if count <= goal_for_key {
                // fewer events than this key's allotment: keep them all and
                // donate the slack
                rates.insert(key.clone(), 1);
                extra += goal_for_key - count;
            } else {
                let rate = (count / goal_for_key).ceil();
                let rate = if rate.is_finite() { rate as i64 } else { 1 };
                rates.insert(key.clone(), ::std::cmp::max(1, rate));
                extra += goal_for_key - count / rate as f64;
            }
        }
        rates
    }
}
