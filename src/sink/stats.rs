//! Running totals over upload responses: counts per status code and
//! response body, round-trip duration extremes, and one sample event per
//! reporting interval. A periodic task logs and resets the interval
//! numbers; lifetime totals survive resets and are printed once at exit.

use event::Event;
use sink::Response;
use std::collections::HashMap;
use std::time::Duration;

pub struct ResponseStats {
    count: u64,
    status_codes: HashMap<u16, u64>,
    bodies: HashMap<String, u64>,
    errors: HashMap<String, u64>,
    max_duration: Duration,
    sum_duration: Duration,
    min_duration: Option<Duration>,
    event: Option<Event>,

    total_count: u64,
    total_status_codes: HashMap<u16, u64>,
}

impl ResponseStats {
    pub fn new() -> ResponseStats {
        ResponseStats {
            count: 0,
            status_codes: HashMap::new(),
            bodies: HashMap::new(),
            errors: HashMap::new(),
            max_duration: Duration::from_secs(0),
            sum_duration: Duration::from_secs(0),
            min_duration: None,
            event: None,
            total_count: 0,
            total_status_codes: HashMap::new(),
        }
    }

    pub fn update(&mut self, rsp: &Response) {
        self.count += 1;
        *self.status_codes.entry(rsp.status).or_insert(0) += 1;
        *self
            .bodies
            .entry(rsp.body.trim().to_string())
            .or_insert(0) += 1;
        if let Some(ref err) = rsp.error {
            *self.errors.entry(err.clone()).or_insert(0) += 1;
        }
        if self.min_duration.map_or(true, |min| rsp.duration < min) {
            self.min_duration = Some(rsp.duration);
        }
        if rsp.duration > self.max_duration {
            self.max_duration = rsp.duration;
        }
        self.sum_duration += rsp.duration;
        // hold one full event per reporting cycle as a parse sanity check
        if self.event.is_none() {
            self.event = Some(rsp.event.clone());
        }
    }

    #[cfg(test)]
    pub fn count(&self) -> u64 {
        self.count
    }

    #[cfg(test)]
    pub fn status_count(&self, status: u16) -> u64 {
        *self.status_codes.get(&status).unwrap_or(&0)
    }

    pub fn log(&self) {
        let avg = if self.count > 0 {
            self.sum_duration / self.count as u32
        } else {
            Duration::from_secs(0)
        };
        info!(
            "sent events summary: count={} lifetime_count={} fastest={:?} slowest={:?} avg_duration={:?} count_per_status={:?} response_bodies={:?} errors={:?}",
            self.count,
            self.total_count + self.count,
            self.min_duration.unwrap_or_else(|| Duration::from_secs(0)),
            self.max_duration,
            avg,
            self.status_codes,
            self.bodies,
            self.errors,
        );
        if let Some(ref ev) = self.event {
            info!(
                "sample parsed event: timestamp={} data={}",
                ev.timestamp,
                ::serde_json::Value::Object(ev.data.clone())
            );
        }
    }

    pub fn log_and_reset(&mut self) {
        self.log();
        self.reset();
    }

    /// Fold the interval into the lifetime totals and print them.
    pub fn log_final(&mut self) {
        self.roll_totals();
        info!(
            "total attempted sends={} by response status code={:?}",
            self.total_count, self.total_status_codes
        );
    }

    fn roll_totals(&mut self) {
        self.total_count += self.count;
        for (code, count) in self.status_codes.drain() {
            *self.total_status_codes.entry(code).or_insert(0) += count;
        }
        self.count = 0;
    }

    fn reset(&mut self) {
        self.roll_totals();
        self.bodies.clear();
        self.errors.clear();
        self.max_duration = Duration::from_secs(0);
        self.sum_duration = Duration::from_secs(0);
        self.min_duration = None;
        self.event = None;
    }
}

impl Default for ResponseStats {
    fn default() -> ResponseStats {
        ResponseStats::new()
    }
}
