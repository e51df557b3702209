use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Map;
use serde_json::Value;

/// Sentinel sample rate marking an event that sampling has discarded but that
/// has not yet been removed from the stream.
pub const DROP: i64 = -1;

/// A structured piece of a log, plus associated metadata
///
/// An `Event` is produced by a parser from one logical log record. Its `data`
/// holds whatever fields the parser (and later the filters) extracted; values
/// are heterogeneous scalars, or nested maps for JSON sub-documents. The
/// transform and sample stages mutate an `Event` in place while they own it;
/// the uploader treats it as read-only.
#[derive(PartialEq, Debug, Clone)]
pub struct Event {
    /// The instant this event occupies, UTC unless an explicit zone was
    /// extracted from the log line.
    pub timestamp: DateTime<Utc>,
    /// Fields parsed out of the log record, a key/value structure
    pub data: Map<String, Value>,
    /// How many occurrences this event statistically represents. `DROP` marks
    /// an event discarded by sampling.
    pub sample_rate: i64,
}

impl Event {
    /// Create a new `Event` stamped with the current wall clock and a sample
    /// rate of 1.
    pub fn new() -> Event {
        Event {
            timestamp: Utc::now(),
            data: Map::new(),
            sample_rate: 1,
        }
    }

    /// Set the timestamp of the Event
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Event {
        self.timestamp = timestamp;
        self
    }

    /// Insert a new field into the Event
    ///
    /// If the key was already present the old value is replaced.
    pub fn insert_field<V>(mut self, key: &str, val: V) -> Event
    where
        V: Into<Value>,
    {
        self.data.insert(key.to_string(), val.into());
        self
    }

    /// True when sampling has marked this event for removal.
    pub fn dropped(&self) -> bool {
        self.sample_rate == DROP
    }

    /// The wire form of this event for the batch endpoint: a `time`, a
    /// `samplerate` and the `data` object.
    pub fn to_wire(&self) -> Value {
        json!({
            "time": self.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
            "samplerate": self.sample_rate,
            "data": Value::Object(self.data.clone()),
        })
    }
}

impl Default for Event {
    fn default() -> Event {
        Event::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_wire_form_carries_time_rate_and_data() {
        let ts = Utc.with_ymd_and_hms(2021, 3, 4, 5, 6, 7).unwrap();
        let ev = Event::new()
            .timestamp(ts)
            .insert_field("format", "json")
            .insert_field("count", 3);
        let wire = ev.to_wire();
        assert_eq!(wire["samplerate"], json!(1));
        assert_eq!(wire["data"]["format"], json!("json"));
        assert_eq!(wire["data"]["count"], json!(3));
        assert!(wire["time"]
            .as_str()
            .unwrap()
            .starts_with("2021-03-04T05:06:07"));
    }

    #[test]
    fn test_drop_sentinel() {
        let mut ev = Event::new();
        assert!(!ev.dropped());
        ev.sample_rate = DROP;
        assert!(ev.dropped());
    }
}
