//! Sampling verdicts. Three mutually exclusive modes; an event that loses
//! the draw is tagged with the drop sentinel and filtered out before the
//! uploader. Survivors carry the effective rate so the receiver can weight
//! statistics.

use event;
use event::Event;
use rand;
use rand::Rng;
use serde_json::Value;
use sha1::{Digest, Sha1};

pub mod dynamic;

pub use self::dynamic::DynamicSampler;

pub enum Sampler {
    /// Every event survives at rate 1.
    None,
    /// Keep 1 of every `rate` events by uniform random choice. When the
    /// stream was already thinned upstream (record pre-sampling), no second
    /// draw happens here; events are only tagged with the rate they
    /// survived.
    Static { rate: i64, already_sampled: bool },
    /// Hash a field and keep iff the leading 32 bits clear the bound; two
    /// independent agents make the same call on the same value. Events
    /// missing the field fall back to a random draw at the same rate.
    Deterministic {
        rate: i64,
        field: String,
        upper_bound: u32,
    },
    /// Window-adaptive per-key rates.
    Dynamic {
        sampler: DynamicSampler,
        fields: Vec<String>,
    },
}

impl Sampler {
    pub fn deterministic(rate: i64, field: &str) -> Sampler {
        Sampler::Deterministic {
            rate: rate,
            field: field.to_string(),
            upper_bound: u32::max_value() / rate as u32,
        }
    }

    /// Decide this event's fate: set `sample_rate` to the effective rate, or
    /// to the drop sentinel.
    pub fn sample(&self, event: &mut Event) {
        match *self {
            Sampler::None => {
                event.sample_rate = 1;
            }
            Sampler::Static {
                rate,
                already_sampled,
            } => {
                if already_sampled || keep_one_in(rate) {
                    event.sample_rate = rate;
                } else {
                    event.sample_rate = event::DROP;
                }
            }
            Sampler::Deterministic {
                rate,
                ref field,
                upper_bound,
            } => {
                event.sample_rate = rate;
                match event.data.get(field) {
                    Some(&Value::String(ref key)) => {
                        if !hash_keeps(key, upper_bound) {
                            event.sample_rate = event::DROP;
                        }
                    }
                    _ => {
                        error!(
                            "field {:?} to deterministically sample on is missing, leaving it to chance",
                            field
                        );
                        if !keep_one_in(rate) {
                            event.sample_rate = event::DROP;
                        }
                    }
                }
            }
            Sampler::Dynamic {
                ref sampler,
                ref fields,
            } => {
                let key = dynsample_key(event, fields);
                let rate = sampler.get_rate(&key);
                if keep_one_in(rate) {
                    event.sample_rate = rate;
                } else {
                    event.sample_rate = event::DROP;
                }
            }
        }
    }
}

fn keep_one_in(rate: i64) -> bool {
    rate <= 1 || rand::thread_rng().gen_range(0..rate) == 0
}

/// The deterministic verdict: SHA-1 the value, read the leading 32 bits big
/// endian, keep iff under the bound.
fn hash_keeps(key: &str, upper_bound: u32) -> bool {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    let v = (u32::from(digest[0]) << 24)
        | (u32::from(digest[1]) << 16)
        | (u32::from(digest[2]) << 8)
        | u32::from(digest[3]);
    v <= upper_bound
}

/// Concatenate the string forms of the key fields, underscore separated;
/// missing fields contribute an empty component.
fn dynsample_key(event: &Event, fields: &[String]) -> String {
    let parts: Vec<String> = fields
        .iter()
        .map(|field| match event.data.get(field) {
            Some(&Value::String(ref s)) => s.clone(),
            Some(&Value::Bool(b)) => b.to_string(),
            Some(&Value::Number(ref n)) => n.to_string(),
            _ => String::new(),
        })
        .collect();
    parts.join("_")
}

#[cfg(test)]
mod test {
    use super::*;
    use event::Event;

    #[test]
    fn test_none_tags_rate_one() {
        let s = Sampler::None;
        let mut ev = Event::new();
        ev.sample_rate = 99;
        s.sample(&mut ev);
        assert_eq!(ev.sample_rate, 1);
    }

    #[test]
    fn test_static_keeps_roughly_one_in_n() {
        let s = Sampler::Static {
            rate: 4,
            already_sampled: false,
        };
        let mut kept = 0;
        for _ in 0..4000 {
            let mut ev = Event::new();
            s.sample(&mut ev);
            if !ev.dropped() {
                assert_eq!(ev.sample_rate, 4);
                kept += 1;
            }
        }
        assert!(kept > 700 && kept < 1350, "kept {}", kept);
    }

    #[test]
    fn test_static_already_sampled_never_drops() {
        let s = Sampler::Static {
            rate: 10,
            already_sampled: true,
        };
        for _ in 0..100 {
            let mut ev = Event::new();
            s.sample(&mut ev);
            assert_eq!(ev.sample_rate, 10);
        }
    }

    #[test]
    fn test_deterministic_is_deterministic() {
        let a = Sampler::deterministic(17, "trace_id");
        let b = Sampler::deterministic(17, "trace_id");
        for i in 0..200 {
            let mut x = Event::new().insert_field("trace_id", format!("trace-{}", i));
            let mut y = Event::new().insert_field("trace_id", format!("trace-{}", i));
            a.sample(&mut x);
            b.sample(&mut y);
            assert_eq!(x.dropped(), y.dropped(), "diverged on trace-{}", i);
        }
    }

    #[test]
    fn test_deterministic_rate_one_keeps_everything() {
        let s = Sampler::deterministic(1, "id");
        for i in 0..50 {
            let mut ev = Event::new().insert_field("id", format!("{}", i));
            s.sample(&mut ev);
            assert!(!ev.dropped());
            assert_eq!(ev.sample_rate, 1);
        }
    }

    #[test]
    fn test_deterministic_keeps_a_plausible_fraction() {
        let s = Sampler::deterministic(4, "id");
        let mut kept = 0;
        for i in 0..4000 {
            let mut ev = Event::new().insert_field("id", format!("id-{}", i));
            s.sample(&mut ev);
            if !ev.dropped() {
                kept += 1;
            }
        }
        assert!(kept > 700 && kept < 1350, "kept {}", kept);
    }

    #[test]
    fn test_dynsample_key_composition() {
        let ev = Event::new()
            .insert_field("method", "GET")
            .insert_field("status", 200);
        let key = dynsample_key(
            &ev,
            &[
                "method".to_string(),
                "missing".to_string(),
                "status".to_string(),
            ],
        );
        assert_eq!(key, "GET__200");
    }
}
