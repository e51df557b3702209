//! Data augmentation: a JSON map loaded once at startup of the shape
//! `{ source_field: { match_value: { new_field: new_value, ... } } }`. When
//! an event's source field is a string equal to one of the match values, the
//! new fields are merged in. On key collision the later write wins, in
//! declared order, like every other merge in this pipeline.

use event::Event;
use filter::{Filter, FilterError};
use serde_json;
use serde_json::Map;
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

pub struct Augmenter {
    map: HashMap<String, HashMap<String, Map<String, Value>>>,
}

impl Augmenter {
    pub fn from_file(path: &Path) -> Result<Augmenter, String> {
        let raw = fs::read_to_string(path)
            .map_err(|e| format!("failed to read augmentation map {:?}: {}", path, e))?;
        Augmenter::from_str(&raw)
            .map_err(|e| format!("failed to decode augmentation map {:?}: {}", path, e))
    }

    pub fn from_str(raw: &str) -> Result<Augmenter, serde_json::Error> {
        let map = serde_json::from_str(raw)?;
        Ok(Augmenter { map: map })
    }
}

impl Filter for Augmenter {
    fn name(&self) -> &'static str {
        "augment"
    }

    fn process(&self, event: &mut Event) -> Result<(), FilterError> {
        for (source_field, matches) in &self.map {
            let hit = match event.data.get(source_field) {
                Some(&Value::String(ref val)) => matches.get(val),
                _ => None,
            };
            if let Some(new_fields) = hit {
                for (k, v) in new_fields {
                    event.data.insert(k.clone(), v.clone());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use event::Event;

    const MAP: &str = r#"{
        "ip": {
            "10.0.0.1": {"hostname": "web01", "rack": 3},
            "10.0.0.2": {"hostname": "web02"}
        }
    }"#;

    #[test]
    fn test_matching_value_merges_fields() {
        let a = Augmenter::from_str(MAP).unwrap();
        let mut ev = Event::new().insert_field("ip", "10.0.0.1");
        a.process(&mut ev).unwrap();
        assert_eq!(ev.data["hostname"], json!("web01"));
        assert_eq!(ev.data["rack"], json!(3));
    }

    #[test]
    fn test_no_match_leaves_event_alone() {
        let a = Augmenter::from_str(MAP).unwrap();
        let mut ev = Event::new().insert_field("ip", "192.168.0.1");
        a.process(&mut ev).unwrap();
        assert!(!ev.data.contains_key("hostname"));
    }

    #[test]
    fn test_non_string_source_is_skipped() {
        let a = Augmenter::from_str(MAP).unwrap();
        let mut ev = Event::new().insert_field("ip", 10);
        a.process(&mut ev).unwrap();
        assert!(!ev.data.contains_key("hostname"));
    }

    #[test]
    fn test_collision_last_writer_wins() {
        let a = Augmenter::from_str(MAP).unwrap();
        let mut ev = Event::new()
            .insert_field("ip", "10.0.0.2")
            .insert_field("hostname", "stale");
        a.process(&mut ev).unwrap();
        assert_eq!(ev.data["hostname"], json!("web02"));
    }
}
