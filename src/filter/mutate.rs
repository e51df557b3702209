//! The field-level mutations, applied in a fixed order per event: drop,
//! scrub, add, JSON sub-field decode, rename.

use event::Event;
use filter::{Filter, FilterError};
use serde_json;
use serde_json::Map;
use serde_json::Value;
use sha2::{Digest, Sha256};

pub struct FieldMutator {
    drop_fields: Vec<String>,
    scrub_fields: Vec<String>,
    add_fields: Vec<(String, String)>,
    json_fields: Vec<String>,
    rename_fields: Vec<(String, String)>,
}

impl FieldMutator {
    pub fn new(
        drop_fields: Vec<String>,
        mut scrub_fields: Vec<String>,
        add_fields: Vec<(String, String)>,
        json_fields: Vec<String>,
        rename_fields: Vec<(String, String)>,
    ) -> FieldMutator {
        // a field listed twice must hash once
        scrub_fields.sort();
        scrub_fields.dedup();
        FieldMutator {
            drop_fields: drop_fields,
            scrub_fields: scrub_fields,
            add_fields: add_fields,
            json_fields: json_fields,
            rename_fields: rename_fields,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.drop_fields.is_empty()
            && self.scrub_fields.is_empty()
            && self.add_fields.is_empty()
            && self.json_fields.is_empty()
            && self.rename_fields.is_empty()
    }
}

/// The string form a value is hashed under when scrubbed: strings hash
/// their raw bytes, everything else its JSON text.
fn format_value(val: &Value) -> String {
    match *val {
        Value::String(ref s) => s.clone(),
        ref other => other.to_string(),
    }
}

fn scrub(val: &Value) -> Value {
    let mut hasher = Sha256::new();
    hasher.update(format_value(val).as_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(64);
    for byte in digest.iter() {
        hex.push_str(&format!("{:02x}", byte));
    }
    Value::String(hex)
}

impl Filter for FieldMutator {
    fn name(&self) -> &'static str {
        "mutate"
    }

    fn process(&self, event: &mut Event) -> Result<(), FilterError> {
        for field in &self.drop_fields {
            event.data.remove(field);
        }
        for field in &self.scrub_fields {
            if let Some(val) = event.data.get(field).cloned() {
                event.data.insert(field.clone(), scrub(&val));
            }
        }
        for &(ref key, ref val) in &self.add_fields {
            event
                .data
                .insert(key.clone(), Value::String(val.clone()));
        }
        for field in &self.json_fields {
            let decoded = match event.data.get(field) {
                Some(&Value::String(ref raw)) => {
                    match serde_json::from_str::<Map<String, Value>>(raw) {
                        Ok(map) => Some(Value::Object(map)),
                        Err(e) => {
                            warn!("field {:?} did not decode as a json object: {}", field, e);
                            None
                        }
                    }
                }
                Some(_) => {
                    warn!("field {:?} is not a string, cannot json decode", field);
                    None
                }
                None => None,
            };
            if let Some(decoded) = decoded {
                event.data.insert(field.clone(), decoded);
            }
        }
        for &(ref before, ref after) in &self.rename_fields {
            match event.data.remove(before) {
                Some(val) => {
                    event.data.insert(after.clone(), val);
                }
                None => {
                    debug!("rename source field {:?} not present on event", before);
                }
            }
        }
        Ok(())
    }
}
