//! `key=value` pairs separated by whitespace, with double-quoted values
//! allowed to contain spaces. Values are coerced to the narrowest scalar
//! that fits: bool, integer, float, then string.

use parser;
use parser::{InitError, Options, PrefixRegex};
use serde_json::Map;
use serde_json::Number;
use serde_json::Value;
use std::sync::Arc;
use util::{EventSnd, LineRcv};

#[derive(Default)]
pub struct Parser {
    options: Options,
}

impl parser::Parser for Parser {
    fn init(&mut self, options: &Options) -> Result<(), InitError> {
        self.options = options.clone();
        Ok(())
    }

    fn process_lines(&mut self, lines: LineRcv, events: EventSnd, prefix: Option<Arc<PrefixRegex>>) {
        for line in lines.iter() {
            let (rest, prefix_fields) = match prefix {
                Some(ref pre) => pre.strip(&line),
                None => (line.as_str(), Vec::new()),
            };
            let parsed = parse_line(rest);
            if parsed.is_empty() {
                debug!("skipping line, no key=value pairs found: {}", rest);
                continue;
            }
            if !parser::emit(parsed, prefix_fields, &self.options, 1, &events) {
                break;
            }
        }
        debug!("lines channel is closed, ending keyval processor");
    }
}

fn parse_line(line: &str) -> Map<String, Value> {
    let mut parsed = Map::new();
    for token in tokenize(line) {
        let mut split = token.splitn(2, '=');
        let key = match split.next() {
            Some(k) if !k.is_empty() => k,
            _ => continue,
        };
        let val = match split.next() {
            Some(v) => v,
            None => continue,
        };
        parsed.insert(key.to_string(), coerce(val));
    }
    parsed
}

/// Split on whitespace, except inside double quotes.
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in line.chars() {
        match c {
            '"' => quoted = !quoted,
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    tokens.push(current.clone());
                    current.clear();
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn coerce(raw: &str) -> Value {
    match raw {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(i) = raw.parse::<i64>() {
        return Value::Number(Number::from(i));
    }
    if let Ok(f) = raw.parse::<f64>() {
        if let Some(n) = Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    Value::String(raw.to_string())
}
