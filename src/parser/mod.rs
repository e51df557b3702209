//! Parsers turn raw log lines into events.
//!
//! A parser drains its line source until the channel closes, reassembling
//! multi-line records where the format calls for it, and pushes zero or more
//! events per record at the sink. Parsers never close the sink; the
//! supervisor owns channel lifetimes. Each format lives in its own module
//! behind the `Parser` trait and is constructed by name through
//! `new_parser`.

use event::Event;
use regex;
use regex::Regex;
use serde_json::Map;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use time;
use time::TimeLocation;
use util::{EventSnd, LineRcv};

pub mod json;
pub mod keyval;
pub mod regexp;

/// Options shared by the parser modules. Validated by `init`; the
/// per-format knobs are simply ignored by formats they do not apply to.
#[derive(Debug, Clone)]
pub struct Options {
    /// Field holding the record timestamp, if the operator knows it.
    pub time_field: Option<String>,
    /// Format for `time_field`, already translated to the chrono dialect.
    pub time_format: Option<String>,
    /// Zone assumed for zoneless timestamps.
    pub location: TimeLocation,
    /// Parse workers fanned out over grouped records. Grouping itself is
    /// single threaded per source, so order holds at 1 (the default).
    pub num_parsers: usize,
    /// Keep 1 of every N record groups before parsing; 1 disables. Only
    /// grouping parsers honor this.
    pub pre_sample_rate: i64,
    /// Line pattern for the regex parser.
    pub line_regex: Option<String>,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            time_field: None,
            time_format: None,
            location: TimeLocation::Utc,
            num_parsers: 1,
            pre_sample_rate: 1,
            line_regex: None,
        }
    }
}

/// A parser configuration the operator has to fix before the pipeline can
/// start; carries the offending key for the error report.
#[derive(Debug)]
pub struct InitError {
    pub key: String,
    pub message: String,
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.key, self.message)
    }
}

pub trait Parser: Send {
    /// Validate configuration. Must be called, successfully, before
    /// `process_lines`.
    fn init(&mut self, options: &Options) -> Result<(), InitError>;

    /// Drain `lines` until it closes, pushing events at `events`. The sink
    /// stays open; closing it is the supervisor's call.
    fn process_lines(&mut self, lines: LineRcv, events: EventSnd, prefix: Option<Arc<PrefixRegex>>);
}

/// Look up a parser by its configured name.
pub fn new_parser(name: &str) -> Option<Box<dyn Parser>> {
    match name {
        "json" => Some(Box::new(json::Parser::default())),
        "keyval" => Some(Box::new(keyval::Parser::default())),
        "regex" => Some(Box::new(regexp::Parser::default())),
        _ => None,
    }
}

/// The compiled prefix stripper: one named-capture regex, anchored at line
/// start, whose matched text is removed before the parser sees the line and
/// whose named captures become event fields.
pub struct PrefixRegex {
    re: Regex,
}

impl PrefixRegex {
    pub fn new(pattern: &str) -> Result<PrefixRegex, regex::Error> {
        let anchored = if pattern.starts_with('^') {
            pattern.to_string()
        } else {
            format!("^{}", pattern)
        };
        Ok(PrefixRegex {
            re: Regex::new(&anchored)?,
        })
    }

    /// Split `line` into (remainder, captured fields). A line the regex does
    /// not match passes through whole, with no fields.
    pub fn strip<'a>(&self, line: &'a str) -> (&'a str, Vec<(String, String)>) {
        let caps = match self.re.captures(line) {
            Some(caps) => caps,
            None => return (line, Vec::new()),
        };
        let whole = caps.get(0).expect("capture zero is the whole match");
        let mut fields = Vec::new();
        for name in self.re.capture_names() {
            if let Some(name) = name {
                if let Some(m) = caps.name(name) {
                    fields.push((name.to_string(), m.as_str().to_string()));
                }
            }
        }
        (line[whole.end()..].trim_start(), fields)
    }
}

/// Shared tail end of every parser: pull the timestamp out of the parsed
/// fields, fold in the prefix captures, and ship the event. Returns false
/// when the pipeline has gone away beneath us.
fn emit(
    mut parsed: Map<String, Value>,
    prefix_fields: Vec<(String, String)>,
    options: &Options,
    sample_rate: i64,
    events: &EventSnd,
) -> bool {
    let timestamp = time::get_timestamp(
        &mut parsed,
        options.time_field.as_ref().map(|s| s.as_str()),
        options.time_format.as_ref().map(|s| s.as_str()),
        options.location,
    );
    for (k, v) in prefix_fields {
        parsed.insert(k, Value::String(v));
    }
    let ev = Event {
        timestamp: timestamp,
        data: parsed,
        sample_rate: sample_rate,
    };
    events.send(ev).is_ok()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_prefix_strip_and_capture() {
        let pre = PrefixRegex::new(
            r"(?P<server_timestamp>\w+ \d+ [\d:]+) (?P<hostname>[\w\d-]+) \S+:",
        )
        .unwrap();
        let (rest, fields) =
            pre.strip(r#"Nov 13 10:19:31 app23 process.port[pid]: {"format":"json"}"#);
        assert_eq!(rest, r#"{"format":"json"}"#);
        assert!(fields.contains(&("server_timestamp".to_string(), "Nov 13 10:19:31".to_string())));
        assert!(fields.contains(&("hostname".to_string(), "app23".to_string())));
    }

    #[test]
    fn test_prefix_no_match_passes_through() {
        let pre = PrefixRegex::new(r"(?P<n>\d+) -").unwrap();
        let (rest, fields) = pre.strip("no digits here");
        assert_eq!(rest, "no digits here");
        assert!(fields.is_empty());
    }

    #[test]
    fn test_prefix_is_anchored() {
        let pre = PrefixRegex::new(r"(?P<n>\d+)").unwrap();
        // digits exist but not at line start; nothing is stripped
        let (rest, fields) = pre.strip("x 123 y");
        assert_eq!(rest, "x 123 y");
        assert!(fields.is_empty());
    }

    #[test]
    fn test_unnamed_groups_are_discarded() {
        let pre = PrefixRegex::new(r"(\w+) (?P<keep>\w+):").unwrap();
        let (rest, fields) = pre.strip("drop keep: payload");
        assert_eq!(rest, "payload");
        assert_eq!(fields, vec![("keep".to_string(), "keep".to_string())]);
    }

    #[test]
    fn test_unknown_parser_name() {
        assert!(new_parser("nope").is_none());
        assert!(new_parser("json").is_some());
    }
}
