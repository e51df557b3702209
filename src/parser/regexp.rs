//! User-supplied regex with named capture groups, one record per line. Each
//! named group becomes a field; unnamed groups are dropped. Lines the
//! pattern does not match are counted and skipped.

use crossbeam_channel;
use parser;
use parser::{InitError, Options, PrefixRegex};
use regex::Regex;
use serde_json::Map;
use serde_json::Value;
use std::sync::Arc;
use std::thread;
use util::{EventSnd, LineRcv};

#[derive(Default)]
pub struct Parser {
    options: Options,
    line_regex: Option<Arc<Regex>>,
}

impl parser::Parser for Parser {
    fn init(&mut self, options: &Options) -> Result<(), InitError> {
        let pattern = match options.line_regex {
            Some(ref p) if !p.is_empty() => p,
            _ => {
                return Err(InitError {
                    key: "line_regex".to_string(),
                    message: "the regex parser requires a line pattern".to_string(),
                })
            }
        };
        let compiled = Regex::new(pattern).map_err(|e| InitError {
            key: "line_regex".to_string(),
            message: format!("{}", e),
        })?;
        if compiled.capture_names().flatten().next().is_none() {
            return Err(InitError {
                key: "line_regex".to_string(),
                message: "pattern has no named capture groups, no fields would be produced"
                    .to_string(),
            });
        }
        self.line_regex = Some(Arc::new(compiled));
        self.options = options.clone();
        Ok(())
    }

    fn process_lines(&mut self, lines: LineRcv, events: EventSnd, prefix: Option<Arc<PrefixRegex>>) {
        let re = self
            .line_regex
            .clone()
            .expect("init must succeed before process_lines");
        let workers = ::std::cmp::max(1, self.options.num_parsers);
        let (work_snd, work_rcv) = crossbeam_channel::bounded::<String>(64);
        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let rcv = work_rcv.clone();
            let snd = events.clone();
            let re = Arc::clone(&re);
            let prefix = prefix.clone();
            let options = self.options.clone();
            let builder = thread::Builder::new().name(format!("regex-parse-{}", i));
            let handle = builder
                .spawn(move || {
                    for line in rcv.iter() {
                        handle_line(&line, &re, &options, prefix.as_ref().map(Arc::as_ref), &snd);
                    }
                })
                .expect("spawning a parse worker");
            handles.push(handle);
        }
        drop(work_rcv);
        drop(events);

        for line in lines.iter() {
            if work_snd.send(line).is_err() {
                break;
            }
        }
        debug!("lines channel is closed, ending regex processor");
        drop(work_snd);
        for handle in handles {
            let _ = handle.join();
        }
    }
}

fn handle_line(
    line: &str,
    re: &Regex,
    options: &Options,
    prefix: Option<&PrefixRegex>,
    events: &EventSnd,
) {
    let (rest, prefix_fields) = match prefix {
        Some(pre) => pre.strip(line),
        None => (line, Vec::new()),
    };
    let caps = match re.captures(rest) {
        Some(caps) => caps,
        None => {
            debug!("no matches for regex on line: {}", rest);
            return;
        }
    };
    let mut parsed: Map<String, Value> = Map::new();
    for name in re.capture_names() {
        if let Some(name) = name {
            if let Some(m) = caps.name(name) {
                parsed.insert(name.to_string(), Value::String(m.as_str().to_string()));
            }
        }
    }
    // the timestamp may live in the prefix captures, so fold them in first
    for (k, v) in prefix_fields {
        parsed.insert(k, Value::String(v));
    }
    if parsed.is_empty() {
        debug!("skipping line, no capture groups matched: {}", rest);
        return;
    }
    parser::emit(parsed, Vec::new(), options, 1, events);
}
