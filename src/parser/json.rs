//! One JSON document per record. Documents are usually one per line, but a
//! pretty-printed document may span several; since JSON forbids raw
//! newlines in strings, a trimmed line starting with `{` begins a new
//! record. Grouping is single threaded to keep file order; parsing of the
//! grouped records fans out over `num_parsers` workers.
//!
//! This is also the pre-sampling parser: when a record pre-sample rate is
//! configured, whole record groups are dropped before the parse workers see
//! them, so the parse cost is only paid for survivors.

use crossbeam_channel;
use parser;
use parser::{InitError, Options, PrefixRegex};
use rand;
use rand::Rng;
use serde_json;
use serde_json::Map;
use serde_json::Value;
use std::sync::Arc;
use std::thread;
use util::{EventSnd, LineRcv};

/// Grouped records awaiting a parse worker.
const RECORD_CHANNEL_CAP: usize = 64;

#[derive(Default)]
pub struct Parser {
    options: Options,
}

impl Parser {
    fn keep_record(&self) -> bool {
        let rate = self.options.pre_sample_rate;
        rate <= 1 || rand::thread_rng().gen_range(0..rate) == 0
    }
}

impl parser::Parser for Parser {
    fn init(&mut self, options: &Options) -> Result<(), InitError> {
        if options.pre_sample_rate < 1 {
            return Err(InitError {
                key: "samplerate".to_string(),
                message: "sample rate must be a positive integer".to_string(),
            });
        }
        self.options = options.clone();
        Ok(())
    }

    fn process_lines(&mut self, lines: LineRcv, events: EventSnd, prefix: Option<Arc<PrefixRegex>>) {
        let (record_snd, record_rcv) =
            crossbeam_channel::bounded::<String>(RECORD_CHANNEL_CAP);

        let workers = ::std::cmp::max(1, self.options.num_parsers);
        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let rcv = record_rcv.clone();
            let snd = events.clone();
            let prefix = prefix.clone();
            let options = self.options.clone();
            let builder = thread::Builder::new().name(format!("json-parse-{}", i));
            let handle = builder
                .spawn(move || {
                    for record in rcv.iter() {
                        handle_record(&record, &options, prefix.as_ref().map(Arc::as_ref), &snd);
                    }
                })
                .expect("spawning a parse worker");
            handles.push(handle);
        }
        drop(record_rcv);
        drop(events);

        let mut grouped: Vec<String> = Vec::with_capacity(5);
        for line in lines.iter() {
            let line = line.trim().to_string();
            if line.starts_with('{') {
                // the previous record is complete; pre-sample at the
                // boundary and hand survivors to the workers
                if !grouped.is_empty() && self.keep_record() {
                    if record_snd.send(grouped.concat()).is_err() {
                        break;
                    }
                }
                grouped.clear();
            }
            grouped.push(line);
        }
        if !grouped.is_empty() && self.keep_record() {
            let _ = record_snd.send(grouped.concat());
        }
        debug!("lines channel is closed, ending json processor");
        drop(record_snd);
        for handle in handles {
            let _ = handle.join();
        }
    }
}

fn handle_record(record: &str, options: &Options, prefix: Option<&PrefixRegex>, events: &EventSnd) {
    let (rest, prefix_fields) = match prefix {
        Some(pre) => pre.strip(record),
        None => (record, Vec::new()),
    };
    let parsed: Map<String, Value> = match serde_json::from_str(rest) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!("skipping line, failed to parse as a json object: {} | {}", e, rest);
            return;
        }
    };
    let rate = ::std::cmp::max(1, options.pre_sample_rate);
    parser::emit(parsed, prefix_fields, options, rate, events);
}

#[cfg(test)]
mod test {
    use super::*;
    use crossbeam_channel::bounded;
    use event::Event;
    use parser::Parser as ParserTrait;
    use std::thread;

    fn run_parser(input: Vec<&str>, options: Options, prefix: Option<&str>) -> Vec<Event> {
        // roomy enough that the whole fixture fits without a consumer
        let (line_snd, line_rcv) = bounded(2_048);
        let (ev_snd, ev_rcv) = bounded(2_048);
        for line in input {
            line_snd.send(line.to_string()).unwrap();
        }
        drop(line_snd);
        let prefix = prefix.map(|p| Arc::new(PrefixRegex::new(p).unwrap()));
        let mut parser = Parser::default();
        parser.init(&options).unwrap();
        let handle = thread::spawn(move || {
            parser.process_lines(line_rcv, ev_snd, prefix);
        });
        handle.join().unwrap();
        ev_rcv.iter().collect()
    }

    #[test]
    fn test_single_line_documents() {
        let events = run_parser(
            vec![r#"{"format":"json"}"#, r#"{"key":"val"}"#],
            Options::default(),
            None,
        );
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data["format"], json!("json"));
        assert_eq!(events[1].data["key"], json!("val"));
        assert_eq!(events[0].sample_rate, 1);
    }

    #[test]
    fn test_multi_line_document_is_reassembled() {
        let events = run_parser(
            vec!["{", r#""a": 1,"#, r#""b": "two""#, "}", r#"{"c":3}"#],
            Options::default(),
            None,
        );
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data["a"], json!(1));
        assert_eq!(events[0].data["b"], json!("two"));
        assert_eq!(events[1].data["c"], json!(3));
    }

    #[test]
    fn test_garbage_lines_are_skipped() {
        let events = run_parser(
            vec!["not json at all", r#"{"ok":true}"#, r#"{"broken":"#],
            Options::default(),
            None,
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data["ok"], json!(true));
    }

    #[test]
    fn test_timestamp_field_is_consumed() {
        let events = run_parser(
            vec![r#"{"format":"json","time":"2014-04-10T19:57:38Z"}"#],
            Options::default(),
            None,
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].timestamp.timestamp(), 1397159858);
        assert!(!events[0].data.contains_key("time"));
    }

    #[test]
    fn test_prefix_fields_are_merged() {
        let events = run_parser(
            vec![r#"Nov 13 10:19:31 app23 process.port[pid]: {"format":"json"}"#],
            Options::default(),
            Some(r"(?P<server_timestamp>\w+ \d+ [\d:]+) (?P<hostname>[\w\d-]+) \S+:"),
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data["format"], json!("json"));
        assert_eq!(events[0].data["hostname"], json!("app23"));
        assert_eq!(events[0].data["server_timestamp"], json!("Nov 13 10:19:31"));
    }

    #[test]
    fn test_pre_sample_keeps_roughly_one_in_n() {
        let lines: Vec<String> = (0..600).map(|i| format!(r#"{{"i":{}}}"#, i)).collect();
        let refs: Vec<&str> = lines.iter().map(|s| s.as_str()).collect();
        let mut options = Options::default();
        options.pre_sample_rate = 3;
        let events = run_parser(refs, options, None);
        // binomial(600, 1/3): the bulk of the mass sits well inside this band
        assert!(events.len() > 120 && events.len() < 280, "kept {}", events.len());
        assert!(events.iter().all(|ev| ev.sample_rate == 3));
    }

    #[test]
    fn test_worker_fanout_loses_nothing() {
        let lines: Vec<String> = (0..200).map(|i| format!(r#"{{"i":{}}}"#, i)).collect();
        let refs: Vec<&str> = lines.iter().map(|s| s.as_str()).collect();
        let mut options = Options::default();
        options.num_parsers = 4;
        let mut seen: Vec<i64> = run_parser(refs, options, None)
            .into_iter()
            .map(|ev| ev.data["i"].as_i64().unwrap())
            .collect();
        seen.sort();
        assert_eq!(seen, (0..200).collect::<Vec<i64>>());
    }
}
