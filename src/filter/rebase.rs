//! Time rebasing for backfill: shift a whole window of historical events so
//! it ends at roughly "now", preserving inter-event spacing. The base is the
//! latest timestamp found in the tail end of the input files; every event's
//! distance from the base is replayed back from the moment we started.

use chrono::{DateTime, Utc};
use crossbeam_channel;
use event::Event;
use filter::{Filter, FilterError};
use parser;
use parser::PrefixRegex;
use std::fs;
use std::io;
use std::io::{BufRead, Seek};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

/// How far back into each file we look for the base timestamp.
const TAIL_SCAN_BYTES: u64 = 1024 * 1024;

pub struct TimeRebase {
    base: DateTime<Utc>,
    start: DateTime<Utc>,
}

impl TimeRebase {
    pub fn new(base: DateTime<Utc>) -> TimeRebase {
        TimeRebase {
            base: base,
            start: Utc::now(),
        }
    }

    #[cfg(test)]
    fn with_start(base: DateTime<Utc>, start: DateTime<Utc>) -> TimeRebase {
        TimeRebase {
            base: base,
            start: start,
        }
    }
}

impl Filter for TimeRebase {
    fn name(&self) -> &'static str {
        "rebase_time"
    }

    fn process(&self, event: &mut Event) -> Result<(), FilterError> {
        let delta = self.base.signed_duration_since(event.timestamp);
        event.timestamp = self.start - delta;
        Ok(())
    }
}

/// Discover the base timestamp: parse the last megabyte (or all, if
/// smaller) of every input file through a fresh parser instance and keep the
/// latest timestamp seen. None when no event produced a timestamp, which
/// callers treat as "cannot rebase".
pub fn base_time(
    files: &[PathBuf],
    parser_name: &str,
    options: &parser::Options,
    prefix: Option<Arc<PrefixRegex>>,
) -> Option<DateTime<Utc>> {
    let mut base: Option<DateTime<Utc>> = None;
    for file in files {
        let lines = match tail_lines(file) {
            Ok(lines) => lines,
            Err(e) => {
                warn!("cannot scan the tail of {:?}: {}", file, e);
                continue;
            }
        };
        let (line_snd, line_rcv) = crossbeam_channel::bounded(256);
        let (ev_snd, ev_rcv) = crossbeam_channel::bounded::<Event>(256);
        let feeder = thread::spawn(move || {
            for line in lines {
                if line_snd.send(line).is_err() {
                    break;
                }
            }
        });
        let name = parser_name.to_string();
        let options = options.clone();
        let parse_prefix = prefix.clone();
        let parse = thread::spawn(move || {
            let mut p = match parser::new_parser(&name) {
                Some(p) => p,
                None => return,
            };
            if p.init(&options).is_err() {
                return;
            }
            p.process_lines(line_rcv, ev_snd, parse_prefix);
        });
        // drain while the parser runs so its bounded channel never wedges
        for ev in ev_rcv.iter() {
            if base.map_or(true, |b| ev.timestamp > b) {
                base = Some(ev.timestamp);
            }
        }
        let _ = feeder.join();
        let _ = parse.join();
    }
    base
}

fn tail_lines(path: &PathBuf) -> io::Result<Vec<String>> {
    let mut fh = fs::File::open(path)?;
    let len = fh.metadata()?.len();
    let mut skip_first = false;
    if len > TAIL_SCAN_BYTES {
        fh.seek(io::SeekFrom::End(-(TAIL_SCAN_BYTES as i64)))?;
        // we probably landed mid-line
        skip_first = true;
    }
    let reader = io::BufReader::new(fh);
    let mut lines: Vec<String> = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if skip_first {
            skip_first = false;
            continue;
        }
        lines.push(line.trim().to_string());
    }
    Ok(lines)
}

#[cfg(test)]
mod test {
    extern crate tempdir;

    use self::tempdir::TempDir;
    use super::*;
    use chrono::TimeZone;
    use std::io::Write;

    #[test]
    fn test_spacing_is_preserved() {
        let base = Utc.with_ymd_and_hms(2020, 1, 1, 12, 0, 0).unwrap();
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap();
        let r = TimeRebase::with_start(base, start);

        let mut newest = Event::new().timestamp(base);
        let mut older = Event::new().timestamp(base - chrono::Duration::seconds(90));
        r.process(&mut newest).unwrap();
        r.process(&mut older).unwrap();

        assert_eq!(newest.timestamp, start);
        assert_eq!(
            newest.timestamp.signed_duration_since(older.timestamp),
            chrono::Duration::seconds(90)
        );
    }

    #[test]
    fn test_base_time_takes_latest() {
        let dir = TempDir::new("rebase").unwrap();
        let path = dir.path().join("b.log");
        let mut fp = fs::File::create(&path).unwrap();
        writeln!(fp, r#"{{"time":"2020-01-01T00:00:01Z","n":1}}"#).unwrap();
        writeln!(fp, r#"{{"time":"2020-01-01T00:00:09Z","n":2}}"#).unwrap();
        writeln!(fp, r#"{{"time":"2020-01-01T00:00:05Z","n":3}}"#).unwrap();
        fp.flush().unwrap();

        let base = base_time(
            &[path],
            "json",
            &parser::Options::default(),
            None,
        )
        .unwrap();
        assert_eq!(base, Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 9).unwrap());
    }

    #[test]
    fn test_base_time_with_no_files_is_none() {
        assert!(base_time(&[], "json", &parser::Options::default(), None).is_none());
    }
}
