//! Whole-pipeline scenarios: real files on disk, the real supervisor, a
//! local HTTP server standing in for the upstream batch endpoint.

extern crate caudal;
extern crate flate2;
#[macro_use]
extern crate serde_json;
extern crate tempdir;
extern crate tiny_http;

use caudal::config::Args;
use caudal::run;
use caudal::source::ReadFrom;
use caudal::time::TimeLocation;
use flate2::read::GzDecoder;
use serde_json::Value;
use std::fs;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tempdir::TempDir;

/// One recorded upload: the request path, the team header and the decoded
/// JSON body.
#[derive(Debug, Clone)]
struct Upload {
    path: String,
    team: String,
    body: Value,
}

struct TestServer {
    host: String,
    uploads: Arc<Mutex<Vec<Upload>>>,
}

impl TestServer {
    fn start() -> TestServer {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("binding a local server");
        let host = format!("http://{}/", server.server_addr());
        let uploads: Arc<Mutex<Vec<Upload>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&uploads);
        thread::spawn(move || {
            for mut request in server.incoming_requests() {
                if *request.method() == tiny_http::Method::Get {
                    let _ = request.respond(tiny_http::Response::from_string("{}"));
                    continue;
                }
                let path = request.url().to_string();
                let mut team = String::new();
                let mut gzipped = false;
                for header in request.headers() {
                    if header.field.equiv("X-Honeycomb-Team") {
                        team = header.value.as_str().to_string();
                    }
                    if header.field.equiv("Content-Encoding")
                        && header.value.as_str().contains("gzip")
                    {
                        gzipped = true;
                    }
                }
                let mut raw = Vec::new();
                request
                    .as_reader()
                    .read_to_end(&mut raw)
                    .expect("reading request body");
                let decoded = if gzipped {
                    let mut out = Vec::new();
                    GzDecoder::new(&raw[..])
                        .read_to_end(&mut out)
                        .expect("gunzipping request body");
                    out
                } else {
                    raw
                };
                let body: Value =
                    serde_json::from_slice(&decoded).expect("request body is json");
                sink.lock().unwrap().push(Upload {
                    path: path,
                    team: team,
                    body: body,
                });
                let _ = request.respond(tiny_http::Response::from_string("[]"));
            }
        });
        TestServer {
            host: host,
            uploads: uploads,
        }
    }

    /// All uploaded events, flattened across batches.
    fn events(&self) -> Vec<Value> {
        let uploads = self.uploads.lock().unwrap();
        uploads
            .iter()
            .flat_map(|u| u.body.as_array().cloned().unwrap_or_default())
            .collect()
    }

    fn wait_for_events(&self, n: usize, deadline: Duration) -> Vec<Value> {
        let start = Instant::now();
        loop {
            let events = self.events();
            if events.len() >= n {
                return events;
            }
            if start.elapsed() > deadline {
                panic!("only {} of {} events arrived in time", events.len(), n);
            }
            thread::sleep(Duration::from_millis(20));
        }
    }
}

fn base_args(host: &str, files: Vec<String>) -> Args {
    Args {
        files: files,
        filter_files: Vec::new(),
        parser_name: "json".to_string(),
        write_key: "e2e-write-key".to_string(),
        dataset: "caudal-e2e".to_string(),
        api_host: host.to_string(),
        sample_rate: 1,
        pool_size: 1,
        batch_frequency_ms: 50,
        batch_size: 50,
        status_interval: 0,
        backfill: false,
        rebase_time: false,
        backoff: false,
        gzip: true,
        debug_stdout: false,
        scrub_fields: Vec::new(),
        drop_fields: Vec::new(),
        add_fields: Vec::new(),
        da_map_file: None,
        request_shape: Vec::new(),
        shape_prefix: None,
        request_patterns: Vec::new(),
        request_query_all: false,
        request_query_keys: Vec::new(),
        prefix_regex: None,
        deterministic_sample: None,
        dyn_sample: Vec::new(),
        dyn_window_sec: 30,
        dyn_sample_minimum: 1,
        goal_sample_rate: 0,
        presampled_field: None,
        json_fields: Vec::new(),
        rename_fields: Vec::new(),
        read_from: ReadFrom::Beginning,
        tail_stop: true,
        poll: true,
        state_file: None,
        tail_sample: false,
        num_parsers: 1,
        time_field: None,
        time_format: None,
        location: TimeLocation::Utc,
        line_regex: None,
        verbose: 0,
        version: "test".to_string(),
    }
}

fn write_file(path: &Path, content: &str) {
    let mut fp = fs::File::create(path).unwrap();
    write!(fp, "{}", content).unwrap();
    fp.flush().unwrap();
}

#[test]
fn test_single_json_event_reaches_the_endpoint() {
    let server = TestServer::start();
    let dir = TempDir::new("e2e_single").unwrap();
    let log = dir.path().join("app.log");
    write_file(&log, "{\"format\":\"json\"}\n");

    let args = base_args(&server.host, vec![log.to_string_lossy().into_owned()]);
    let code = run::run(args, Arc::new(AtomicBool::new(false)));
    assert_eq!(code, 0);

    let uploads = server.uploads.lock().unwrap().clone();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].path, "/1/batch/caudal-e2e");
    assert_eq!(uploads[0].team, "e2e-write-key");
    let batch = uploads[0].body.as_array().unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0]["data"]["format"], json!("json"));
    assert_eq!(batch[0]["samplerate"], json!(1));
    assert!(batch[0]["time"].is_string());
}

#[test]
fn test_two_files_are_merged() {
    let server = TestServer::start();
    let dir = TempDir::new("e2e_two").unwrap();
    let one = dir.path().join("one.log");
    let two = dir.path().join("two.log");
    write_file(&one, "{\"key1\":\"val1\"}\n");
    write_file(&two, "{\"key2\":\"val2\"}\n");

    let args = base_args(
        &server.host,
        vec![
            one.to_string_lossy().into_owned(),
            two.to_string_lossy().into_owned(),
        ],
    );
    let code = run::run(args, Arc::new(AtomicBool::new(false)));
    assert_eq!(code, 0);

    let events = server.events();
    assert_eq!(events.len(), 2);
    assert!(events.iter().any(|e| e["data"]["key1"] == json!("val1")));
    assert!(events.iter().any(|e| e["data"]["key2"] == json!("val2")));
}

#[test]
fn test_drop_fields_never_leave_the_host() {
    let server = TestServer::start();
    let dir = TempDir::new("e2e_drop").unwrap();
    let log = dir.path().join("app.log");
    write_file(
        &log,
        "{\"dropme\":\"x\",\"format\":\"json\",\"reallygone\":\"y\"}\n",
    );

    let mut args = base_args(&server.host, vec![log.to_string_lossy().into_owned()]);
    args.drop_fields = vec!["dropme".to_string(), "reallygone".to_string()];
    let code = run::run(args, Arc::new(AtomicBool::new(false)));
    assert_eq!(code, 0);

    let events = server.events();
    assert_eq!(events.len(), 1);
    let data = events[0]["data"].as_object().unwrap();
    assert_eq!(data.len(), 1);
    assert_eq!(data["format"], json!("json"));
}

#[test]
fn test_scrub_field_is_hashed() {
    let server = TestServer::start();
    let dir = TempDir::new("e2e_scrub").unwrap();
    let log = dir.path().join("app.log");
    write_file(&log, "{\"format\":\"json\",\"name\":\"hidden\"}\n");

    let mut args = base_args(&server.host, vec![log.to_string_lossy().into_owned()]);
    args.scrub_fields = vec!["name".to_string()];
    let code = run::run(args, Arc::new(AtomicBool::new(false)));
    assert_eq!(code, 0);

    let events = server.events();
    assert_eq!(events.len(), 1);
    assert_eq!(
        events[0]["data"]["name"],
        json!("e564b4081d7a9ea4b00dada53bdae70c99b87b6fce869f0c3dd4d2bfa1e53e1c")
    );
}

#[test]
fn test_prefix_regex_extracts_host_fields() {
    let server = TestServer::start();
    let dir = TempDir::new("e2e_prefix").unwrap();
    let log = dir.path().join("app.log");
    write_file(
        &log,
        "Nov 13 10:19:31 app23 process.port[pid]: {\"format\":\"json\"}\n",
    );

    let mut args = base_args(&server.host, vec![log.to_string_lossy().into_owned()]);
    args.prefix_regex = Some(
        r"(?P<server_timestamp>\w+ \d+ [\d:]+) (?P<hostname>[\w\d-]+) \S+:".to_string(),
    );
    let code = run::run(args, Arc::new(AtomicBool::new(false)));
    assert_eq!(code, 0);

    let events = server.events();
    assert_eq!(events.len(), 1);
    let data = &events[0]["data"];
    assert_eq!(data["format"], json!("json"));
    assert_eq!(data["hostname"], json!("app23"));
    assert_eq!(data["server_timestamp"], json!("Nov 13 10:19:31"));
}

#[test]
fn test_sampled_batches_carry_the_rate() {
    let server = TestServer::start();
    let dir = TempDir::new("e2e_sample").unwrap();
    let log = dir.path().join("app.log");
    let mut content = String::new();
    for i in 0..50 {
        content.push_str(&format!("{{\"i\":{}}}\n", i));
    }
    write_file(&log, &content);

    let mut args = base_args(&server.host, vec![log.to_string_lossy().into_owned()]);
    args.sample_rate = 3;
    args.tail_sample = true;
    let code = run::run(args, Arc::new(AtomicBool::new(false)));
    assert_eq!(code, 0);

    let events = server.events();
    assert!(!events.is_empty() && events.len() < 50, "kept {}", events.len());
    assert!(events
        .iter()
        .all(|e| e["samplerate"] == json!(3)));
}

#[test]
fn test_per_file_order_reaches_the_endpoint() {
    let server = TestServer::start();
    let dir = TempDir::new("e2e_order").unwrap();
    let log = dir.path().join("app.log");
    let mut content = String::new();
    for i in 0..40 {
        content.push_str(&format!("{{\"seq\":{}}}\n", i));
    }
    write_file(&log, &content);

    let args = base_args(&server.host, vec![log.to_string_lossy().into_owned()]);
    let code = run::run(args, Arc::new(AtomicBool::new(false)));
    assert_eq!(code, 0);

    let seqs: Vec<i64> = server
        .events()
        .iter()
        .map(|e| e["data"]["seq"].as_i64().unwrap())
        .collect();
    assert_eq!(seqs, (0..40).collect::<Vec<i64>>());
}

#[test]
fn test_rotation_while_running() {
    let server = TestServer::start();
    let dir = TempDir::new("e2e_rotate").unwrap();
    let log = dir.path().join("app.log");
    write_file(&log, "{\"k\":1}\n");

    let mut args = base_args(&server.host, vec![log.to_string_lossy().into_owned()]);
    args.tail_stop = false;
    let stop = Arc::new(AtomicBool::new(false));
    let run_stop = Arc::clone(&stop);
    let runner = thread::spawn(move || run::run(args, run_stop));

    // give the tailer time to open the original file and read the first
    // line; the parser will hold that record until the next one begins
    thread::sleep(Duration::from_secs(2));

    // rename-and-reopen rotation, then two more events
    fs::rename(&log, dir.path().join("app.log.1")).unwrap();
    write_file(&log, "{\"k\":2}\n{\"k\":3}\n");

    // the third record stays buffered at the group boundary until the line
    // stream closes, so only wait for the first two before stopping
    server.wait_for_events(2, Duration::from_secs(15));
    stop.store(true, Ordering::Relaxed);
    assert_eq!(runner.join().unwrap(), 0);

    let events = server.events();
    let ks: Vec<i64> = events
        .iter()
        .map(|e| e["data"]["k"].as_i64().unwrap())
        .collect();
    assert_eq!(ks, vec![1, 2, 3]);
}

#[test]
fn test_missing_file_is_fatal() {
    let server = TestServer::start();
    let args = base_args(&server.host, vec!["/no/such/file.log".to_string()]);
    let code = run::run(args, Arc::new(AtomicBool::new(false)));
    assert_eq!(code, 1);
}

#[test]
fn test_checkpoint_resume_across_restarts() {
    let server = TestServer::start();
    let dir = TempDir::new("e2e_resume").unwrap();
    let log = dir.path().join("app.log");
    write_file(&log, "{\"run\":1}\n");

    let mut args = base_args(&server.host, vec![log.to_string_lossy().into_owned()]);
    args.read_from = ReadFrom::Last;
    // no checkpoint yet: read_from=last behaves as end, so nothing is sent
    // and the final offset lands at EOF
    let code = run::run(args.clone(), Arc::new(AtomicBool::new(false)));
    assert_eq!(code, 0);
    assert!(server.events().is_empty());
    assert!(dir.path().join("app.caudal.state").exists());

    // append and run again: only the new line is picked up
    {
        let mut fp = fs::OpenOptions::new().append(true).open(&log).unwrap();
        write!(fp, "{{\"run\":2}}\n").unwrap();
    }
    let code = run::run(args, Arc::new(AtomicBool::new(false)));
    assert_eq!(code, 0);
    let events = server.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["data"]["run"], json!(2));
}
