//! Batched delivery to the upstream batch endpoint.
//!
//! A fixed pool of P sender workers shares three bounded channels:
//! `to_send` (primary ingress, capacity 10P), `to_resend` (retry ingress,
//! 2P) and `delay` (millisecond sleep requests injected when the API rate
//! limits, 2P). Each worker loop honors that priority order: sleep first if
//! asked, then retries, then fresh events, else idle for 100ms. Workers
//! group events into batches bounded by count and flush interval and POST
//! them as a JSON array, one response record per event coming back on the
//! `responses` channel (capacity 20P) for the response task to account and,
//! for 429/500/transport failures with retry enabled, re-enqueue.
//!
//! Shutdown: when `to_send` closes and drains, workers flush and exit;
//! whatever still sits in `to_resend` at that point is dropped by design.
//! The response task exits once the last worker drops its response sender.

use crossbeam_channel;
use crossbeam_channel::TryRecvError;
use event::Event;
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest;
use serde_json;
use serde_json::Value;
use sink::stats::ResponseStats;
use sink::Response;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use util::EventSnd;

const IDLE_SLEEP_MS: u64 = 100;
const BODY_EXCERPT: usize = 256;

const RATE_LIMIT_MESSAGE: &str =
    "one or more events has been rate limited and is being resent; this is expected \
     behavior, but other senders to this dataset may see events dropped";

#[derive(Debug, Clone)]
pub struct HoneycombConfig {
    /// Base URL, normalized to end with a slash.
    pub api_host: String,
    pub write_key: String,
    pub dataset: String,
    /// P, the sender concurrency.
    pub pool_size: usize,
    /// Maximum events per batch.
    pub batch_size: usize,
    /// Flush a partial batch after this long.
    pub flush_interval: Duration,
    /// Compress request bodies.
    pub gzip: bool,
    /// Re-enqueue rate-limited and server-errored events.
    pub retry: bool,
    /// Print events to stdout instead of POSTing them.
    pub debug_stdout: bool,
    /// Seconds between summary reports; 0 disables the periodic report.
    pub status_interval: u64,
}

fn user_agent() -> String {
    format!("caudal/{}", env!("CARGO_PKG_VERSION"))
}

/// Credential check at startup: a lightweight authenticated GET. Any
/// non-200 means the pipeline should not start.
pub fn verify_write_key(api_host: &str, write_key: &str) -> Result<(), String> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| format!("could not build http client: {}", e))?;
    let url = format!("{}1/team_slug", api_host);
    let rsp = client
        .get(&url)
        .header("X-Honeycomb-Team", write_key)
        .header("User-Agent", user_agent())
        .send()
        .map_err(|e| format!("could not verify write key against {}: {}", url, e))?;
    if rsp.status().as_u16() != 200 {
        let status = rsp.status();
        let body = rsp.text().unwrap_or_default();
        return Err(format!(
            "could not verify write key against {}: HTTP {}: {}",
            url,
            status,
            body.trim()
        ));
    }
    Ok(())
}

pub struct Uploader {
    to_send: EventSnd,
    workers: Vec<thread::JoinHandle<()>>,
    response_handle: thread::JoinHandle<()>,
    ticker: Option<thread::JoinHandle<()>>,
    done: Arc<AtomicBool>,
    stats: Arc<Mutex<ResponseStats>>,
}

impl Uploader {
    /// Spin up the worker pool, the response task and the stats ticker.
    pub fn start(config: HoneycombConfig) -> Result<Uploader, String> {
        let pool = ::std::cmp::max(1, config.pool_size);
        let (send_snd, send_rcv) = crossbeam_channel::bounded::<Event>(10 * pool);
        let (resend_snd, resend_rcv) = crossbeam_channel::bounded::<Event>(2 * pool);
        let (delay_snd, delay_rcv) = crossbeam_channel::bounded::<u64>(2 * pool);
        let (rsp_snd, rsp_rcv) = crossbeam_channel::bounded::<Response>(20 * pool);

        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| format!("could not build http client: {}", e))?;

        let mut workers = Vec::with_capacity(pool);
        for i in 0..pool {
            let worker = Worker {
                config: config.clone(),
                client: client.clone(),
                send_rcv: send_rcv.clone(),
                resend_rcv: resend_rcv.clone(),
                delay_rcv: delay_rcv.clone(),
                responses: rsp_snd.clone(),
            };
            let builder = thread::Builder::new().name(format!("sender-{}", i));
            workers.push(
                builder
                    .spawn(move || worker.run())
                    .map_err(|e| format!("could not spawn sender: {}", e))?,
            );
        }
        drop(rsp_snd);

        let stats = Arc::new(Mutex::new(ResponseStats::new()));
        let rate_limited = Arc::new(AtomicBool::new(false));
        let response_handle = {
            let stats = Arc::clone(&stats);
            let retry = config.retry;
            let delay_ms = 1_000 / pool as u64;
            let builder = thread::Builder::new().name("responses".to_string());
            builder
                .spawn(move || {
                    handle_responses(
                        rsp_rcv,
                        stats,
                        resend_snd,
                        delay_snd,
                        retry,
                        delay_ms,
                        rate_limited,
                    )
                })
                .map_err(|e| format!("could not spawn response task: {}", e))?
        };

        let done = Arc::new(AtomicBool::new(false));
        let ticker = if config.status_interval > 0 {
            let stats = Arc::clone(&stats);
            let done = Arc::clone(&done);
            let interval = config.status_interval;
            let builder = thread::Builder::new().name("status".to_string());
            Some(
                builder
                    .spawn(move || loop {
                        for _ in 0..interval {
                            if done.load(Ordering::Relaxed) {
                                return;
                            }
                            thread::sleep(Duration::from_secs(1));
                        }
                        if let Ok(mut stats) = stats.lock() {
                            stats.log_and_reset();
                        }
                    })
                    .map_err(|e| format!("could not spawn status task: {}", e))?,
            )
        } else {
            None
        };

        Ok(Uploader {
            to_send: send_snd,
            workers: workers,
            response_handle: response_handle,
            ticker: ticker,
            done: done,
            stats: stats,
        })
    }

    /// A handle the transform stages push finished events into.
    pub fn sender(&self) -> EventSnd {
        self.to_send.clone()
    }

    /// Close the primary queue, wait for the drain, print the final
    /// summary. Retryable events still queued when the primary drains are
    /// dropped, by design.
    pub fn wait(self) {
        drop(self.to_send);
        for handle in self.workers {
            let _ = handle.join();
        }
        let _ = self.response_handle.join();
        self.done.store(true, Ordering::Relaxed);
        if let Some(handle) = self.ticker {
            let _ = handle.join();
        }
        if let Ok(mut stats) = self.stats.lock() {
            stats.log_and_reset();
            stats.log_final();
        }
    }
}

struct Worker {
    config: HoneycombConfig,
    client: reqwest::blocking::Client,
    send_rcv: crossbeam_channel::Receiver<Event>,
    resend_rcv: crossbeam_channel::Receiver<Event>,
    delay_rcv: crossbeam_channel::Receiver<u64>,
    responses: crossbeam_channel::Sender<Response>,
}

impl Worker {
    fn run(&self) {
        let mut batch: Vec<Event> = Vec::with_capacity(self.config.batch_size);
        let mut batch_open = Instant::now();
        loop {
            // back off first if the response task asked us to
            if let Ok(ms) = self.delay_rcv.try_recv() {
                thread::sleep(Duration::from_millis(ms));
            }
            let mut idle = false;
            match self.resend_rcv.try_recv() {
                Ok(ev) => {
                    if batch.is_empty() {
                        batch_open = Instant::now();
                    }
                    batch.push(ev);
                }
                Err(_) => match self.send_rcv.try_recv() {
                    Ok(ev) => {
                        if batch.is_empty() {
                            batch_open = Instant::now();
                        }
                        batch.push(ev);
                    }
                    Err(TryRecvError::Disconnected) => {
                        self.flush(&mut batch);
                        debug!("send queue closed and drained, sender exiting");
                        return;
                    }
                    Err(TryRecvError::Empty) => idle = true,
                },
            }
            if batch.len() >= self.config.batch_size
                || (!batch.is_empty() && batch_open.elapsed() >= self.config.flush_interval)
            {
                self.flush(&mut batch);
            }
            if idle {
                thread::sleep(Duration::from_millis(IDLE_SLEEP_MS));
            }
        }
    }

    fn flush(&self, batch: &mut Vec<Event>) {
        if batch.is_empty() {
            return;
        }
        let events = ::std::mem::replace(batch, Vec::with_capacity(self.config.batch_size));
        if self.config.debug_stdout {
            for ev in &events {
                println!("{}", ev.to_wire());
            }
            self.report(events, 200, String::new(), None, Duration::from_secs(0));
            return;
        }
        let payload: Vec<Value> = events.iter().map(Event::to_wire).collect();
        let body = match serde_json::to_vec(&payload) {
            Ok(body) => body,
            Err(e) => {
                error!("could not serialize a batch of {} events: {}", events.len(), e);
                return;
            }
        };
        let url = format!("{}1/batch/{}", self.config.api_host, self.config.dataset);
        let mut request = self
            .client
            .post(&url)
            .header("X-Honeycomb-Team", self.config.write_key.as_str())
            .header("Content-Type", "application/json")
            .header("User-Agent", user_agent());
        let body = if self.config.gzip {
            let mut enc =
                GzEncoder::new(Vec::with_capacity(body.len() / 2), Compression::default());
            let written = enc.write_all(&body);
            match written.and(enc.finish()) {
                Ok(compressed) => {
                    request = request.header("Content-Encoding", "gzip");
                    compressed
                }
                Err(e) => {
                    warn!("gzip of a batch failed, sending uncompressed: {}", e);
                    body
                }
            }
        } else {
            body
        };

        let start = Instant::now();
        let result = request.body(body).send();
        let duration = start.elapsed();
        match result {
            Ok(rsp) => {
                let status = rsp.status().as_u16();
                let mut text = rsp.text().unwrap_or_default();
                text.truncate(BODY_EXCERPT);
                self.report(events, status, text, None, duration);
            }
            Err(e) => {
                self.report(events, 0, String::new(), Some(format!("{}", e)), duration);
            }
        }
    }

    /// One response record per event in the batch; the upstream contract
    /// gives us a single status for the request and it applies to all of
    /// them.
    fn report(
        &self,
        events: Vec<Event>,
        status: u16,
        body: String,
        error: Option<String>,
        duration: Duration,
    ) {
        for ev in events {
            let rsp = Response {
                status: status,
                body: body.clone(),
                error: error.clone(),
                duration: duration,
                event: ev,
            };
            if self.responses.send(rsp).is_err() {
                return;
            }
        }
    }
}

fn handle_responses(
    responses: crossbeam_channel::Receiver<Response>,
    stats: Arc<Mutex<ResponseStats>>,
    resend: crossbeam_channel::Sender<Event>,
    delay: crossbeam_channel::Sender<u64>,
    retry: bool,
    delay_ms: u64,
    rate_limited: Arc<AtomicBool>,
) {
    for rsp in responses.iter() {
        if let Ok(mut stats) = stats.lock() {
            stats.update(&rsp);
        }
        let retryable = retry && (rsp.status == 429 || rsp.status == 500 || rsp.status == 0);
        if retryable {
            if rsp.status == 429 && !rate_limited.swap(true, Ordering::Relaxed) {
                info!("{}", RATE_LIMIT_MESSAGE);
            }
            // ask the pool to ease off, then queue the event again
            let _ = delay.try_send(delay_ms);
            if resend.send(rsp.event).is_err() {
                // workers already gone; the event is dropped with the rest
                return;
            }
        } else {
            debug!(
                "event send record received: status={} retry_send=false duration={:?}",
                rsp.status, rsp.duration
            );
        }
    }
}
