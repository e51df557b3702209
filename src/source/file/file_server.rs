//! `FileServer` owns the tail of one file: it resolves the start location,
//! follows the file across rotation via `FileWatcher`, pushes complete lines
//! down its channel and keeps the checkpoint fresh. One `FileServer` runs on
//! one thread; the checkpoint writer is a small side task so a slow disk
//! never stalls reading.

use notify;
use notify::Watcher;
use source::file::checkpoint::Checkpoint;
use source::file::file_watcher::{FileWatcher, Outcome, Rotation, StartFrom};
use source::ReadFrom;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use util;
use util::LineSnd;

/// How long an idle tail sleeps, at most, between looks at its file.
const MAX_IDLE_MS: u64 = 2_048;

/// The configuration struct for `FileServer`.
#[derive(Debug, Clone)]
pub struct FileServerConfig {
    /// The single, already-expanded path this server follows.
    pub path: PathBuf,
    /// Start location policy when the server first opens the file.
    pub read_from: ReadFrom,
    /// Stop at end of file instead of waiting for more data.
    pub stop_at_eof: bool,
    /// Use interval polling instead of filesystem events while idle.
    pub poll: bool,
    /// Where to persist the tail position. None disables persistence.
    pub checkpoint_path: Option<PathBuf>,
}

pub struct FileServer {
    config: FileServerConfig,
    chan: LineSnd,
    stop: Arc<AtomicBool>,
}

impl FileServer {
    pub fn new(config: FileServerConfig, chan: LineSnd, stop: Arc<AtomicBool>) -> FileServer {
        FileServer {
            config: config,
            chan: chan,
            stop: stop,
        }
    }

    /// Resolve the configured start policy into a concrete seek target.
    ///
    /// `last` semantics: no checkpoint or an unreadable one behaves as
    /// `end`; a checkpoint whose inode matches the live file resumes at the
    /// stored offset; a mismatched inode means the file rotated while we
    /// were down, so we read the new file from the top.
    fn start_location(&self) -> StartFrom {
        match self.config.read_from {
            ReadFrom::Beginning => StartFrom::Beginning,
            ReadFrom::End => StartFrom::End,
            ReadFrom::Last => {
                let cp_path = match self.config.checkpoint_path {
                    Some(ref p) => p.clone(),
                    None => return StartFrom::End,
                };
                let cp = match Checkpoint::load(&cp_path) {
                    Some(cp) => cp,
                    None => return StartFrom::End,
                };
                match fs::metadata(&self.config.path) {
                    Ok(ref metadata) if metadata.ino() == cp.inode => {
                        debug!(
                            "resuming {:?} at offset {}",
                            self.config.path, cp.offset
                        );
                        StartFrom::Offset(cp.offset)
                    }
                    Ok(_) => {
                        debug!(
                            "{:?} rotated while we were down, reading from the top",
                            self.config.path
                        );
                        StartFrom::Beginning
                    }
                    Err(_) => StartFrom::End,
                }
            }
        }
    }

    /// Tail the file until stop is requested, the file ends (in stop-at-eof
    /// mode) or the downstream hangs up. Consumes the server; the line
    /// channel closes when this returns.
    pub fn run(self) {
        let start = self.start_location();
        let mut watcher = match FileWatcher::open(&self.config.path, start) {
            Ok(w) => w,
            Err(e) => {
                error!("unable to open {:?}: {}", self.config.path, e);
                return;
            }
        };

        // checkpoint plumbing: the tail loop publishes its position into
        // shared state, a ticker thread persists it once per second and
        // performs one final write on the way out
        let state = Arc::new(Mutex::new(Checkpoint {
            logfile_name: self.config.path.to_string_lossy().into_owned(),
            inode: watcher.inode(),
            offset: watcher.offset(),
        }));
        let done = Arc::new(AtomicBool::new(false));
        let cp_writer = self
            .config
            .checkpoint_path
            .as_ref()
            .and_then(|p| spawn_checkpoint_writer(p.clone(), Arc::clone(&state), Arc::clone(&done)));

        // filesystem-event wakeups; any trouble just downgrades us to polling
        let mut fs_events: Option<(notify::RecommendedWatcher, mpsc::Receiver<notify::DebouncedEvent>)> = None;
        if !self.config.poll {
            let (tx, rx) = mpsc::channel();
            match notify::watcher(tx, Duration::from_millis(250)) {
                Ok(mut w) => {
                    let target = self
                        .config
                        .path
                        .parent()
                        .map(|p| p.to_path_buf())
                        .unwrap_or_else(|| PathBuf::from("."));
                    match w.watch(&target, notify::RecursiveMode::NonRecursive) {
                        Ok(()) => fs_events = Some((w, rx)),
                        Err(e) => warn!("falling back to polling {:?}: {}", target, e),
                    }
                }
                Err(e) => warn!("falling back to polling: {}", e),
            }
        }

        let mut buffer = String::new();
        let mut idle_ms: u64 = 1;
        loop {
            if self.stop.load(Ordering::Relaxed) {
                break;
            }
            match watcher.read_line(&mut buffer) {
                Ok(Outcome::Line) => {
                    idle_ms = 1;
                    if !util::send(&self.chan, buffer.clone()) {
                        break;
                    }
                    if let Ok(mut cp) = state.lock() {
                        cp.inode = watcher.inode();
                        cp.offset = watcher.offset();
                    }
                }
                Ok(Outcome::Eof) => {
                    // a one-shot read does not chase rotations
                    match watcher.check_rotation(!self.config.stop_at_eof) {
                        Ok(Rotation::None) => {
                            if self.config.stop_at_eof {
                                break;
                            }
                            // nothing new; wait for a wakeup or a timeout,
                            // backing off while the file stays quiet
                            match fs_events {
                                Some((_, ref rx)) => {
                                    let _ = rx.recv_timeout(Duration::from_millis(idle_ms));
                                }
                                None => thread::sleep(Duration::from_millis(idle_ms)),
                            }
                            idle_ms = ::std::cmp::min(idle_ms.saturating_mul(2), MAX_IDLE_MS);
                        }
                        Ok(Rotation::Reopened) => {
                            info!("following rotated file {:?}", self.config.path);
                            idle_ms = 1;
                        }
                        Ok(Rotation::Truncated) => {
                            info!("{:?} truncated in place, reading from the top", self.config.path);
                            idle_ms = 1;
                        }
                        Err(e) => {
                            warn!("rotation check failed on {:?}: {}", self.config.path, e);
                            thread::sleep(Duration::from_millis(idle_ms));
                            idle_ms = ::std::cmp::min(idle_ms.saturating_mul(2), MAX_IDLE_MS);
                        }
                    }
                }
                Err(e) => {
                    // count it against the file and keep going; the partial
                    // line was dropped by the watcher
                    warn!("read error on {:?}: {}", self.config.path, e);
                }
            }
        }

        if let Ok(mut cp) = state.lock() {
            cp.inode = watcher.inode();
            cp.offset = watcher.offset();
        }
        done.store(true, Ordering::Relaxed);
        if let Some(handle) = cp_writer {
            let _ = handle.join();
        }
        debug!("tail of {:?} is complete", self.config.path);
    }
}

/// Persist the shared checkpoint once per second, plus one final write when
/// the tail signals done. A checkpoint we cannot open is a warning, not a
/// failure: tailing continues without persistence.
fn spawn_checkpoint_writer(
    path: PathBuf,
    state: Arc<Mutex<Checkpoint>>,
    done: Arc<AtomicBool>,
) -> Option<thread::JoinHandle<()>> {
    let mut fh = match fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(&path)
    {
        Ok(fh) => fh,
        Err(e) => {
            warn!(
                "failed to open checkpoint {:?} for writing, position will not be saved: {}",
                path, e
            );
            return None;
        }
    };
    let builder = thread::Builder::new().name("checkpoint".to_string());
    let handle = builder
        .spawn(move || {
            let mut last: Option<Checkpoint> = None;
            let mut warned = false;
            loop {
                let snapshot = match state.lock() {
                    Ok(cp) => cp.clone(),
                    Err(_) => break,
                };
                if last.as_ref() != Some(&snapshot) {
                    if let Err(e) = snapshot.store(&mut fh) {
                        if !warned {
                            warn!("checkpoint write to {:?} failed, position may not be saved: {}", path, e);
                            warned = true;
                        }
                    }
                    last = Some(snapshot);
                }
                if done.load(Ordering::Relaxed) {
                    break;
                }
                thread::sleep(Duration::from_secs(1));
            }
            // best-effort final write
            if let Ok(cp) = state.lock() {
                let _ = cp.store(&mut fh);
            }
        })
        .ok();
    handle
}
