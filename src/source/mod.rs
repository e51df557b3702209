//! Sources produce raw log lines, one bounded channel per input. The only
//! sources are files followed through rotation, and standard input when the
//! configured path is the literal `-`.

use crossbeam_channel;
use glob;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use util::LineRcv;

mod file;
mod stdin;

pub use self::file::checkpoint::{default_path, Checkpoint, STATE_SUFFIX};
pub use self::file::file_server::{FileServer, FileServerConfig};
pub use self::file::file_watcher::{FileWatcher, Outcome, Rotation, StartFrom};

/// Lines already read before a tailer notices downstream is full; keeps a
/// burst from turning into unbounded memory.
const LINE_CHANNEL_CAP: usize = 256;

/// Start location policy for a tailed file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReadFrom {
    Beginning,
    End,
    /// Resume from the checkpoint; see `FileServer::start_location` for the
    /// fallback ladder when the checkpoint is missing or stale.
    Last,
}

/// Configuration for the whole set of tailed inputs.
#[derive(Debug, Clone)]
pub struct TailConfig {
    /// Paths to follow. Shell globs are expanded at startup; `-` means
    /// standard input.
    pub paths: Vec<String>,
    /// Globs removed from the expanded set.
    pub filter_paths: Vec<String>,
    pub read_from: ReadFrom,
    pub stop_at_eof: bool,
    pub poll: bool,
    /// Explicit checkpoint path. Ignored (with a note) when more than one
    /// file is followed; per-file defaults are used instead.
    pub checkpoint_file: Option<PathBuf>,
}

/// A running tail: its line channel plus the thread handle to join on
/// shutdown.
pub struct Tailer {
    pub name: String,
    pub lines: LineRcv,
    pub handle: thread::JoinHandle<()>,
}

#[derive(Debug)]
pub enum SourceError {
    /// Globs expanded to nothing tailable.
    NoFiles,
    BadGlob(String, glob::PatternError),
    Missing(PathBuf, ::std::io::Error),
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            SourceError::NoFiles => {
                write!(f, "after removing missing files and checkpoint files there is nothing left to tail")
            }
            SourceError::BadGlob(ref pat, ref e) => write!(f, "bad glob {:?}: {}", pat, e),
            SourceError::Missing(ref path, ref e) => write!(f, "cannot tail {:?}: {}", path, e),
        }
    }
}

/// Expand the configured paths and start one tail thread per input.
///
/// Files whose names end in the reserved checkpoint suffix, match a filter
/// glob, or equal the explicit checkpoint path are excluded so the agent
/// never tails its own state.
pub fn get_entries(config: &TailConfig, stop: Arc<AtomicBool>) -> Result<Vec<Tailer>, SourceError> {
    let mut use_stdin = false;
    let mut filenames: Vec<PathBuf> = Vec::new();

    let mut filters = Vec::new();
    for pat in &config.filter_paths {
        let compiled =
            glob::Pattern::new(pat).map_err(|e| SourceError::BadGlob(pat.clone(), e))?;
        filters.push(compiled);
    }

    for path in &config.paths {
        if path == "-" {
            use_stdin = true;
            continue;
        }
        let entries =
            glob::glob(path).map_err(|e| SourceError::BadGlob(path.clone(), e))?;
        let mut matched = false;
        for entry in entries {
            let found = match entry {
                Ok(p) => p,
                Err(e) => {
                    debug!("glob error under {:?}: {}", path, e);
                    continue;
                }
            };
            matched = true;
            if found.to_string_lossy().ends_with(STATE_SUFFIX) {
                debug!("skipping {:?}: it is a checkpoint file", found);
                continue;
            }
            if config.checkpoint_file.as_ref() == Some(&found) {
                debug!("skipping {:?}: it is the configured checkpoint", found);
                continue;
            }
            if filters.iter().any(|f| f.matches_path(&found)) {
                debug!("skipping {:?}: matches a filter glob", found);
                continue;
            }
            filenames.push(found);
        }
        if !matched {
            // a literal path that does not exist is fatal at startup
            if let Err(e) = fs::metadata(path) {
                return Err(SourceError::Missing(PathBuf::from(path), e));
            }
        }
    }
    filenames.sort();
    filenames.dedup();

    if filenames.is_empty() && !use_stdin {
        return Err(SourceError::NoFiles);
    }

    let explicit_checkpoint = if filenames.len() > 1 && config.checkpoint_file.is_some() {
        info!("tailing multiple files; ignoring the explicit checkpoint path in favor of per-file defaults");
        None
    } else {
        config.checkpoint_file.clone()
    };

    let mut tailers = Vec::with_capacity(filenames.len() + 1);
    if use_stdin {
        let (snd, rcv) = crossbeam_channel::bounded(LINE_CHANNEL_CAP);
        let stdin_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("tail-stdin".to_string())
            .spawn(move || stdin::run(snd, stdin_stop))
            .expect("spawning a tail thread");
        tailers.push(Tailer {
            name: "STDIN".to_string(),
            lines: rcv,
            handle: handle,
        });
    }
    for path in filenames {
        fs::metadata(&path).map_err(|e| SourceError::Missing(path.clone(), e))?;
        let checkpoint_path = explicit_checkpoint
            .clone()
            .unwrap_or_else(|| default_path(&path));
        let server_config = FileServerConfig {
            path: path.clone(),
            read_from: config.read_from,
            stop_at_eof: config.stop_at_eof,
            poll: config.poll,
            checkpoint_path: Some(checkpoint_path),
        };
        let (snd, rcv) = crossbeam_channel::bounded(LINE_CHANNEL_CAP);
        let server = FileServer::new(server_config, snd, Arc::clone(&stop));
        let name = path.to_string_lossy().into_owned();
        let handle = thread::Builder::new()
            .name(format!("tail-{}", name))
            .spawn(move || server.run())
            .expect("spawning a tail thread");
        tailers.push(Tailer {
            name: name,
            lines: rcv,
            handle: handle,
        });
    }
    Ok(tailers)
}
