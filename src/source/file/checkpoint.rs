//! Persistent tail position for a single log file.
//!
//! The checkpoint is a one-line JSON document holding the logfile path, the
//! inode we were reading and the byte offset just past the last consumed
//! newline. It is rewritten in place (truncate, write at zero, sync) so a
//! reader never sees a torn document, and at most once per second so a busy
//! file does not turn into a busy statefile.

use serde_json;
use std::fs;
use std::io;
use std::io::{Seek, Write};
use std::path::{Path, PathBuf};

/// Files with this suffix are checkpoints and are never tailed, no matter
/// how permissive the configured glob is.
pub const STATE_SUFFIX: &str = ".caudal.state";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(rename = "LogfileName")]
    pub logfile_name: String,
    #[serde(rename = "INode")]
    pub inode: u64,
    #[serde(rename = "Offset")]
    pub offset: u64,
}

impl Checkpoint {
    /// Read a checkpoint back. Any failure -- missing file, unreadable,
    /// malformed JSON -- comes back as None; the caller falls back to its
    /// start-location default.
    pub fn load(path: &Path) -> Option<Checkpoint> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) => {
                debug!("could not read checkpoint {:?}: {}", path, e);
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(cp) => Some(cp),
            Err(e) => {
                debug!("could not decode checkpoint {:?}: {}", path, e);
                None
            }
        }
    }

    /// Rewrite the checkpoint through an already-open handle.
    pub fn store(&self, fh: &mut fs::File) -> io::Result<()> {
        let mut out = serde_json::to_vec(self)?;
        out.push(b'\n');
        fh.set_len(0)?;
        fh.seek(io::SeekFrom::Start(0))?;
        fh.write_all(&out)?;
        fh.sync_all()
    }
}

/// The default checkpoint path for a logfile: the input path with a trailing
/// `.log` extension replaced by the reserved suffix.
pub fn default_path(logfile: &Path) -> PathBuf {
    let name = logfile.to_string_lossy();
    let base = if name.ends_with(".log") {
        &name[..name.len() - 4]
    } else {
        &name[..]
    };
    PathBuf::from(format!("{}{}", base, STATE_SUFFIX))
}
