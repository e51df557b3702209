//! The `FileWatcher` struct defines the state machine which reads lines from
//! a single file path, transparently following the file across the two log
//! rotation styles in the wild:
//!
//!   * rename-and-reopen -- the active file is renamed aside and a fresh
//!     file appears at the original path. Detected at EOF by an inode change
//!     at the path; we close the old handle and start the new file at zero.
//!   * copy-and-truncate -- the contents are copied elsewhere and the
//!     original truncated in place. Detected by the file shrinking below our
//!     offset; we seek the same handle back to zero.
//!
//! Note that under copy-and-truncate the first line written after the
//! truncation can land before our next size check and be lost when the
//! server is waiting on filesystem events rather than polling. That gap is
//! inherent to the rotation style; polling mode does not have it.

use std::fs;
use std::io;
use std::io::{BufRead, Seek};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

/// Where to place the read head when a watcher opens its file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StartFrom {
    Beginning,
    End,
    Offset(u64),
}

/// What a rotation check at EOF concluded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Rotation {
    None,
    /// A new file appeared at the path; we are now reading it from zero.
    Reopened,
    /// The file shrank underneath us; we seeked back to zero.
    Truncated,
}

/// One read attempt: either a complete line landed in the caller's buffer or
/// we are at EOF with, possibly, a partial line held back until its newline
/// arrives.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome {
    Line,
    Eof,
}

pub struct FileWatcher {
    path: PathBuf,
    reader: io::BufReader<fs::File>,
    inode: u64,
    /// Bytes consumed through the last newline. This is the checkpointable
    /// position: it always sits on a line boundary.
    offset: u64,
    /// A line fragment read at EOF before its newline showed up.
    pending: String,
    pending_bytes: u64,
}

impl FileWatcher {
    /// Open `path` and place the read head per `start`. A stored offset
    /// beyond the current end of file means the file shrank while we were
    /// away, so we start over from the top.
    pub fn open(path: &Path, start: StartFrom) -> io::Result<FileWatcher> {
        let f = fs::File::open(path)?;
        let metadata = f.metadata()?;
        let len = metadata.len();
        let offset = match start {
            StartFrom::Beginning => 0,
            StartFrom::End => len,
            StartFrom::Offset(o) => {
                if o > len {
                    0
                } else {
                    o
                }
            }
        };
        let mut rdr = io::BufReader::new(f);
        rdr.seek(io::SeekFrom::Start(offset))?;
        Ok(FileWatcher {
            path: path.to_path_buf(),
            reader: rdr,
            inode: metadata.ino(),
            offset: offset,
            pending: String::new(),
            pending_bytes: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn inode(&self) -> u64 {
        self.inode
    }

    /// The byte position just past the last line whose newline we consumed.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read the next complete line into `buf`, trailing newline removed and
    /// surrounding whitespace trimmed. `Outcome::Eof` means no complete line
    /// is available right now; call `check_rotation` and come back.
    pub fn read_line(&mut self, buf: &mut String) -> io::Result<Outcome> {
        loop {
            let mut chunk = String::new();
            let sz = match self.reader.read_line(&mut chunk) {
                Ok(sz) => sz,
                Err(e) => {
                    // drop the partial so a bad byte sequence cannot wedge us
                    self.pending.clear();
                    self.pending_bytes = 0;
                    return Err(e);
                }
            };
            if sz == 0 {
                return Ok(Outcome::Eof);
            }
            if chunk.ends_with('\n') {
                buf.clear();
                buf.push_str(&self.pending);
                buf.push_str(&chunk);
                self.offset += self.pending_bytes + sz as u64;
                self.pending.clear();
                self.pending_bytes = 0;
                let trimmed = buf.trim().to_string();
                buf.clear();
                buf.push_str(&trimmed);
                return Ok(Outcome::Line);
            }
            // newline not written yet; hold the fragment and report EOF
            self.pending.push_str(&chunk);
            self.pending_bytes += sz as u64;
        }
    }

    /// At EOF, decide whether the file rotated underneath us. `reopen`
    /// gates the rename-and-reopen handling; stdin-like callers pass false.
    pub fn check_rotation(&mut self, reopen: bool) -> io::Result<Rotation> {
        if reopen {
            match fs::metadata(&self.path) {
                Ok(metadata) => {
                    if metadata.ino() != self.inode {
                        let f = fs::File::open(&self.path)?;
                        let inode = f.metadata()?.ino();
                        self.reader = io::BufReader::new(f);
                        self.inode = inode;
                        self.offset = 0;
                        self.pending.clear();
                        self.pending_bytes = 0;
                        return Ok(Rotation::Reopened);
                    }
                }
                // the path can be briefly absent mid-rotation; keep the old
                // handle and look again next time
                Err(ref e) if e.kind() == io::ErrorKind::NotFound => return Ok(Rotation::None),
                Err(e) => return Err(e),
            }
        }
        let len = self.reader.get_ref().metadata()?.len();
        if len < self.offset + self.pending_bytes {
            self.reader.seek(io::SeekFrom::Start(0))?;
            self.offset = 0;
            self.pending.clear();
            self.pending_bytes = 0;
            return Ok(Rotation::Truncated);
        }
        Ok(Rotation::None)
    }
}
