//! The persistence log: a concatenation of typed records, each introduced by
//! an 8-byte ASCII magic and u32-LE length-prefixed fields. The same record
//! set serves two modes: a baseline snapshot (the full auth table followed by
//! the full KV store, installed atomically by rename) and incremental appends
//! (one record per committed mutation, flushed immediately).
//!
//! Replaying a log from the start reproduces exactly the in-memory state that
//! existed at the moment of the last write.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::{LockerError, Result};

/// magic prefix of a full auth-table entry
pub const MAGIC_AUTHENTRY: &[u8; 8] = b"AUTHAUTH";

/// magic prefix of a full KV pair
pub const MAGIC_KVENTRY: &[u8; 8] = b"KVKVKVKV";

/// magic prefix of an incremental content change
pub const MAGIC_AUTHDIFF: &[u8; 8] = b"AUTHDIFF";

/// magic prefix of an incremental value update
pub const MAGIC_KVUPDATE: &[u8; 8] = b"KVUPDATE";

/// magic prefix of an incremental key deletion
pub const MAGIC_KVDELETE: &[u8; 8] = b"KVDELETE";

/// One typed record in the persistence log.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    /// a complete user row: written on registration and in snapshots
    AuthEntry {
        /// the username
        username: String,
        /// the SHA-256 password digest
        pass_hash: Vec<u8>,
        /// the user's content, possibly empty
        content: Vec<u8>,
    },
    /// a change to a user's content
    AuthDiff {
        /// the username
        username: String,
        /// the new content, possibly empty
        content: Vec<u8>,
    },
    /// a new KV pair: written on insert and in snapshots
    KvEntry {
        /// the key
        key: String,
        /// the value
        value: Vec<u8>,
    },
    /// a changed value for an existing key
    KvUpdate {
        /// the key
        key: String,
        /// the new value
        value: Vec<u8>,
    },
    /// a removed key
    KvDelete {
        /// the key
        key: String,
    },
}

impl Record {
    /// appends the wire form of this record to `out`
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Record::AuthEntry {
                username,
                pass_hash,
                content,
            } => {
                out.extend_from_slice(MAGIC_AUTHENTRY);
                put_bytes(out, username.as_bytes());
                put_bytes(out, pass_hash);
                put_bytes(out, content);
            }
            Record::AuthDiff { username, content } => {
                out.extend_from_slice(MAGIC_AUTHDIFF);
                put_bytes(out, username.as_bytes());
                put_bytes(out, content);
            }
            Record::KvEntry { key, value } => {
                out.extend_from_slice(MAGIC_KVENTRY);
                put_bytes(out, key.as_bytes());
                put_bytes(out, value);
            }
            Record::KvUpdate { key, value } => {
                out.extend_from_slice(MAGIC_KVUPDATE);
                put_bytes(out, key.as_bytes());
                put_bytes(out, value);
            }
            Record::KvDelete { key } => {
                out.extend_from_slice(MAGIC_KVDELETE);
                put_bytes(out, key.as_bytes());
            }
        }
    }
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

/// Parses a whole log image into records.
///
/// # Errors
/// returns [`LockerError::Corrupt`] on an unknown magic or a record truncated
/// short of its declared length; EOF at a record boundary is success
pub fn parse(data: &[u8]) -> Result<Vec<Record>> {
    let mut records = Vec::new();
    let mut cur = Cursor { data, pos: 0 };
    while !cur.at_end() {
        let magic = cur.magic()?;
        let record = match &magic {
            m if m == MAGIC_AUTHENTRY => Record::AuthEntry {
                username: cur.text()?,
                pass_hash: cur.bytes()?,
                content: cur.bytes()?,
            },
            m if m == MAGIC_AUTHDIFF => Record::AuthDiff {
                username: cur.text()?,
                content: cur.bytes()?,
            },
            m if m == MAGIC_KVENTRY => Record::KvEntry {
                key: cur.text()?,
                value: cur.bytes()?,
            },
            m if m == MAGIC_KVUPDATE => Record::KvUpdate {
                key: cur.text()?,
                value: cur.bytes()?,
            },
            m if m == MAGIC_KVDELETE => Record::KvDelete { key: cur.text()? },
            m => {
                return Err(LockerError::Corrupt(format!(
                    "unknown record magic {:?} at offset {}",
                    String::from_utf8_lossy(m),
                    cur.pos - 8
                )))
            }
        };
        records.push(record);
    }
    Ok(records)
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn magic(&mut self) -> Result<[u8; 8]> {
        let raw = self.take(8)?;
        let mut magic = [0u8; 8];
        magic.copy_from_slice(raw);
        Ok(magic)
    }

    fn bytes(&mut self) -> Result<Vec<u8>> {
        let raw = self.take(4)?;
        let len = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn text(&mut self) -> Result<String> {
        let raw = self.bytes()?;
        String::from_utf8(raw)
            .map_err(|_| LockerError::Corrupt(format!("non-UTF-8 text field at offset {}", self.pos)))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(LockerError::Corrupt(format!(
                "record truncated at offset {}",
                self.pos
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }
}

/// The open log file. Owned by the storage facade for the server's lifetime;
/// appends happen inside bucket critical sections, so record boundaries never
/// interleave.
pub struct Journal {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl Journal {
    /// Opens the log at `path`, replaying any existing records, then leaves
    /// the file open in append mode for incremental writes. A missing file is
    /// not an error; it is created empty.
    pub fn open(path: &Path) -> Result<(Journal, Vec<Record>)> {
        let records = if path.exists() {
            let data = fs::read(path)?;
            let records = parse(&data)?;
            info!(
                "loaded {} records ({} bytes) from {}",
                records.len(),
                data.len(),
                path.display()
            );
            records
        } else {
            debug!("no data file at {}, starting empty", path.display());
            Vec::new()
        };
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let journal = Journal {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        };
        Ok((journal, records))
    }

    /// Appends one record and flushes it to the OS.
    pub fn append(&mut self, record: &Record) -> Result<()> {
        let mut buf = Vec::new();
        record.encode(&mut buf);
        self.writer.write_all(&buf)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Replaces the log with a pre-encoded full image: write `<path>.tmp`,
    /// fsync, atomically rename over the log, then reopen the append handle.
    /// The caller must hold whatever locks make `image` a consistent snapshot.
    pub fn install_snapshot(&mut self, image: &[u8]) -> Result<()> {
        self.writer.flush()?;
        let tmp = PathBuf::from(format!("{}.tmp", self.path.display()));
        let mut file = File::create(&tmp)?;
        file.write_all(image)?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        info!("installed a {} byte snapshot at {}", image.len(), self.path.display());
        Ok(())
    }

    /// Flushes any buffered bytes; called once at shutdown.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}
