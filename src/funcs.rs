//! The map/reduce plug-in facility. A plug-in is an opaque executable blob
//! (typically a script with a shebang line) registered under a name by the
//! admin. Invocation never loads code into the server process: the blob is
//! staged as a temporary executable and run as a child process, with the KV
//! pairs streamed to its stdin and its stdout taken as the result.
//!
//! Child stdin framing, per pair: `u32-LE klen | key | u32-LE vlen | value`.
//! The child maps over the pairs and reduces however it likes; whatever it
//! writes to stdout is returned verbatim to the requesting client.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::process::{Command, Stdio};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{LockerError, Result};

/// Registry of named plug-in blobs.
pub struct FuncTable {
    funcs: Mutex<HashMap<String, Vec<u8>>>,
}

impl FuncTable {
    /// creates an empty registry
    pub fn new() -> Self {
        FuncTable {
            funcs: Mutex::new(HashMap::new()),
        }
    }

    /// Registers `blob` under `name`. Returns false if the name is taken or
    /// the blob is empty; registrations are never replaced.
    pub fn register(&self, name: &str, blob: Vec<u8>) -> bool {
        if blob.is_empty() {
            return false;
        }
        let mut funcs = self.funcs.lock();
        if funcs.contains_key(name) {
            return false;
        }
        debug!("registered function {} ({} bytes)", name, blob.len());
        funcs.insert(name.to_string(), blob);
        true
    }

    /// Fetches a copy of the blob registered under `name`.
    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.funcs.lock().get(name).cloned()
    }
}

impl Default for FuncTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs `blob` as a child process over `pairs`, returning its stdout.
///
/// The caller must not hold any store locks: the child runs for as long as it
/// likes, against the snapshot of pairs it was handed.
///
/// # Errors
/// returns [`LockerError::StringErr`] if the blob cannot be staged or spawned,
/// exits nonzero, or produces no output
pub fn execute(blob: &[u8], pairs: &[(String, Vec<u8>)]) -> Result<Vec<u8>> {
    let dir = tempfile::tempdir()?;
    let exe = dir.path().join("func");
    // the write handle must be closed before exec, or the spawn hits ETXTBSY
    {
        let mut file = File::create(&exe)?;
        file.write_all(blob)?;
    }
    let mut perms = fs::metadata(&exe)?.permissions();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        perms.set_mode(0o755);
    }
    fs::set_permissions(&exe, perms)?;

    let mut child = Command::new(&exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| LockerError::StringErr(format!("could not spawn function: {}", e)))?;

    {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| LockerError::StringErr("function stdin unavailable".to_string()))?;
        let mut stdin = std::io::BufWriter::new(stdin);
        for (key, value) in pairs {
            stdin.write_all(&(key.len() as u32).to_le_bytes())?;
            stdin.write_all(key.as_bytes())?;
            stdin.write_all(&(value.len() as u32).to_le_bytes())?;
            stdin.write_all(value)?;
        }
        stdin.flush()?;
        // dropping the writer closes the pipe so the child sees EOF
    }

    let output = child
        .wait_with_output()
        .map_err(|e| LockerError::StringErr(format!("function wait failed: {}", e)))?;
    if !output.status.success() {
        warn!("function exited with {:?}", output.status.code());
        return Err(LockerError::StringErr(format!(
            "function exited with status {:?}",
            output.status.code()
        )));
    }
    if output.stdout.is_empty() {
        return Err(LockerError::StringErr("function produced no output".to_string()));
    }
    Ok(output.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_rejects_duplicates_and_empty_blobs() {
        let table = FuncTable::new();
        assert!(table.register("f", b"#!/bin/sh\ntrue\n".to_vec()));
        assert!(!table.register("f", b"#!/bin/sh\ntrue\n".to_vec()));
        assert!(!table.register("empty", Vec::new()));
        assert!(table.get("f").is_some());
        assert!(table.get("missing").is_none());
    }

    #[test]
    fn execute_pipes_pairs_and_collects_stdout() {
        // counts the bytes streamed to it: 4 + 1 + 4 + 2 per pair
        let blob = b"#!/bin/sh\nwc -c\n".to_vec();
        let pairs = vec![
            ("a".to_string(), b"v1".to_vec()),
            ("b".to_string(), b"v2".to_vec()),
        ];
        let out = execute(&blob, &pairs).unwrap();
        let count: u64 = String::from_utf8(out).unwrap().trim().parse().unwrap();
        assert_eq!(count, 22);
    }

    #[test]
    fn execute_fails_on_nonzero_exit() {
        let blob = b"#!/bin/sh\nexit 3\n".to_vec();
        assert!(execute(&blob, &[]).is_err());
    }

    #[test]
    fn execute_fails_on_silent_function() {
        let blob = b"#!/bin/sh\ncat > /dev/null\n".to_vec();
        let pairs = vec![("k".to_string(), b"v".to_vec())];
        assert!(execute(&blob, &pairs).is_err());
    }
}
