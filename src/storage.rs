//! The quota-aware storage facade. It owns the authentication table, the
//! key/value store, the MRU index, the function registry, and the open
//! persistence log, and exposes the full authenticated operation set.
//!
//! Every mutation appends its durability record inside the mutated bucket's
//! critical section, via the map's callbacks: once any reader can observe the
//! change, the record is already in the log.
//!
//! Lock discipline: a quota check and its charge happen atomically under one
//! write-lock acquisition of the user's auth bucket, and that lock is released
//! before any KV bucket lock is taken (the download charge runs after the KV
//! read lock is released, once the fetched size is known). No auth-bucket
//! lock is ever held together with a KV-bucket lock. The whole-table scans
//! (ALL, SAV) acquire bucket locks in a fixed order (auth table first, then
//! KV store), which keeps them deadlock-free against concurrent mutations.

use std::cell::RefCell;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use subtle::ConstantTimeEq;
use tracing::{debug, error, info};

use crate::crypto::{hash_password, LEN_PASS_HASH};
use crate::funcs::{self, FuncTable};
use crate::journal::{Journal, Record};
use crate::map::ShardedMap;
use crate::mru::MruIndex;
use crate::protocol::*;
use crate::quota::{Clock, QuotaTracker, SystemClock};
use crate::{LockerError, Result};

/// How a successful storage operation ended.
#[derive(Debug, PartialEq)]
pub enum OpOutcome {
    /// plain success
    Ok,
    /// an upsert that inserted a new pair
    Inserted,
    /// an upsert that replaced an existing value
    Updated,
    /// success carrying bytes for the client
    Data(Vec<u8>),
}

/// Result of a storage operation: an outcome, or the response constant to
/// send back to the client.
pub type OpResult = std::result::Result<OpOutcome, &'static str>;

/// Everything the facade needs to know at construction.
pub struct StorageConfig {
    /// path of the persistence log
    pub datafile: PathBuf,
    /// bucket count for both hash tables
    pub buckets: usize,
    /// upload quota in bytes per window
    pub up_quota: u64,
    /// download quota in bytes per window
    pub down_quota: u64,
    /// request quota in operations per window
    pub req_quota: u64,
    /// quota window length in seconds
    pub quota_dur: u64,
    /// how many recently-used keys the top listing reports
    pub top_size: usize,
    /// the username with admin rights
    pub admin: String,
}

/// one user's row in the authentication table
struct AuthEntry {
    username: String,
    pass_hash: [u8; LEN_PASS_HASH],
    content: Vec<u8>,
    uploads: QuotaTracker,
    downloads: QuotaTracker,
    requests: QuotaTracker,
}

/// The storage facade.
pub struct Storage {
    auth_table: ShardedMap<String, AuthEntry>,
    kv_store: ShardedMap<String, Vec<u8>>,
    journal: Mutex<Journal>,
    mru: MruIndex,
    funcs: FuncTable,
    up_quota: u64,
    down_quota: u64,
    req_quota: u64,
    quota_dur: u64,
    admin: String,
    clock: Arc<dyn Clock>,
}

impl Storage {
    /// Opens the facade, replaying the persistence log at `config.datafile`
    /// (a missing file starts the server empty) and leaving it open for
    /// incremental appends.
    pub fn open(config: StorageConfig) -> Result<Storage> {
        Self::open_with_clock(config, Arc::new(SystemClock))
    }

    /// [`Storage::open`] with an injected clock; tests drive quota windows
    /// through a [`crate::quota::ManualClock`].
    pub fn open_with_clock(config: StorageConfig, clock: Arc<dyn Clock>) -> Result<Storage> {
        let (journal, records) = Journal::open(&config.datafile)?;
        let storage = Storage {
            auth_table: ShardedMap::new(config.buckets),
            kv_store: ShardedMap::new(config.buckets),
            journal: Mutex::new(journal),
            mru: MruIndex::new(config.top_size),
            funcs: FuncTable::new(),
            up_quota: config.up_quota,
            down_quota: config.down_quota,
            req_quota: config.req_quota,
            quota_dur: config.quota_dur,
            admin: config.admin,
            clock,
        };
        for record in records {
            storage.replay(record)?;
        }
        Ok(storage)
    }

    fn replay(&self, record: Record) -> Result<()> {
        match record {
            Record::AuthEntry {
                username,
                pass_hash,
                content,
            } => {
                let mut digest = [0u8; LEN_PASS_HASH];
                if pass_hash.len() != LEN_PASS_HASH {
                    return Err(LockerError::Corrupt(format!(
                        "password digest for {} has {} bytes",
                        username,
                        pass_hash.len()
                    )));
                }
                digest.copy_from_slice(&pass_hash);
                let entry = self.fresh_entry(username.clone(), digest, content);
                self.auth_table.insert(username, entry, || {});
            }
            Record::AuthDiff { username, content } => {
                self.auth_table.with(&username, |e| e.content = content);
            }
            Record::KvEntry { key, value } => {
                self.kv_store.insert(key, value, || {});
            }
            Record::KvUpdate { key, value } => {
                self.kv_store.upsert(key, value, || {}, || {});
            }
            Record::KvDelete { key } => {
                self.kv_store.remove(&key, || {});
            }
        }
        Ok(())
    }

    fn fresh_entry(&self, username: String, pass_hash: [u8; LEN_PASS_HASH], content: Vec<u8>) -> AuthEntry {
        AuthEntry {
            username,
            pass_hash,
            content,
            uploads: QuotaTracker::new(self.up_quota, self.quota_dur, Arc::clone(&self.clock)),
            downloads: QuotaTracker::new(self.down_quota, self.quota_dur, Arc::clone(&self.clock)),
            requests: QuotaTracker::new(self.req_quota, self.quota_dur, Arc::clone(&self.clock)),
        }
    }

    fn append_record(&self, record: &Record) {
        let mut journal = self.journal.lock();
        if let Err(e) = journal.append(record) {
            error!("journal append failed: {:?}", e);
        }
    }

    /// Checks a username and password against the auth table. A byte-for-byte
    /// digest match, compared in constant time, is the only success.
    pub fn auth(&self, username: &str, pass: &str) -> bool {
        let digest = hash_password(pass);
        let mut ok = false;
        self.auth_table.with_readonly(&username.to_string(), |e| {
            ok = digest[..].ct_eq(&e.pass_hash[..]).into();
        });
        ok
    }

    /// true if `username` authenticates and is the configured admin
    pub fn auth_admin(&self, username: &str, pass: &str) -> bool {
        self.auth(username, pass) && username == self.admin
    }

    /// REG: create a user with an empty content field and fresh quotas.
    pub fn add_user(&self, username: &str, pass: &str) -> OpResult {
        if !valid_username(username) || !valid_password(pass) {
            return Err(RES_ERR_MSG_FMT);
        }
        let digest = hash_password(pass);
        let entry = self.fresh_entry(username.to_string(), digest, Vec::new());
        let record = Record::AuthEntry {
            username: username.to_string(),
            pass_hash: digest.to_vec(),
            content: Vec::new(),
        };
        let inserted = self
            .auth_table
            .insert(username.to_string(), entry, || self.append_record(&record));
        if inserted {
            info!("registered user {}", username);
            Ok(OpOutcome::Ok)
        } else {
            Err(RES_ERR_USER_EXISTS)
        }
    }

    /// SET: replace the requesting user's own content.
    pub fn set_user_data(&self, username: &str, pass: &str, content: Vec<u8>) -> OpResult {
        if !valid_username(username) || !valid_password(pass) || content.len() > LEN_CONTENT {
            return Err(RES_ERR_MSG_FMT);
        }
        if !self.auth(username, pass) {
            return Err(RES_ERR_LOGIN);
        }
        let updated = self.auth_table.with(&username.to_string(), |e| {
            e.content = content;
            self.append_record(&Record::AuthDiff {
                username: username.to_string(),
                content: e.content.clone(),
            });
        });
        if updated {
            Ok(OpOutcome::Ok)
        } else {
            Err(RES_ERR_LOGIN)
        }
    }

    /// GET: fetch `who`'s content.
    pub fn get_user_data(&self, username: &str, pass: &str, who: &str) -> OpResult {
        if !valid_username(username) || !valid_password(pass) || !valid_username(who) {
            return Err(RES_ERR_MSG_FMT);
        }
        if !self.auth(username, pass) {
            return Err(RES_ERR_LOGIN);
        }
        let mut found = false;
        let mut data = Vec::new();
        self.auth_table.with_readonly(&who.to_string(), |e| {
            found = true;
            data = e.content.clone();
        });
        if !found {
            Err(RES_ERR_NO_USER)
        } else if data.is_empty() {
            Err(RES_ERR_NO_DATA)
        } else {
            Ok(OpOutcome::Data(data))
        }
    }

    /// ALL: newline-delimited listing of every username.
    pub fn get_all_users(&self, username: &str, pass: &str) -> OpResult {
        if !valid_username(username) || !valid_password(pass) {
            return Err(RES_ERR_MSG_FMT);
        }
        if !self.auth(username, pass) {
            return Err(RES_ERR_LOGIN);
        }
        let mut names = Vec::new();
        self.auth_table
            .for_each_readonly(|name, _| names.push(name.clone()), || {});
        names.sort();
        Ok(OpOutcome::Data(names.join("\n").into_bytes()))
    }

    /// SAV: write a full snapshot and atomically install it. Admin only.
    pub fn save(&self, username: &str, pass: &str) -> OpResult {
        if !valid_username(username) || !valid_password(pass) {
            return Err(RES_ERR_MSG_FMT);
        }
        if !self.auth_admin(username, pass) {
            return Err(RES_ERR_LOGIN);
        }
        match self.persist() {
            Ok(()) => Ok(OpOutcome::Ok),
            Err(e) => {
                error!("snapshot failed: {:?}", e);
                Err(RES_ERR_XMIT)
            }
        }
    }

    /// Serializes the whole store and installs it as the new log. Both tables
    /// are scanned under strict 2PL, auth first then KV, and the snapshot is
    /// written while every lock is still held: the image is a single
    /// serialization point against all concurrent mutation.
    fn persist(&self) -> Result<()> {
        let image = RefCell::new(Vec::new());
        let outcome = RefCell::new(Ok(()));
        self.auth_table.for_each_readonly(
            |_, entry| {
                Record::AuthEntry {
                    username: entry.username.clone(),
                    pass_hash: entry.pass_hash.to_vec(),
                    content: entry.content.clone(),
                }
                .encode(&mut image.borrow_mut());
            },
            || {
                self.kv_store.for_each_readonly(
                    |key, value| {
                        Record::KvEntry {
                            key: key.clone(),
                            value: value.clone(),
                        }
                        .encode(&mut image.borrow_mut());
                    },
                    || {
                        let mut journal = self.journal.lock();
                        *outcome.borrow_mut() = journal.install_snapshot(&image.borrow());
                    },
                );
            },
        );
        outcome.into_inner()
    }

    /// Charges the request tracker (always) and the upload tracker (when
    /// `upload` is nonzero) for one attempt. The first tracker that would be
    /// exceeded rejects the attempt and nothing is charged.
    fn charge(&self, username: &str, upload: u64) -> std::result::Result<(), &'static str> {
        let mut verdict = Err(RES_ERR_LOGIN);
        self.auth_table.with(&username.to_string(), |e| {
            if !e.requests.check(1) || (upload > 0 && !e.uploads.check(upload)) {
                verdict = Err(RES_ERR_QUOTA);
                return;
            }
            e.requests.add(1);
            if upload > 0 {
                e.uploads.add(upload);
            }
            verdict = Ok(());
        });
        verdict
    }

    /// Charges the download tracker once the fetched size is known.
    fn charge_download(&self, username: &str, amount: u64) -> std::result::Result<(), &'static str> {
        let mut verdict = Err(RES_ERR_LOGIN);
        self.auth_table.with(&username.to_string(), |e| {
            if !e.downloads.check(amount) {
                verdict = Err(RES_ERR_QUOTA);
                return;
            }
            e.downloads.add(amount);
            verdict = Ok(());
        });
        verdict
    }

    /// KVI: insert a new pair; an existing key is an error.
    pub fn kv_insert(&self, username: &str, pass: &str, key: &str, val: Vec<u8>) -> OpResult {
        if !valid_username(username) || !valid_password(pass) || !valid_key(key) || val.len() > LEN_VAL {
            return Err(RES_ERR_MSG_FMT);
        }
        if !self.auth(username, pass) {
            return Err(RES_ERR_LOGIN);
        }
        self.charge(username, val.len() as u64)?;
        let record = Record::KvEntry {
            key: key.to_string(),
            value: val.clone(),
        };
        let inserted = self
            .kv_store
            .insert(key.to_string(), val, || self.append_record(&record));
        if inserted {
            self.mru.insert(key);
            Ok(OpOutcome::Ok)
        } else {
            Err(RES_ERR_KEY)
        }
    }

    /// KVU: insert or update, with distinct success responses per branch.
    pub fn kv_upsert(&self, username: &str, pass: &str, key: &str, val: Vec<u8>) -> OpResult {
        if !valid_username(username) || !valid_password(pass) || !valid_key(key) || val.len() > LEN_VAL {
            return Err(RES_ERR_MSG_FMT);
        }
        if !self.auth(username, pass) {
            return Err(RES_ERR_LOGIN);
        }
        self.charge(username, val.len() as u64)?;
        let on_insert = Record::KvEntry {
            key: key.to_string(),
            value: val.clone(),
        };
        let on_update = Record::KvUpdate {
            key: key.to_string(),
            value: val.clone(),
        };
        let inserted = self.kv_store.upsert(
            key.to_string(),
            val,
            || self.append_record(&on_insert),
            || self.append_record(&on_update),
        );
        self.mru.insert(key);
        if inserted {
            Ok(OpOutcome::Inserted)
        } else {
            Ok(OpOutcome::Updated)
        }
    }

    /// KVG: fetch the value mapped to `key`.
    pub fn kv_get(&self, username: &str, pass: &str, key: &str) -> OpResult {
        if !valid_username(username) || !valid_password(pass) || !valid_key(key) {
            return Err(RES_ERR_MSG_FMT);
        }
        if !self.auth(username, pass) {
            return Err(RES_ERR_LOGIN);
        }
        self.charge(username, 0)?;
        let mut found = false;
        let mut data = Vec::new();
        self.kv_store.with_readonly(&key.to_string(), |v| {
            found = true;
            data = v.clone();
        });
        if !found {
            return Err(RES_ERR_KEY);
        }
        if data.is_empty() {
            return Err(RES_ERR_NO_DATA);
        }
        self.charge_download(username, data.len() as u64)?;
        self.mru.insert(key);
        Ok(OpOutcome::Data(data))
    }

    /// KVD: remove a pair.
    pub fn kv_delete(&self, username: &str, pass: &str, key: &str) -> OpResult {
        if !valid_username(username) || !valid_password(pass) || !valid_key(key) {
            return Err(RES_ERR_MSG_FMT);
        }
        if !self.auth(username, pass) {
            return Err(RES_ERR_LOGIN);
        }
        self.charge(username, 0)?;
        let record = Record::KvDelete {
            key: key.to_string(),
        };
        let removed = self
            .kv_store
            .remove(&key.to_string(), || self.append_record(&record));
        if removed {
            self.mru.remove(key);
            Ok(OpOutcome::Ok)
        } else {
            Err(RES_ERR_KEY)
        }
    }

    /// KVA: newline-delimited listing of every key.
    pub fn kv_all(&self, username: &str, pass: &str) -> OpResult {
        if !valid_username(username) || !valid_password(pass) {
            return Err(RES_ERR_MSG_FMT);
        }
        if !self.auth(username, pass) {
            return Err(RES_ERR_LOGIN);
        }
        self.charge(username, 0)?;
        let mut keys = Vec::new();
        self.kv_store
            .for_each_readonly(|key, _| keys.push(key.clone()), || {});
        if keys.is_empty() {
            return Err(RES_ERR_NO_DATA);
        }
        keys.sort();
        Ok(OpOutcome::Data(keys.join("\n").into_bytes()))
    }

    /// KVT: the most recently used keys, newest first.
    pub fn kv_top(&self, username: &str, pass: &str) -> OpResult {
        if !valid_username(username) || !valid_password(pass) {
            return Err(RES_ERR_MSG_FMT);
        }
        if !self.auth(username, pass) {
            return Err(RES_ERR_LOGIN);
        }
        self.charge(username, 0)?;
        let listing = self.mru.get();
        if listing.is_empty() {
            return Err(RES_ERR_NO_DATA);
        }
        Ok(OpOutcome::Data(listing.into_bytes()))
    }

    /// KVF: register a map/reduce function blob under a name. Admin only.
    pub fn register_fn(&self, username: &str, pass: &str, name: &str, blob: Vec<u8>) -> OpResult {
        if !valid_username(username) || !valid_password(pass) || !valid_key(name) {
            return Err(RES_ERR_MSG_FMT);
        }
        if blob.len() > LEN_FUNC {
            return Err(RES_ERR_MSG_FMT);
        }
        if !self.auth_admin(username, pass) {
            return Err(RES_ERR_LOGIN);
        }
        if self.funcs.register(name, blob) {
            Ok(OpOutcome::Ok)
        } else {
            Err(RES_ERR_SO)
        }
    }

    /// KVX: run a registered function over a snapshot of the whole KV store.
    pub fn invoke_fn(&self, username: &str, pass: &str, name: &str) -> OpResult {
        if !valid_username(username) || !valid_password(pass) || !valid_key(name) {
            return Err(RES_ERR_MSG_FMT);
        }
        if !self.auth(username, pass) {
            return Err(RES_ERR_LOGIN);
        }
        self.charge(username, 0)?;
        let blob = match self.funcs.get(name) {
            Some(blob) => blob,
            None => return Err(RES_ERR_SO),
        };
        // snapshot the pairs under 2PL, then run the child with no locks held
        let mut pairs = Vec::new();
        self.kv_store.for_each_readonly(
            |key, value| pairs.push((key.clone(), value.clone())),
            || {},
        );
        match funcs::execute(&blob, &pairs) {
            Ok(out) => Ok(OpOutcome::Data(out)),
            Err(e) => {
                debug!("function {} failed: {:?}", name, e);
                Err(RES_ERR_SO)
            }
        }
    }

    /// Flushes and releases the log. Called once all workers have stopped.
    pub fn shutdown(&self) {
        let mut journal = self.journal.lock();
        if let Err(e) = journal.flush() {
            error!("journal flush at shutdown failed: {:?}", e);
        }
    }
}

fn printable(s: &str) -> bool {
    s.bytes().all(|b| (0x20..0x7f).contains(&b))
}

fn valid_username(name: &str) -> bool {
    !name.is_empty() && name.len() <= LEN_UNAME && printable(name)
}

fn valid_password(pass: &str) -> bool {
    !pass.is_empty() && pass.len() <= LEN_PASS && printable(pass)
}

fn valid_key(key: &str) -> bool {
    !key.is_empty() && key.len() <= LEN_KEY && printable(key)
}
