//! A TCP socket server implementation over the storage facade. The listener
//! accepts connections and hands each one to a worker from a [`ThreadPool`];
//! the worker runs the per-connection state machine: read the RSA envelope,
//! recover the per-request AES key, read and decrypt the body, dispatch to
//! storage, and send back the AES-encrypted reply. One request per connection.
//!
//! An authenticated BYE raises a halt flag and pokes the acceptor awake with a
//! loopback connection; the listener then stops accepting, the pool drains and
//! joins, and storage flushes its log.

use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rsa::RsaPrivateKey;
use tracing::{debug, error, info};

use crate::crypto::{self, AesKey};
use crate::net;
use crate::protocol::*;
use crate::storage::{OpOutcome, OpResult, Storage};
use crate::thread_pool::ThreadPool;
use crate::{LockerError, Result};

/// The server: a storage facade, a worker pool, and the RSA keypair whose
/// public half clients fetch with a KEY request.
pub struct LockerServer<P: ThreadPool> {
    storage: Arc<Storage>,
    pool: P,
    private_key: Arc<RsaPrivateKey>,
    public_pem: Arc<Vec<u8>>,
    halt: Arc<AtomicBool>,
}

impl<P: ThreadPool> LockerServer<P> {
    /// Creates a server from an opened [`Storage`], a pool, and the keypair:
    /// the private key decrypts request envelopes, `public_pem` is the raw
    /// PEM file served to KEY requests.
    pub fn new(storage: Storage, pool: P, private_key: RsaPrivateKey, public_pem: Vec<u8>) -> Self {
        LockerServer {
            storage: Arc::new(storage),
            pool,
            private_key: Arc::new(private_key),
            public_pem: Arc::new(public_pem),
            halt: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Starts the server listening on the given address. Returns once an
    /// authenticated BYE has been served and every worker has finished.
    ///
    /// # Errors
    /// returns an error if the listening socket could not be bound
    pub fn run<A: ToSocketAddrs>(self, addr: A) -> Result<()> {
        let listener = TcpListener::bind(addr)?;
        let local = listener.local_addr()?;
        let wake_addr = if local.ip().is_unspecified() {
            SocketAddr::new([127, 0, 0, 1].into(), local.port())
        } else {
            local
        };
        info!("Listening on {}", local);

        for stream in listener.incoming() {
            if self.halt.load(Ordering::SeqCst) {
                break;
            }
            match stream {
                Ok(stream) => {
                    let storage = Arc::clone(&self.storage);
                    let pri = Arc::clone(&self.private_key);
                    let pem = Arc::clone(&self.public_pem);
                    let halt = Arc::clone(&self.halt);
                    self.pool.spawn(move || {
                        match serve_client(stream, &pri, &pem, &storage) {
                            Ok(true) => {
                                halt.store(true, Ordering::SeqCst);
                                // wake the acceptor so it notices the flag
                                let _ = TcpStream::connect(wake_addr);
                            }
                            Ok(false) => {}
                            Err(e) => error!("Error on serving client: {:?}", e),
                        }
                    });
                }
                Err(e) => error!("Connection failed: {}", e),
            }
        }

        info!("listener stopped, draining the worker pool");
        self.pool.shutdown();
        self.storage.shutdown();
        info!("Server terminated");
        Ok(())
    }
}

/// Runs one connection through the request state machine.
///
/// Returns `Ok(true)` when the request was an authenticated BYE and the
/// server should halt. An envelope that cannot be decrypted leaves no AES key
/// to answer under, so the connection is dropped by propagating the error.
fn serve_client(
    mut stream: TcpStream,
    private_key: &RsaPrivateKey,
    public_pem: &[u8],
    storage: &Storage,
) -> Result<bool> {
    let envelope = net::recv_up_to(&mut stream, LEN_RKBLOCK)?;
    if envelope.len() == LEN_RKBLOCK && envelope.starts_with(REQ_KEY.as_bytes()) {
        debug!("serving a public key request");
        net::send_all(&mut stream, public_pem)?;
        return Ok(false);
    }
    if envelope.len() != LEN_RKBLOCK {
        return Err(LockerError::Protocol(format!(
            "envelope was {} bytes, expected {}",
            envelope.len(),
            LEN_RKBLOCK
        )));
    }

    let rblock = crypto::rsa_decrypt(private_key, &envelope)?;
    if rblock.len() < LEN_RBLOCK_USED {
        return Err(LockerError::Protocol(format!(
            "envelope plaintext was {} bytes, expected at least {}",
            rblock.len(),
            LEN_RBLOCK_USED
        )));
    }
    let aes = AesKey::from_bytes(&rblock[POS_AES_KEY..POS_BODY_LEN])?;
    let body_len = u32::from_le_bytes([
        rblock[POS_BODY_LEN],
        rblock[POS_BODY_LEN + 1],
        rblock[POS_BODY_LEN + 2],
        rblock[POS_BODY_LEN + 3],
    ]) as usize;
    if body_len > LEN_MAX_BODY {
        respond(&mut stream, &aes, RES_ERR_MSG_FMT.as_bytes())?;
        return Ok(false);
    }

    let ciphertext = match net::recv_exact(&mut stream, body_len) {
        Ok(ct) => ct,
        Err(_) => {
            // the socket died mid-body; report it if the reply path still works
            respond(&mut stream, &aes, RES_ERR_XMIT.as_bytes())?;
            return Ok(false);
        }
    };
    let body = match aes.decrypt(&ciphertext) {
        Ok(body) => body,
        Err(_) => {
            respond(&mut stream, &aes, RES_ERR_CRYPTO.as_bytes())?;
            return Ok(false);
        }
    };

    let cmd = match std::str::from_utf8(&rblock[..3]) {
        Ok(cmd) => cmd,
        Err(_) => {
            respond(&mut stream, &aes, RES_ERR_INV_CMD.as_bytes())?;
            return Ok(false);
        }
    };
    debug!("dispatching a {} request", cmd);
    let (reply, halt) = dispatch(cmd, &body, storage);
    respond(&mut stream, &aes, &reply)?;
    Ok(halt)
}

/// Encrypts `reply` under the request's AES key and writes it out.
fn respond(stream: &mut TcpStream, aes: &AesKey, reply: &[u8]) -> Result<()> {
    let encrypted = aes.encrypt(reply);
    net::send_all(stream, &encrypted)
}

/// Routes a decrypted body to the storage operation named by `cmd`.
/// Returns the reply bytes and whether the server should halt.
fn dispatch(cmd: &str, body: &[u8], storage: &Storage) -> (Vec<u8>, bool) {
    let mut halt = false;
    let result = match cmd {
        REQ_REG => cmd_reg(body, storage),
        REQ_BYE => {
            let result = cmd_bye(body, storage);
            halt = result.is_ok();
            result
        }
        REQ_SAV => cmd_sav(body, storage),
        REQ_SET => cmd_set(body, storage),
        REQ_GET => cmd_get(body, storage),
        REQ_ALL => cmd_all(body, storage),
        REQ_KVI => cmd_kvi(body, storage),
        REQ_KVU => cmd_kvu(body, storage),
        REQ_KVG => cmd_kvg(body, storage),
        REQ_KVD => cmd_kvd(body, storage),
        REQ_KVA => cmd_kva(body, storage),
        REQ_KVT => cmd_kvt(body, storage),
        REQ_KVF => cmd_kvf(body, storage),
        REQ_KVX => cmd_kvx(body, storage),
        _ => Err(RES_ERR_INV_CMD),
    };
    (encode_reply(result), halt)
}

/// Flattens a storage result into reply bytes: a bare response constant, or
/// `OK | u32-LE len | bytes` when the operation produced data.
fn encode_reply(result: OpResult) -> Vec<u8> {
    match result {
        Ok(OpOutcome::Ok) => RES_OK.as_bytes().to_vec(),
        Ok(OpOutcome::Inserted) => RES_OKINS.as_bytes().to_vec(),
        Ok(OpOutcome::Updated) => RES_OKUPD.as_bytes().to_vec(),
        Ok(OpOutcome::Data(bytes)) => {
            let mut out = Vec::with_capacity(2 + 4 + bytes.len());
            out.extend_from_slice(RES_OK.as_bytes());
            out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(&bytes);
            out
        }
        Err(code) => code.as_bytes().to_vec(),
    }
}

/// Splits a decrypted body into its newline-terminated text fields and
/// length-prefixed binary payloads.
struct Fields<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Fields<'a> {
    fn new(data: &'a [u8]) -> Self {
        Fields { data, pos: 0 }
    }

    /// the next text field: bytes up to a newline (consumed) or the end
    fn line(&mut self) -> Option<&'a str> {
        if self.pos >= self.data.len() {
            return None;
        }
        let rest = &self.data[self.pos..];
        let (field, consumed) = match rest.iter().position(|&b| b == b'\n') {
            Some(i) => (&rest[..i], i + 1),
            None => (rest, rest.len()),
        };
        self.pos += consumed;
        std::str::from_utf8(field).ok()
    }

    /// a length-prefixed binary payload: u32-LE length, then that many bytes
    fn blob(&mut self) -> Option<&'a [u8]> {
        let rest = &self.data[self.pos..];
        if rest.len() < 4 {
            return None;
        }
        let len = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        if rest.len() < 4 + len {
            return None;
        }
        self.pos += 4 + len;
        Some(&rest[4..4 + len])
    }
}

fn cmd_reg(body: &[u8], storage: &Storage) -> OpResult {
    let mut fields = Fields::new(body);
    let user = fields.line().ok_or(RES_ERR_MSG_FMT)?;
    let pass = fields.line().ok_or(RES_ERR_MSG_FMT)?;
    storage.add_user(user, pass)
}

fn cmd_bye(body: &[u8], storage: &Storage) -> OpResult {
    let mut fields = Fields::new(body);
    let user = fields.line().ok_or(RES_ERR_MSG_FMT)?;
    let pass = fields.line().ok_or(RES_ERR_MSG_FMT)?;
    if storage.auth(user, pass) {
        info!("authenticated BYE from {}, shutting down", user);
        Ok(OpOutcome::Ok)
    } else {
        Err(RES_ERR_LOGIN)
    }
}

fn cmd_sav(body: &[u8], storage: &Storage) -> OpResult {
    let mut fields = Fields::new(body);
    let user = fields.line().ok_or(RES_ERR_MSG_FMT)?;
    let pass = fields.line().ok_or(RES_ERR_MSG_FMT)?;
    storage.save(user, pass)
}

fn cmd_set(body: &[u8], storage: &Storage) -> OpResult {
    let mut fields = Fields::new(body);
    let user = fields.line().ok_or(RES_ERR_MSG_FMT)?;
    let pass = fields.line().ok_or(RES_ERR_MSG_FMT)?;
    let content = fields.blob().ok_or(RES_ERR_MSG_FMT)?;
    storage.set_user_data(user, pass, content.to_vec())
}

fn cmd_get(body: &[u8], storage: &Storage) -> OpResult {
    let mut fields = Fields::new(body);
    let user = fields.line().ok_or(RES_ERR_MSG_FMT)?;
    let pass = fields.line().ok_or(RES_ERR_MSG_FMT)?;
    let who = fields.line().ok_or(RES_ERR_MSG_FMT)?;
    storage.get_user_data(user, pass, who)
}

fn cmd_all(body: &[u8], storage: &Storage) -> OpResult {
    let mut fields = Fields::new(body);
    let user = fields.line().ok_or(RES_ERR_MSG_FMT)?;
    let pass = fields.line().ok_or(RES_ERR_MSG_FMT)?;
    storage.get_all_users(user, pass)
}

fn cmd_kvi(body: &[u8], storage: &Storage) -> OpResult {
    let mut fields = Fields::new(body);
    let user = fields.line().ok_or(RES_ERR_MSG_FMT)?;
    let pass = fields.line().ok_or(RES_ERR_MSG_FMT)?;
    let key = fields.blob().ok_or(RES_ERR_MSG_FMT)?;
    let val = fields.blob().ok_or(RES_ERR_MSG_FMT)?;
    let key = std::str::from_utf8(key).map_err(|_| RES_ERR_MSG_FMT)?;
    storage.kv_insert(user, pass, key, val.to_vec())
}

fn cmd_kvu(body: &[u8], storage: &Storage) -> OpResult {
    let mut fields = Fields::new(body);
    let user = fields.line().ok_or(RES_ERR_MSG_FMT)?;
    let pass = fields.line().ok_or(RES_ERR_MSG_FMT)?;
    let key = fields.blob().ok_or(RES_ERR_MSG_FMT)?;
    let val = fields.blob().ok_or(RES_ERR_MSG_FMT)?;
    let key = std::str::from_utf8(key).map_err(|_| RES_ERR_MSG_FMT)?;
    storage.kv_upsert(user, pass, key, val.to_vec())
}

fn cmd_kvg(body: &[u8], storage: &Storage) -> OpResult {
    let mut fields = Fields::new(body);
    let user = fields.line().ok_or(RES_ERR_MSG_FMT)?;
    let pass = fields.line().ok_or(RES_ERR_MSG_FMT)?;
    let key = fields.line().ok_or(RES_ERR_MSG_FMT)?;
    storage.kv_get(user, pass, key)
}

fn cmd_kvd(body: &[u8], storage: &Storage) -> OpResult {
    let mut fields = Fields::new(body);
    let user = fields.line().ok_or(RES_ERR_MSG_FMT)?;
    let pass = fields.line().ok_or(RES_ERR_MSG_FMT)?;
    let key = fields.line().ok_or(RES_ERR_MSG_FMT)?;
    storage.kv_delete(user, pass, key)
}

fn cmd_kva(body: &[u8], storage: &Storage) -> OpResult {
    let mut fields = Fields::new(body);
    let user = fields.line().ok_or(RES_ERR_MSG_FMT)?;
    let pass = fields.line().ok_or(RES_ERR_MSG_FMT)?;
    storage.kv_all(user, pass)
}

fn cmd_kvt(body: &[u8], storage: &Storage) -> OpResult {
    let mut fields = Fields::new(body);
    let user = fields.line().ok_or(RES_ERR_MSG_FMT)?;
    let pass = fields.line().ok_or(RES_ERR_MSG_FMT)?;
    storage.kv_top(user, pass)
}

fn cmd_kvf(body: &[u8], storage: &Storage) -> OpResult {
    let mut fields = Fields::new(body);
    let user = fields.line().ok_or(RES_ERR_MSG_FMT)?;
    let pass = fields.line().ok_or(RES_ERR_MSG_FMT)?;
    let name = fields.line().ok_or(RES_ERR_MSG_FMT)?;
    let blob = fields.blob().ok_or(RES_ERR_MSG_FMT)?;
    storage.register_fn(user, pass, name, blob.to_vec())
}

fn cmd_kvx(body: &[u8], storage: &Storage) -> OpResult {
    let mut fields = Fields::new(body);
    let user = fields.line().ok_or(RES_ERR_MSG_FMT)?;
    let pass = fields.line().ok_or(RES_ERR_MSG_FMT)?;
    let name = fields.line().ok_or(RES_ERR_MSG_FMT)?;
    storage.invoke_fn(user, pass, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_split_text_and_blobs() {
        let mut body = b"alice\npw\n".to_vec();
        body.extend_from_slice(&3u32.to_le_bytes());
        body.extend_from_slice(b"key");
        body.extend_from_slice(&2u32.to_le_bytes());
        body.extend_from_slice(&[0xff, 0x00]);
        let mut fields = Fields::new(&body);
        assert_eq!(fields.line(), Some("alice"));
        assert_eq!(fields.line(), Some("pw"));
        assert_eq!(fields.blob(), Some(&b"key"[..]));
        assert_eq!(fields.blob(), Some(&[0xff, 0x00][..]));
        assert_eq!(fields.blob(), None);
    }

    #[test]
    fn last_line_may_omit_the_newline() {
        let mut fields = Fields::new(b"alice\npw");
        assert_eq!(fields.line(), Some("alice"));
        assert_eq!(fields.line(), Some("pw"));
        assert_eq!(fields.line(), None);
    }

    #[test]
    fn truncated_blob_is_rejected() {
        let mut body = Vec::new();
        body.extend_from_slice(&10u32.to_le_bytes());
        body.extend_from_slice(b"short");
        let mut fields = Fields::new(&body);
        assert_eq!(fields.blob(), None);
    }

    #[test]
    fn data_reply_carries_a_length_prefix() {
        let reply = encode_reply(Ok(OpOutcome::Data(b"hello".to_vec())));
        assert_eq!(&reply[..2], b"OK");
        assert_eq!(u32::from_le_bytes([reply[2], reply[3], reply[4], reply[5]]), 5);
        assert_eq!(&reply[6..], b"hello");
    }

    #[test]
    fn error_reply_is_the_bare_constant() {
        assert_eq!(encode_reply(Err(RES_ERR_QUOTA)), RES_ERR_QUOTA.as_bytes());
    }
}
