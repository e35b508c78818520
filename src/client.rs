//! `LockerClient` contains the functionality for communication with a
//! [`LockerServer`](crate::LockerServer). Each operation is one TCP
//! connection: the client generates a fresh AES key and IV, seals them in an
//! RSA envelope along with the command mnemonic and body length, sends the
//! AES-encrypted body, and decrypts the reply under the same key.
//!
//! A client that does not yet hold the server's public key fetches it first
//! with [`LockerClient::fetch_key`].

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};

use rand::RngCore;
use rsa::RsaPublicKey;
use tracing::debug;

use crate::crypto::{self, AesKey};
use crate::net;
use crate::protocol::*;
use crate::{LockerError, Result};

/// A reply from the server, decrypted and classified.
#[derive(Debug, PartialEq)]
pub enum ServerReply {
    /// plain success
    Ok,
    /// upsert success, insert branch
    Inserted,
    /// upsert success, update branch
    Updated,
    /// success carrying bytes
    Data(Vec<u8>),
}

/// A client for one locker server, holding its address and public key.
pub struct LockerClient {
    addr: SocketAddr,
    public_key: RsaPublicKey,
}

impl LockerClient {
    /// Fetches the server's PEM-encoded public key: send a `KEY` packet
    /// padded to a full envelope, read the raw PEM bytes until the server
    /// closes the connection.
    pub fn fetch_key<A: ToSocketAddrs>(addr: A) -> Result<Vec<u8>> {
        let mut stream = TcpStream::connect(addr)?;
        let mut kblock = vec![0u8; LEN_RKBLOCK];
        kblock[..3].copy_from_slice(REQ_KEY.as_bytes());
        net::send_all(&mut stream, &kblock)?;
        let pem = net::recv_to_eof(&mut stream)?;
        if pem.is_empty() {
            return Err(LockerError::Protocol("server sent no public key".into()));
        }
        Ok(pem)
    }

    /// Creates a client from the server's address and PEM public key bytes.
    pub fn new<A: ToSocketAddrs>(addr: A, pem: &[u8]) -> Result<LockerClient> {
        let addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| LockerError::Parsing("address resolved to nothing".into()))?;
        Ok(LockerClient {
            addr,
            public_key: crypto::public_key_from_pem(pem)?,
        })
    }

    /// REG: create a new user.
    pub fn register(&self, user: &str, pass: &str) -> Result<()> {
        expect_ok(self.send_cmd(REQ_REG, creds(user, pass))?)
    }

    /// BYE: ask the server to shut down.
    pub fn bye(&self, user: &str, pass: &str) -> Result<()> {
        expect_ok(self.send_cmd(REQ_BYE, creds(user, pass))?)
    }

    /// SAV: ask the server to write a full snapshot (admin only).
    pub fn save(&self, user: &str, pass: &str) -> Result<()> {
        expect_ok(self.send_cmd(REQ_SAV, creds(user, pass))?)
    }

    /// SET: replace the requesting user's content.
    pub fn set_content(&self, user: &str, pass: &str, content: &[u8]) -> Result<()> {
        let mut body = creds(user, pass);
        body.push(b'\n');
        push_blob(&mut body, content);
        expect_ok(self.send_cmd(REQ_SET, body)?)
    }

    /// GET: fetch `who`'s content.
    pub fn get_content(&self, user: &str, pass: &str, who: &str) -> Result<Vec<u8>> {
        let mut body = creds(user, pass);
        body.push(b'\n');
        body.extend_from_slice(who.as_bytes());
        expect_data(self.send_cmd(REQ_GET, body)?)
    }

    /// ALL: list every username.
    pub fn all_users(&self, user: &str, pass: &str) -> Result<Vec<String>> {
        let data = expect_data(self.send_cmd(REQ_ALL, creds(user, pass))?)?;
        Ok(lines(&data)?)
    }

    /// KVI: insert a new key/value pair.
    pub fn kv_insert(&self, user: &str, pass: &str, key: &str, value: &[u8]) -> Result<()> {
        expect_ok(self.send_cmd(REQ_KVI, kv_body(user, pass, key, value))?)
    }

    /// KVU: insert or update a pair. Returns true if the pair was inserted,
    /// false if an existing value was updated.
    pub fn kv_upsert(&self, user: &str, pass: &str, key: &str, value: &[u8]) -> Result<bool> {
        match self.send_cmd(REQ_KVU, kv_body(user, pass, key, value))? {
            ServerReply::Inserted => Ok(true),
            ServerReply::Updated => Ok(false),
            other => Err(unexpected(other)),
        }
    }

    /// KVG: fetch the value mapped to `key`.
    pub fn kv_get(&self, user: &str, pass: &str, key: &str) -> Result<Vec<u8>> {
        let mut body = creds(user, pass);
        body.push(b'\n');
        body.extend_from_slice(key.as_bytes());
        expect_data(self.send_cmd(REQ_KVG, body)?)
    }

    /// KVD: delete a pair.
    pub fn kv_delete(&self, user: &str, pass: &str, key: &str) -> Result<()> {
        let mut body = creds(user, pass);
        body.push(b'\n');
        body.extend_from_slice(key.as_bytes());
        expect_ok(self.send_cmd(REQ_KVD, body)?)
    }

    /// KVA: list every key.
    pub fn kv_all(&self, user: &str, pass: &str) -> Result<Vec<String>> {
        let data = expect_data(self.send_cmd(REQ_KVA, creds(user, pass))?)?;
        Ok(lines(&data)?)
    }

    /// KVT: list the most recently used keys, newest first.
    pub fn kv_top(&self, user: &str, pass: &str) -> Result<Vec<String>> {
        let data = expect_data(self.send_cmd(REQ_KVT, creds(user, pass))?)?;
        Ok(lines(&data)?)
    }

    /// KVF: register a map/reduce function blob (admin only).
    pub fn register_fn(&self, user: &str, pass: &str, name: &str, blob: &[u8]) -> Result<()> {
        let mut body = creds(user, pass);
        body.push(b'\n');
        body.extend_from_slice(name.as_bytes());
        body.push(b'\n');
        push_blob(&mut body, blob);
        expect_ok(self.send_cmd(REQ_KVF, body)?)
    }

    /// KVX: run a registered function over the whole store.
    pub fn invoke_fn(&self, user: &str, pass: &str, name: &str) -> Result<Vec<u8>> {
        let mut body = creds(user, pass);
        body.push(b'\n');
        body.extend_from_slice(name.as_bytes());
        expect_data(self.send_cmd(REQ_KVX, body)?)
    }

    /// Sends one command as an `rblock + ablock` message and decrypts the
    /// reply:
    ///   - rblock: RSA( cmd | aes key material | u32-LE body length | padding )
    ///   - ablock: AES( body )
    fn send_cmd(&self, cmd: &str, body: Vec<u8>) -> Result<ServerReply> {
        let aes = AesKey::generate();
        let ablock = aes.encrypt(&body);

        let mut rblock = Vec::with_capacity(LEN_RBLOCK_CONTENT);
        rblock.extend_from_slice(cmd.as_bytes());
        rblock.extend_from_slice(&aes.to_bytes());
        rblock.extend_from_slice(&(ablock.len() as u32).to_le_bytes());
        let mut padding = vec![0u8; LEN_RBLOCK_CONTENT - rblock.len()];
        rand::thread_rng().fill_bytes(&mut padding);
        rblock.extend_from_slice(&padding);
        let enc_rblock = crypto::rsa_encrypt(&self.public_key, &rblock)?;

        let mut stream = TcpStream::connect(self.addr)?;
        net::send_all(&mut stream, &enc_rblock)?;
        net::send_all(&mut stream, &ablock)?;
        debug!("sent a {} request with a {} byte body", cmd, ablock.len());

        let response = net::recv_to_eof(&mut stream)?;
        if response.is_empty() {
            return Err(LockerError::Server(RES_ERR_XMIT.to_string()));
        }
        let plain = aes.decrypt(&response)?;
        parse_reply(&plain)
    }
}

fn creds(user: &str, pass: &str) -> Vec<u8> {
    format!("{}\n{}", user, pass).into_bytes()
}

fn kv_body(user: &str, pass: &str, key: &str, value: &[u8]) -> Vec<u8> {
    let mut body = creds(user, pass);
    body.push(b'\n');
    push_blob(&mut body, key.as_bytes());
    push_blob(&mut body, value);
    body
}

fn push_blob(body: &mut Vec<u8>, bytes: &[u8]) {
    body.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    body.extend_from_slice(bytes);
}

fn lines(data: &[u8]) -> Result<Vec<String>> {
    let text = String::from_utf8(data.to_vec())?;
    Ok(text.lines().map(String::from).collect())
}

fn parse_reply(plain: &[u8]) -> Result<ServerReply> {
    if plain == RES_OK.as_bytes() {
        return Ok(ServerReply::Ok);
    }
    if plain == RES_OKINS.as_bytes() {
        return Ok(ServerReply::Inserted);
    }
    if plain == RES_OKUPD.as_bytes() {
        return Ok(ServerReply::Updated);
    }
    if plain.starts_with(RES_OK.as_bytes()) && plain.len() >= 6 {
        let len = u32::from_le_bytes([plain[2], plain[3], plain[4], plain[5]]) as usize;
        if plain.len() == 6 + len {
            return Ok(ServerReply::Data(plain[6..].to_vec()));
        }
    }
    Err(LockerError::Server(
        String::from_utf8_lossy(plain).into_owned(),
    ))
}

fn expect_ok(reply: ServerReply) -> Result<()> {
    match reply {
        ServerReply::Ok => Ok(()),
        other => Err(unexpected(other)),
    }
}

fn expect_data(reply: ServerReply) -> Result<Vec<u8>> {
    match reply {
        ServerReply::Data(data) => Ok(data),
        other => Err(unexpected(other)),
    }
}

fn unexpected(reply: ServerReply) -> LockerError {
    LockerError::Server(format!("unexpected reply: {:?}", reply))
}
