//! The wire constants shared by the server and the client: command mnemonics,
//! response strings, field length limits, and the geometry of the RSA-encrypted
//! request envelope.
//!
//! A request is one TCP connection carrying two blocks:
//!
//! ```text
//! rblock: RSA-OAEP( cmd[3] | aes_key[32] | aes_iv[16] | u32-LE body_len | random padding )
//! ablock: AES-256-CBC( command body )
//! ```
//!
//! The `rblock` plaintext is always exactly [`LEN_RBLOCK_CONTENT`] bytes, so its
//! ciphertext is always exactly [`LEN_RKBLOCK`] bytes. Text fields in a body are
//! newline-terminated; binary payloads are prefixed by a raw u32-LE length with
//! no separator.

/// request the server's public key; sent as the first 3 bytes of an otherwise
/// unencrypted, zero-padded rblock
pub const REQ_KEY: &str = "KEY";

/// register a new user
pub const REQ_REG: &str = "REG";

/// authenticated server shutdown
pub const REQ_BYE: &str = "BYE";

/// write a full snapshot of the data file (admin only)
pub const REQ_SAV: &str = "SAV";

/// replace the requesting user's content
pub const REQ_SET: &str = "SET";

/// fetch some user's content
pub const REQ_GET: &str = "GET";

/// list all usernames
pub const REQ_ALL: &str = "ALL";

/// insert a key/value pair
pub const REQ_KVI: &str = "KVI";

/// insert or update a key/value pair
pub const REQ_KVU: &str = "KVU";

/// fetch the value mapped to a key
pub const REQ_KVG: &str = "KVG";

/// delete a key/value pair
pub const REQ_KVD: &str = "KVD";

/// list all keys
pub const REQ_KVA: &str = "KVA";

/// list the most recently used keys
pub const REQ_KVT: &str = "KVT";

/// register a named map/reduce function (admin only)
pub const REQ_KVF: &str = "KVF";

/// execute a registered map/reduce function over the whole store
pub const REQ_KVX: &str = "KVX";

/// generic success
pub const RES_OK: &str = "OK";

/// upsert succeeded by inserting a new pair
pub const RES_OKINS: &str = "OKINS";

/// upsert succeeded by updating an existing pair
pub const RES_OKUPD: &str = "OKUPD";

/// registration failed because the username is taken
pub const RES_ERR_USER_EXISTS: &str = "ERR_USER_EXISTS";

/// the named user does not exist
pub const RES_ERR_NO_USER: &str = "ERR_NO_USER";

/// unknown user or wrong password
pub const RES_ERR_LOGIN: &str = "ERR_LOGIN";

/// the fetched content or value has no bytes
pub const RES_ERR_NO_DATA: &str = "ERR_NO_DATA";

/// the key is absent (get/delete) or already present (insert)
pub const RES_ERR_KEY: &str = "ERR_KEY";

/// a length bound was violated or the body was malformed
pub const RES_ERR_MSG_FMT: &str = "ERR_MSG_FMT";

/// an AES or RSA operation failed
pub const RES_ERR_CRYPTO: &str = "ERR_CRYPTO";

/// a socket error during send or receive
pub const RES_ERR_XMIT: &str = "ERR_XMIT";

/// the command mnemonic is not recognized
pub const RES_ERR_INV_CMD: &str = "ERR_INV_CMD";

/// one of the user's quotas would be exceeded
pub const RES_ERR_QUOTA: &str = "ERR_QUOTA";

/// map/reduce function registration or execution failed
pub const RES_ERR_SO: &str = "ERR_SO";

/// maximum length of a username, in bytes
pub const LEN_UNAME: usize = 64;

/// maximum length of a password, in bytes
pub const LEN_PASS: usize = 128;

/// maximum length of a user's content, in bytes
pub const LEN_CONTENT: usize = 1024 * 1024;

/// maximum length of a key, in bytes
pub const LEN_KEY: usize = 1024;

/// maximum length of a value, in bytes
pub const LEN_VAL: usize = 1024 * 1024;

/// maximum length of a registered map/reduce function blob, in bytes
pub const LEN_FUNC: usize = 4 * 1024 * 1024;

/// hard cap on the encrypted body length announced by an envelope; anything
/// larger is rejected before the body is read
pub const LEN_MAX_BODY: usize = LEN_FUNC + 4096;

/// number of bits in the server's RSA modulus
pub const RSA_BITS: usize = 2048;

/// size of an RSA-encrypted rblock: the modulus size in bytes
pub const LEN_RKBLOCK: usize = RSA_BITS / 8;

/// size of the rblock plaintext: the modulus size minus the OAEP-SHA256
/// overhead of two digests plus two bytes
pub const LEN_RBLOCK_CONTENT: usize = LEN_RKBLOCK - 2 * 32 - 2;

/// size of an AES-256 key, in bytes
pub const LEN_AES_KEY: usize = 32;

/// size of an AES-CBC initialization vector, in bytes
pub const LEN_AES_IV: usize = 16;

/// byte offset of the AES key material within the rblock plaintext
pub const POS_AES_KEY: usize = 3;

/// byte offset of the u32-LE body length within the rblock plaintext
pub const POS_BODY_LEN: usize = POS_AES_KEY + LEN_AES_KEY + LEN_AES_IV;

/// bytes of an rblock plaintext that carry meaning; the rest is random padding
pub const LEN_RBLOCK_USED: usize = POS_BODY_LEN + 4;
