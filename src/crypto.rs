//! The cryptographic primitives behind the wire protocol: the server's RSA
//! keypair (generated on first start, persisted as PKCS#1 PEM), RSA-OAEP for
//! the request envelope, AES-256-CBC for request and response bodies, and the
//! SHA-256 password digest held in the auth table.

use std::fs;
use std::path::{Path, PathBuf};

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use rsa::pkcs1::{
    DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey, EncodeRsaPublicKey, LineEnding,
};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::protocol::{LEN_AES_IV, LEN_AES_KEY, RSA_BITS};
use crate::{LockerError, Result};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// number of bytes in a password digest
pub const LEN_PASS_HASH: usize = 32;

/// A per-request AES-256-CBC key and IV, generated by the client and carried
/// to the server inside the RSA envelope.
#[derive(Clone)]
pub struct AesKey {
    key: [u8; LEN_AES_KEY],
    iv: [u8; LEN_AES_IV],
}

impl AesKey {
    /// creates a fresh random key and IV
    pub fn generate() -> AesKey {
        let mut key = [0u8; LEN_AES_KEY];
        let mut iv = [0u8; LEN_AES_IV];
        rand::thread_rng().fill_bytes(&mut key);
        rand::thread_rng().fill_bytes(&mut iv);
        AesKey { key, iv }
    }

    /// reconstructs a key from the 48 bytes of key material in an envelope
    ///
    /// # Errors
    /// returns [`LockerError::Crypto`] if `raw` is not exactly key-plus-IV sized
    pub fn from_bytes(raw: &[u8]) -> Result<AesKey> {
        if raw.len() != LEN_AES_KEY + LEN_AES_IV {
            return Err(LockerError::Crypto(format!(
                "expected {} bytes of AES key material, got {}",
                LEN_AES_KEY + LEN_AES_IV,
                raw.len()
            )));
        }
        let mut key = [0u8; LEN_AES_KEY];
        let mut iv = [0u8; LEN_AES_IV];
        key.copy_from_slice(&raw[..LEN_AES_KEY]);
        iv.copy_from_slice(&raw[LEN_AES_KEY..]);
        Ok(AesKey { key, iv })
    }

    /// the 48 bytes of key material to place in an envelope
    pub fn to_bytes(&self) -> [u8; LEN_AES_KEY + LEN_AES_IV] {
        let mut out = [0u8; LEN_AES_KEY + LEN_AES_IV];
        out[..LEN_AES_KEY].copy_from_slice(&self.key);
        out[LEN_AES_KEY..].copy_from_slice(&self.iv);
        out
    }

    /// encrypts `plaintext` with a fresh cipher context, PKCS7 padded
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        Aes256CbcEnc::new(&self.key.into(), &self.iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext)
    }

    /// decrypts `ciphertext` with a fresh cipher context
    ///
    /// # Errors
    /// returns [`LockerError::Crypto`] if the ciphertext or its padding is invalid
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        Aes256CbcDec::new(&self.key.into(), &self.iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|e| LockerError::Crypto(format!("AES decryption failed: {}", e)))
    }
}

/// Computes the SHA-256 digest of a password. This is the only form in which
/// a password is ever stored or compared.
pub fn hash_password(pass: &str) -> [u8; LEN_PASS_HASH] {
    let mut hasher = Sha256::new();
    hasher.update(pass.as_bytes());
    hasher.finalize().into()
}

/// RSA-OAEP encrypt `plaintext` under `key`. The plaintext must not exceed
/// [`crate::protocol::LEN_RBLOCK_CONTENT`] bytes.
pub fn rsa_encrypt(key: &RsaPublicKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let enc = key.encrypt(&mut rand::thread_rng(), Oaep::new::<Sha256>(), plaintext)?;
    Ok(enc)
}

/// RSA-OAEP decrypt `ciphertext` under `key`.
pub fn rsa_decrypt(key: &RsaPrivateKey, ciphertext: &[u8]) -> Result<Vec<u8>> {
    let dec = key.decrypt(Oaep::new::<Sha256>(), ciphertext)?;
    Ok(dec)
}

/// Parses a PEM-encoded public key, as served in response to a KEY request.
pub fn public_key_from_pem(pem: &[u8]) -> Result<RsaPublicKey> {
    let text = std::str::from_utf8(pem)
        .map_err(|_| LockerError::Crypto("public key PEM is not valid UTF-8".into()))?;
    let key = RsaPublicKey::from_pkcs1_pem(text)?;
    Ok(key)
}

/// path of the public half of the keypair stored under `basename`
pub fn public_key_path(basename: &str) -> PathBuf {
    PathBuf::from(format!("{}.pub", basename))
}

/// path of the private half of the keypair stored under `basename`
pub fn private_key_path(basename: &str) -> PathBuf {
    PathBuf::from(format!("{}.pri", basename))
}

/// Loads the server keypair stored as `<basename>.pub` / `<basename>.pri`,
/// generating and persisting a fresh pair if neither file exists.
///
/// # Errors
/// returns [`LockerError::StringErr`] if exactly one of the two files exists:
/// a half-present keypair is unrecoverable and the server must not start
pub fn init_keypair(basename: &str) -> Result<RsaPrivateKey> {
    let pub_path = public_key_path(basename);
    let pri_path = private_key_path(basename);
    match (pub_path.exists(), pri_path.exists()) {
        (true, true) => load_private_key(&pri_path),
        (false, false) => generate_keypair(&pub_path, &pri_path),
        _ => Err(LockerError::StringErr(format!(
            "found exactly one of {} and {}; refusing to start with half a keypair",
            pub_path.display(),
            pri_path.display()
        ))),
    }
}

/// Reads the raw bytes of the PEM public key file, for serving to clients.
pub fn load_public_pem(basename: &str) -> Result<Vec<u8>> {
    let bytes = fs::read(public_key_path(basename))?;
    Ok(bytes)
}

fn load_private_key(path: &Path) -> Result<RsaPrivateKey> {
    let pem = fs::read_to_string(path)?;
    let key = RsaPrivateKey::from_pkcs1_pem(&pem)?;
    Ok(key)
}

fn generate_keypair(pub_path: &Path, pri_path: &Path) -> Result<RsaPrivateKey> {
    info!(
        "generating a {}-bit RSA keypair as ({}, {})",
        RSA_BITS,
        pub_path.display(),
        pri_path.display()
    );
    let pri = RsaPrivateKey::new(&mut rand::thread_rng(), RSA_BITS)?;
    let pub_pem = RsaPublicKey::from(&pri).to_pkcs1_pem(LineEnding::LF)?;
    let pri_pem = pri.to_pkcs1_pem(LineEnding::LF)?;
    fs::write(pub_path, pub_pem.as_bytes())?;
    fs::write(pri_path, pri_pem.as_bytes())?;
    Ok(pri)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::LEN_RBLOCK_CONTENT;

    #[test]
    fn aes_round_trip() {
        let key = AesKey::generate();
        let msg = b"the quick brown fox".to_vec();
        let ct = key.encrypt(&msg);
        assert_ne!(ct, msg);
        assert_eq!(key.decrypt(&ct).unwrap(), msg);
    }

    #[test]
    fn aes_rejects_wrong_key() {
        let key = AesKey::generate();
        let other = AesKey::generate();
        let ct = key.encrypt(b"secret");
        // wrong key yields either a padding error or garbage, never the plaintext
        match other.decrypt(&ct) {
            Ok(pt) => assert_ne!(pt, b"secret"),
            Err(_) => {}
        }
    }

    #[test]
    fn aes_key_material_round_trips() {
        let key = AesKey::generate();
        let raw = key.to_bytes();
        let again = AesKey::from_bytes(&raw).unwrap();
        let ct = key.encrypt(b"payload");
        assert_eq!(again.decrypt(&ct).unwrap(), b"payload");
    }

    #[test]
    fn password_digest_is_stable() {
        assert_eq!(hash_password("hunter2"), hash_password("hunter2"));
        assert_ne!(hash_password("hunter2"), hash_password("hunter3"));
    }

    #[test]
    fn rsa_round_trip_at_envelope_size() {
        let pri = RsaPrivateKey::new(&mut rand::thread_rng(), RSA_BITS).unwrap();
        let publ = RsaPublicKey::from(&pri);
        let msg = vec![0xabu8; LEN_RBLOCK_CONTENT];
        let ct = rsa_encrypt(&publ, &msg).unwrap();
        assert_eq!(ct.len(), RSA_BITS / 8);
        assert_eq!(rsa_decrypt(&pri, &ct).unwrap(), msg);
    }

    #[test]
    fn keypair_generation_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("rsa");
        let base = base.to_str().unwrap();
        let pri = init_keypair(base).unwrap();
        // a second init must load the same key, not generate a new one
        let again = init_keypair(base).unwrap();
        assert_eq!(RsaPublicKey::from(&pri), RsaPublicKey::from(&again));
        let pem = load_public_pem(base).unwrap();
        let publ = public_key_from_pem(&pem).unwrap();
        assert_eq!(publ, RsaPublicKey::from(&pri));
    }

    #[test]
    fn half_a_keypair_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("rsa");
        let base = base.to_str().unwrap();
        init_keypair(base).unwrap();
        std::fs::remove_file(private_key_path(base)).unwrap();
        assert!(init_keypair(base).is_err());
    }
}
