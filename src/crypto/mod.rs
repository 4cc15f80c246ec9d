//! File encryption envelope
//!
//! Encrypted files carry a small header in front of the AES-256-GCM
//! ciphertext:
//!
//! ```text
//! +------+----------+-------------+---------------------+
//! | MKM1 | key kind | nonce (12B) | ciphertext + tag    |
//! +------+----------+-------------+---------------------+
//! ```
//!
//! The key kind byte is authenticated as associated data, so a file
//! sealed under a user key cannot be opened as a master-key file.

mod keys;

pub use keys::{KeyManager, KeyStore, LocalKeyManager, KEY_DIR, MASTER_KEY_FILE, USER_KEY_FILE};

use crate::error::{Error, Result};
use rand::RngCore;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};

/// Symmetric key size in bytes
pub const KEY_SIZE: usize = 32;

/// AES-GCM authentication tag size
pub const TAG_SIZE: usize = 16;

/// Envelope magic
pub const MAGIC: &[u8; 4] = b"MKM1";

/// Bytes before the ciphertext: magic, key kind, nonce
pub const HEADER_SIZE: usize = MAGIC.len() + 1 + NONCE_LEN;

/// Which key sealed an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// Legacy per-user key
    User,
    /// Fleet-wide master key
    Master,
}

impl KeyKind {
    fn to_byte(self) -> u8 {
        match self {
            KeyKind::User => 0,
            KeyKind::Master => 1,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(KeyKind::User),
            1 => Some(KeyKind::Master),
            _ => None,
        }
    }
}

/// Parsed envelope
#[derive(Debug, Clone)]
pub struct EncryptedData {
    pub kind: KeyKind,
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

impl EncryptedData {
    /// Parse an envelope from raw file bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if !is_envelope(data) {
            return Err(Error::Crypto("not an encrypted envelope".to_string()));
        }

        let kind = KeyKind::from_byte(data[MAGIC.len()])
            .ok_or_else(|| Error::Crypto(format!("unknown key kind {}", data[MAGIC.len()])))?;

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&data[MAGIC.len() + 1..HEADER_SIZE]);

        Ok(Self {
            kind,
            nonce,
            ciphertext: data[HEADER_SIZE..].to_vec(),
        })
    }

    /// Serialize to raw file bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.ciphertext.len());
        out.extend_from_slice(MAGIC);
        out.push(self.kind.to_byte());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }
}

/// Whether `data` looks like an encrypted envelope
pub fn is_envelope(data: &[u8]) -> bool {
    data.len() >= HEADER_SIZE + TAG_SIZE && data.starts_with(MAGIC)
}

/// Key kind of an envelope without decrypting it
pub fn envelope_kind(data: &[u8]) -> Option<KeyKind> {
    if is_envelope(data) {
        KeyKind::from_byte(data[MAGIC.len()])
    } else {
        None
    }
}

fn sealing_key(key: &[u8; KEY_SIZE]) -> Result<LessSafeKey> {
    let unbound = UnboundKey::new(&AES_256_GCM, key)
        .map_err(|_| Error::Crypto("invalid AES-256-GCM key".to_string()))?;
    Ok(LessSafeKey::new(unbound))
}

/// Seal `plaintext` under `key`
pub fn encrypt(key: &[u8; KEY_SIZE], kind: KeyKind, plaintext: &[u8]) -> Result<EncryptedData> {
    let sealing = sealing_key(key)?;

    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let mut in_out = plaintext.to_vec();
    let aad = [kind.to_byte()];
    sealing
        .seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce), Aad::from(&aad), &mut in_out)
        .map_err(|_| Error::Crypto("encryption failed".to_string()))?;

    Ok(EncryptedData {
        kind,
        nonce,
        ciphertext: in_out,
    })
}

/// Open an envelope with `key`
pub fn decrypt(key: &[u8; KEY_SIZE], data: &EncryptedData) -> Result<Vec<u8>> {
    let opening = sealing_key(key)?;

    let mut in_out = data.ciphertext.clone();
    let aad = [data.kind.to_byte()];
    let plaintext = opening
        .open_in_place(
            Nonce::assume_unique_for_key(data.nonce),
            Aad::from(&aad),
            &mut in_out,
        )
        .map_err(|_| Error::Crypto("authentication failed".to_string()))?;

    Ok(plaintext.to_vec())
}

/// Generate a random key
pub fn generate_key() -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let key = generate_key();
        let sealed = encrypt(&key, KeyKind::Master, b"hello master key").unwrap();
        let parsed = EncryptedData::from_bytes(&sealed.to_bytes()).unwrap();

        assert_eq!(parsed.kind, KeyKind::Master);
        assert_eq!(decrypt(&key, &parsed).unwrap(), b"hello master key");
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = encrypt(&generate_key(), KeyKind::User, b"secret").unwrap();
        assert!(decrypt(&generate_key(), &sealed).is_err());
    }

    #[test]
    fn test_key_kind_is_authenticated() {
        let key = generate_key();
        let mut sealed = encrypt(&key, KeyKind::User, b"secret").unwrap();
        sealed.kind = KeyKind::Master;
        assert!(decrypt(&key, &sealed).is_err());
    }

    #[test]
    fn test_envelope_detection() {
        let key = generate_key();
        let bytes = encrypt(&key, KeyKind::User, b"").unwrap().to_bytes();

        assert!(is_envelope(&bytes));
        assert_eq!(envelope_kind(&bytes), Some(KeyKind::User));
        assert!(!is_envelope(b"plain text file"));
        assert!(!is_envelope(b"MKM1"));
        assert!(EncryptedData::from_bytes(b"plain").is_err());
    }
}
