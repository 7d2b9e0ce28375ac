//! Display-name privacy codec.
//!
//! Display names are never stored in the clear. When a 32-byte symmetric key
//! is configured, names are encrypted with AES-256-GCM (random nonce, output
//! `enc:<base64(nonce || ciphertext)>`). When the key is absent or invalid,
//! the codec falls back to a keyed SHA-256 digest (`hsh:<hex>`): names stay
//! pseudonymous and stable for grouping, but cannot be recovered.

use aes_gcm::aead::{Aead, AeadCore, OsRng};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Prefix for encrypted names.
const ENC_PREFIX: &str = "enc:";
/// Prefix for keyed-hash names.
const HASH_PREFIX: &str = "hsh:";
/// AES-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;

enum Codec {
    /// AES-256-GCM with the configured key.
    Encrypting(Box<Aes256Gcm>),
    /// Keyed SHA-256 fallback.
    Hashing([u8; 32]),
}

/// Encodes display names for storage.
pub struct NameCodec {
    codec: Codec,
}

impl NameCodec {
    /// Build a codec from an optional base64-encoded 32-byte key.
    ///
    /// A missing or malformed key falls back to the keyed hash; the key
    /// material (or a fixed salt when absent) still keys the hash so digests
    /// are not trivially precomputable.
    pub fn from_key(key_b64: Option<&str>) -> Self {
        match key_b64 {
            Some(s) => match BASE64.decode(s) {
                Ok(bytes) if bytes.len() == 32 => {
                    let key = Key::<Aes256Gcm>::from_slice(&bytes);
                    Self {
                        codec: Codec::Encrypting(Box::new(Aes256Gcm::new(key))),
                    }
                }
                _ => {
                    tracing::warn!("display-name key is not valid base64(32 bytes), falling back to keyed hash");
                    Self {
                        codec: Codec::Hashing(Self::hash_key(s.as_bytes())),
                    }
                }
            },
            None => Self {
                codec: Codec::Hashing(Self::hash_key(b"chronicle-name-hash")),
            },
        }
    }

    fn hash_key(material: &[u8]) -> [u8; 32] {
        let mut h = Sha256::new();
        h.update(material);
        h.finalize().into()
    }

    /// Whether names can be recovered with [`NameCodec::decode`].
    pub fn is_reversible(&self) -> bool {
        matches!(self.codec, Codec::Encrypting(_))
    }

    /// Encode a display name for storage.
    pub fn encode(&self, name: &str) -> String {
        match &self.codec {
            Codec::Encrypting(cipher) => {
                let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
                match cipher.encrypt(&nonce, name.as_bytes()) {
                    Ok(ciphertext) => {
                        let mut buf = Vec::with_capacity(NONCE_LEN + ciphertext.len());
                        buf.extend_from_slice(&nonce);
                        buf.extend_from_slice(&ciphertext);
                        format!("{ENC_PREFIX}{}", BASE64.encode(buf))
                    }
                    Err(e) => {
                        // Encryption only fails on internal errors; never store
                        // the plain name.
                        tracing::error!("display-name encryption failed: {}", e);
                        format!("{HASH_PREFIX}{}", hex_digest(&Self::hash_key(b""), name))
                    }
                }
            }
            Codec::Hashing(key) => format!("{HASH_PREFIX}{}", hex_digest(key, name)),
        }
    }

    /// Recover a display name from an `enc:` value.
    ///
    /// Returns an error for hash-encoded values or if decryption fails (wrong
    /// key, truncated value).
    pub fn decode(&self, stored: &str) -> Result<String> {
        let cipher = match &self.codec {
            Codec::Encrypting(c) => c,
            Codec::Hashing(_) => {
                return Err(Error::Privacy("codec is hash-only, names are not recoverable".to_string()));
            }
        };

        let encoded = stored
            .strip_prefix(ENC_PREFIX)
            .ok_or_else(|| Error::Privacy(format!("not an encrypted value: {stored:.8}")))?;

        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| Error::Privacy(format!("invalid base64: {e}")))?;

        if bytes.len() <= NONCE_LEN {
            return Err(Error::Privacy("value too short".to_string()));
        }

        let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
        let plain = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| Error::Privacy(format!("decryption failed: {e}")))?;

        String::from_utf8(plain).map_err(|e| Error::Privacy(format!("invalid UTF-8: {e}")))
    }
}

fn hex_digest(key: &[u8; 32], name: &str) -> String {
    let mut h = Sha256::new();
    h.update(key);
    h.update(name.as_bytes());
    let digest = h.finalize();
    let mut out = String::with_capacity(64);
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    out
}
