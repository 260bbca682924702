use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{AeadInPlace, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::Serialize;
use zeroize::Zeroizing;

use crate::db::models::EncryptedState;
use crate::error::AppError;

pub const ALGORITHM: &str = "aes-256-gcm";

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Error type for crypto operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    Encrypt(String),
    #[error("Decryption failed: {0}")]
    Decrypt(String),
    #[error("Key management error: {0}")]
    KeyManagement(String),
    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("State encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<CryptoError> for AppError {
    fn from(e: CryptoError) -> Self {
        AppError::Internal(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Key schemes
// ---------------------------------------------------------------------------

/// Which root key sealed a record. Persisted next to every ciphertext.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEncoding {
    /// Legacy: a 32-character hex string whose UTF-8 bytes are the key.
    Utf8,
    /// Current: a base64-encoded 32-byte root key.
    Base64,
}

impl KeyEncoding {
    pub fn as_str(self) -> &'static str {
        match self {
            KeyEncoding::Utf8 => "utf8",
            KeyEncoding::Base64 => "base64",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CryptoError> {
        match s {
            "utf8" => Ok(KeyEncoding::Utf8),
            "base64" => Ok(KeyEncoding::Base64),
            other => Err(CryptoError::KeyManagement(format!(
                "Unknown key encoding '{other}'"
            ))),
        }
    }
}

/// Ciphertext, nonce and detached tag, each base64.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub ciphertext: String,
    pub iv: String,
    pub tag: String,
}

// ---------------------------------------------------------------------------
// Core Encryption / Decryption
// ---------------------------------------------------------------------------

/// Encrypt under an explicit 32-byte key with a fresh random nonce.
pub fn encrypt_with_key(plaintext: &[u8], key: &[u8; 32]) -> Result<Sealed, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(nonce, b"", &mut buffer)
        .map_err(|e| CryptoError::Encrypt(e.to_string()))?;

    Ok(Sealed {
        ciphertext: B64.encode(&buffer),
        iv: B64.encode(nonce_bytes),
        tag: B64.encode(tag),
    })
}

pub fn decrypt_with_key(sealed: &Sealed, key: &[u8; 32]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

    let mut buffer = B64.decode(&sealed.ciphertext)?;
    let nonce_bytes = B64.decode(&sealed.iv)?;
    let tag_bytes = B64.decode(&sealed.tag)?;

    if nonce_bytes.len() != NONCE_LEN {
        return Err(CryptoError::Decrypt(format!(
            "Invalid nonce length: {} (expected {NONCE_LEN})",
            nonce_bytes.len()
        )));
    }
    if tag_bytes.len() != TAG_LEN {
        return Err(CryptoError::Decrypt(format!(
            "Invalid tag length: {} (expected {TAG_LEN})",
            tag_bytes.len()
        )));
    }

    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(&nonce_bytes),
            b"",
            &mut buffer,
            GenericArray::from_slice(&tag_bytes),
        )
        .map_err(|e| CryptoError::Decrypt(e.to_string()))?;
    Ok(buffer)
}

// ---------------------------------------------------------------------------
// State codec
// ---------------------------------------------------------------------------

/// Seals rotation state and workspace keys under one of two root keys.
///
/// Records remember the scheme that sealed them, so both keys stay readable
/// while new writes move to the preferred one.
pub struct StateCodec {
    root: Option<Zeroizing<[u8; 32]>>,
    legacy: Option<Zeroizing<[u8; 32]>>,
}

impl std::fmt::Debug for StateCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateCodec")
            .field("root", &self.root.is_some())
            .field("legacy", &self.legacy.is_some())
            .finish()
    }
}

impl StateCodec {
    pub fn new(root_b64: Option<&str>, legacy_hex: Option<&str>) -> Result<Self, CryptoError> {
        let root = root_b64.map(parse_root_key).transpose()?;
        let legacy = legacy_hex.map(parse_legacy_key).transpose()?;
        if root.is_none() && legacy.is_none() {
            return Err(CryptoError::KeyManagement(
                "No encryption key configured".into(),
            ));
        }
        Ok(Self { root, legacy })
    }

    /// Scheme used for new writes: the root key when configured.
    pub fn preferred(&self) -> KeyEncoding {
        if self.root.is_some() {
            KeyEncoding::Base64
        } else {
            KeyEncoding::Utf8
        }
    }

    fn key(&self, encoding: KeyEncoding) -> Result<&[u8; 32], CryptoError> {
        let key = match encoding {
            KeyEncoding::Base64 => self.root.as_deref(),
            KeyEncoding::Utf8 => self.legacy.as_deref(),
        };
        key.ok_or_else(|| {
            CryptoError::KeyManagement(format!(
                "No key configured for encoding '{}'",
                encoding.as_str()
            ))
        })
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedState, CryptoError> {
        self.encrypt_with(self.preferred(), plaintext)
    }

    pub fn encrypt_with(
        &self,
        encoding: KeyEncoding,
        plaintext: &[u8],
    ) -> Result<EncryptedState, CryptoError> {
        let sealed = encrypt_with_key(plaintext, self.key(encoding)?)?;
        Ok(EncryptedState {
            ciphertext: sealed.ciphertext,
            iv: sealed.iv,
            tag: sealed.tag,
            algorithm: ALGORITHM.to_string(),
            key_encoding: encoding.as_str().to_string(),
        })
    }

    /// Decrypt with the key the record names.
    pub fn decrypt(&self, state: &EncryptedState) -> Result<Vec<u8>, CryptoError> {
        if state.algorithm != ALGORITHM {
            return Err(CryptoError::Decrypt(format!(
                "Unsupported algorithm '{}'",
                state.algorithm
            )));
        }
        let encoding = KeyEncoding::parse(&state.key_encoding)?;
        let sealed = Sealed {
            ciphertext: state.ciphertext.clone(),
            iv: state.iv.clone(),
            tag: state.tag.clone(),
        };
        decrypt_with_key(&sealed, self.key(encoding)?)
    }

    pub fn seal_json<T: Serialize>(&self, value: &T) -> Result<EncryptedState, CryptoError> {
        let bytes = Zeroizing::new(serde_json::to_vec(value)?);
        self.encrypt(&bytes)
    }

    pub fn open_json<T: DeserializeOwned>(&self, state: &EncryptedState) -> Result<T, CryptoError> {
        let bytes = Zeroizing::new(self.decrypt(state)?);
        Ok(serde_json::from_slice(&bytes)?)
    }
}

fn parse_root_key(raw: &str) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let bytes = Zeroizing::new(B64.decode(raw.trim())?);
    if bytes.len() != 32 {
        return Err(CryptoError::KeyManagement(format!(
            "Root key has wrong length: {} (expected 32)",
            bytes.len()
        )));
    }
    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&bytes);
    Ok(key)
}

fn parse_legacy_key(raw: &str) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let raw = raw.trim();
    if raw.len() != 32 || hex::decode(raw).is_err() {
        return Err(CryptoError::KeyManagement(
            "Legacy key must be 32 hex characters".into(),
        ));
    }
    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(raw.as_bytes());
    Ok(key)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const LEGACY: &str = "00112233445566778899aabbccddeeff";

    fn root_b64() -> String {
        B64.encode([7u8; 32])
    }

    fn both() -> StateCodec {
        StateCodec::new(Some(&root_b64()), Some(LEGACY)).unwrap()
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let codec = both();
        let state = codec.encrypt(b"super secret api key 12345").unwrap();
        assert_eq!(codec.decrypt(&state).unwrap(), b"super secret api key 12345");
        assert_eq!(state.algorithm, ALGORITHM);
    }

    #[test]
    fn test_roundtrip_under_both_schemes() {
        let codec = both();
        for encoding in [KeyEncoding::Utf8, KeyEncoding::Base64] {
            let state = codec.encrypt_with(encoding, "API密钥: 🔑".as_bytes()).unwrap();
            assert_eq!(state.key_encoding, encoding.as_str());
            assert_eq!(codec.decrypt(&state).unwrap(), "API密钥: 🔑".as_bytes());
        }
    }

    #[test]
    fn test_preferred_scheme() {
        assert_eq!(both().preferred(), KeyEncoding::Base64);
        let legacy_only = StateCodec::new(None, Some(LEGACY)).unwrap();
        assert_eq!(legacy_only.preferred(), KeyEncoding::Utf8);
        assert!(StateCodec::new(None, None).is_err());
    }

    #[test]
    fn test_legacy_record_readable_after_root_key_added() {
        let before = StateCodec::new(None, Some(LEGACY)).unwrap();
        let state = before.seal_json(&serde_json::json!({"creds": []})).unwrap();

        let after = both();
        let value: serde_json::Value = after.open_json(&state).unwrap();
        assert_eq!(value["creds"], serde_json::json!([]));
        // Re-sealing moves the record to the root key
        assert_eq!(after.seal_json(&value).unwrap().key_encoding, "base64");
    }

    #[test]
    fn test_missing_key_for_record_fails() {
        let legacy_only = StateCodec::new(None, Some(LEGACY)).unwrap();
        let state = both().encrypt_with(KeyEncoding::Base64, b"x").unwrap();
        assert!(legacy_only.decrypt(&state).is_err());
    }

    #[test]
    fn test_encrypt_produces_unique_nonces() {
        let codec = both();
        let a = codec.encrypt(b"same input").unwrap();
        let b = codec.encrypt(b"same input").unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_decrypt_tampered_tag_fails() {
        let codec = both();
        let mut state = codec.encrypt(b"test data").unwrap();
        let mut tag = B64.decode(&state.tag).unwrap();
        tag[0] ^= 0xFF;
        state.tag = B64.encode(&tag);
        assert!(codec.decrypt(&state).is_err());
    }

    #[test]
    fn test_detached_tag_and_nonce_lengths() {
        let sealed = encrypt_with_key(b"", &[1u8; 32]).unwrap();
        assert_eq!(B64.decode(&sealed.iv).unwrap().len(), NONCE_LEN);
        assert_eq!(B64.decode(&sealed.tag).unwrap().len(), TAG_LEN);
        assert!(B64.decode(&sealed.ciphertext).unwrap().is_empty());
        assert_eq!(decrypt_with_key(&sealed, &[1u8; 32]).unwrap(), b"");
    }

    #[test]
    fn test_rejects_malformed_keys() {
        assert!(StateCodec::new(Some("c2hvcnQ="), None).is_err());
        assert!(StateCodec::new(None, Some("not-hex-not-hex-not-hex-not-hex!")).is_err());
        assert!(StateCodec::new(None, Some("abcd")).is_err());
    }
}
