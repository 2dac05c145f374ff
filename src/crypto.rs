//! Shared-secret key derivation, AES-256-GCM sealing, and correlation tags.
//!
//! Both ends of the relay (this daemon and the approving device) hold the
//! same PIN. Each side derives the same AES key from it independently, so
//! no key material ever crosses the relay.
//!
//! # Wire Format
//!
//! A sealed payload is standard base64 of:
//!
//! ```text
//! [12-byte nonce][ciphertext][16-byte GCM tag]
//! ```
//!
//! Replies are looked up in the relay store by a correlation tag, the
//! lowercase hex HMAC-SHA256 of the request id under the derived key. The
//! store never sees the request id itself.

// Rust guideline compliant 2026-02

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants;

/// Nonce size for AES-GCM (96 bits = 12 bytes).
const NONCE_SIZE: usize = 12;

/// Authentication tag size appended by AES-GCM.
const GCM_TAG_SIZE: usize = 16;

type HmacSha256 = Hmac<Sha256>;

/// Errors produced by the crypto engine.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// The shared secret environment variable is unset or empty.
    #[error("environment variable {0} is not set")]
    MissingSecret(&'static str),
    /// Key derivation was asked to work on an empty secret.
    #[error("shared secret is empty")]
    EmptySecret,
    /// The cipher rejected the key.
    #[error("invalid key length")]
    InvalidKey,
    /// AES-GCM encryption failed.
    #[error("encryption failed")]
    Encryption,
    /// Ciphertext is too short to hold a nonce and tag.
    #[error("ciphertext truncated ({0} bytes)")]
    Truncated(usize),
    /// Ciphertext failed authentication (tampered or wrong key).
    #[error("ciphertext failed authentication")]
    Authentication,
    /// Sealed text is not valid base64.
    #[error("invalid sealed payload encoding: {0}")]
    Encoding(#[from] base64::DecodeError),
    /// The startup round trip did not reproduce the plaintext.
    #[error("encryption self-test failed at {0}")]
    SelfTest(&'static str),
}

/// Process-wide shared secret (the PIN).
///
/// Zeroed on drop. `Debug` never prints the value.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret(String);

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(<redacted>)")
    }
}

impl SharedSecret {
    /// Wrap a secret value.
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Read the secret from [`constants::SECRET_ENV_VAR`].
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::MissingSecret`] if the variable is unset or empty.
    pub fn from_env() -> Result<Self, CryptoError> {
        match std::env::var(constants::SECRET_ENV_VAR) {
            Ok(value) if !value.is_empty() => Ok(Self(value)),
            _ => Err(CryptoError::MissingSecret(constants::SECRET_ENV_VAR)),
        }
    }

    fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

/// 256-bit key derived from the shared secret.
///
/// Read-only after derivation; share it between sessions behind an `Arc`.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey([u8; 32]);

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DerivedKey(<redacted>)")
    }
}

impl DerivedKey {
    fn cipher(&self) -> Result<Aes256Gcm, CryptoError> {
        Aes256Gcm::new_from_slice(&self.0).map_err(|_| CryptoError::InvalidKey)
    }
}

/// Identifier under which a reply is stored in the relay store.
///
/// Always 64 lowercase hex characters, whatever the request id looked like.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct CorrelationTag(String);

impl CorrelationTag {
    /// The tag as sent to the relay store.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CorrelationTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derive the AES key as `SHA-256(secret)`.
///
/// # Errors
///
/// Returns [`CryptoError::EmptySecret`] for an empty secret.
pub fn derive_key(secret: &SharedSecret) -> Result<DerivedKey, CryptoError> {
    if secret.as_bytes().is_empty() {
        return Err(CryptoError::EmptySecret);
    }
    let digest = Sha256::digest(secret.as_bytes());
    Ok(DerivedKey(digest.into()))
}

/// Encrypt plaintext using AES-256-GCM with a random nonce.
///
/// The nonce is prepended to the output so the remote side can decrypt
/// without any other context.
pub fn encrypt(key: &DerivedKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = key.cipher()?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::Encryption)?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt the output of [`encrypt`].
///
/// # Errors
///
/// Returns [`CryptoError::Truncated`] if the input cannot hold a nonce and
/// tag, and [`CryptoError::Authentication`] if GCM verification fails.
pub fn decrypt(key: &DerivedKey, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < NONCE_SIZE + GCM_TAG_SIZE {
        return Err(CryptoError::Truncated(ciphertext.len()));
    }
    let cipher = key.cipher()?;
    let (nonce_bytes, body) = ciphertext.split_at(NONCE_SIZE);

    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), body)
        .map_err(|_| CryptoError::Authentication)
}

/// Encrypt and base64-encode for the relay.
pub fn seal(key: &DerivedKey, plaintext: &[u8]) -> Result<String, CryptoError> {
    Ok(BASE64.encode(encrypt(key, plaintext)?))
}

/// Decode and decrypt a sealed payload from the relay.
///
/// Surrounding whitespace and one pair of JSON string quotes are ignored,
/// since the store may hand the value back JSON-encoded.
pub fn open(key: &DerivedKey, sealed: &str) -> Result<Vec<u8>, CryptoError> {
    let trimmed = sealed.trim();
    let unquoted = trimmed
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(trimmed);
    let raw = BASE64.decode(unquoted)?;
    decrypt(key, &raw)
}

/// Derive the relay-store lookup tag for a request id.
pub fn correlation_tag(key: &DerivedKey, request_id: &str) -> Result<CorrelationTag, CryptoError> {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(&key.0).map_err(|_| CryptoError::InvalidKey)?;
    mac.update(request_id.as_bytes());
    let digest = mac.finalize().into_bytes();
    Ok(CorrelationTag(data_encoding::HEXLOWER.encode(&digest)))
}

/// Round-trip a known value through [`seal`] and [`open`].
///
/// Run once at startup, before any request is relayed.
pub fn self_test(key: &DerivedKey) -> Result<(), CryptoError> {
    let sealed = seal(key, constants::SELF_TEST_PLAINTEXT)?;
    let opened = open(key, &sealed)?;
    if opened != constants::SELF_TEST_PLAINTEXT {
        return Err(CryptoError::SelfTest("compare"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(pin: &str) -> DerivedKey {
        derive_key(&SharedSecret::new(pin)).unwrap()
    }

    #[test]
    fn test_derive_key_is_sha256_of_secret() {
        let k = key("1234");
        assert_eq!(
            data_encoding::HEXLOWER.encode(&k.0),
            "03ac674216f3e15c761ee1a5e255f067953623c8b388b4459e13f978d7c846f4"
        );
    }

    #[test]
    fn test_derive_key_deterministic() {
        assert_eq!(key("hunter2").0, key("hunter2").0);
        assert_ne!(key("hunter2").0, key("hunter3").0);
    }

    #[test]
    fn test_empty_secret_rejected() {
        let err = derive_key(&SharedSecret::new("")).unwrap_err();
        assert!(matches!(err, CryptoError::EmptySecret));
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let k = key("1234");
        let plaintext = b"sudo systemctl restart nginx";
        let ciphertext = encrypt(&k, plaintext).unwrap();
        assert_eq!(ciphertext.len(), NONCE_SIZE + plaintext.len() + GCM_TAG_SIZE);
        assert_eq!(decrypt(&k, &ciphertext).unwrap(), plaintext);
    }

    #[test]
    fn test_empty_plaintext_roundtrip() {
        let k = key("1234");
        let sealed = seal(&k, b"").unwrap();
        assert!(open(&k, &sealed).unwrap().is_empty());
    }

    #[test]
    fn test_nonce_is_fresh_per_message() {
        let k = key("1234");
        assert_ne!(encrypt(&k, b"same").unwrap(), encrypt(&k, b"same").unwrap());
    }

    #[test]
    fn test_wrong_key_fails() {
        let ciphertext = encrypt(&key("1234"), b"secret").unwrap();
        let err = decrypt(&key("4321"), &ciphertext).unwrap_err();
        assert!(matches!(err, CryptoError::Authentication));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let k = key("1234");
        let mut ciphertext = encrypt(&k, b"approve").unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0x01;
        assert!(matches!(decrypt(&k, &ciphertext), Err(CryptoError::Authentication)));
    }

    #[test]
    fn test_truncated_ciphertext_fails() {
        let k = key("1234");
        assert!(matches!(decrypt(&k, &[0u8; 20]), Err(CryptoError::Truncated(20))));
    }

    #[test]
    fn test_open_known_vector() {
        // nonce 00..0b, plaintext "approved", key SHA-256("1234")
        let k = key("1234");
        let plain = open(&k, "AAECAwQFBgcICQoLJYu+27iNTJtGq9Otsy1kSn+tWzY1k8el").unwrap();
        assert_eq!(plain, b"approved");
    }

    #[test]
    fn test_open_tolerates_quotes_and_whitespace() {
        let k = key("1234");
        let sealed = seal(&k, b"ok").unwrap();
        assert_eq!(open(&k, &format!("\"{sealed}\"\n")).unwrap(), b"ok");
        assert_eq!(open(&k, &format!("  {sealed}  ")).unwrap(), b"ok");
    }

    #[test]
    fn test_open_rejects_bad_base64() {
        let k = key("1234");
        assert!(matches!(open(&k, "not base64!"), Err(CryptoError::Encoding(_))));
    }

    #[test]
    fn test_correlation_tag_known_vector() {
        let tag = correlation_tag(&key("1234"), "ABC123").unwrap();
        assert_eq!(
            tag.as_str(),
            "6538ce3ad0b51c628a1a99d9b6c989c9ff6c68e9dea5c5853b22329e727dbee4"
        );
    }

    #[test]
    fn test_correlation_tag_stable() {
        let k = key("1234");
        let first = correlation_tag(&k, "ABC123").unwrap();
        let second = correlation_tag(&k, "ABC123").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_correlation_tag_hides_id() {
        let k = key("1234");
        let short = correlation_tag(&k, "A").unwrap();
        let long = correlation_tag(&k, &"A".repeat(200)).unwrap();
        let prefixed = correlation_tag(&k, "AB").unwrap();

        assert_eq!(short.as_str().len(), 64);
        assert_eq!(long.as_str().len(), 64);
        assert_ne!(short, prefixed);
        assert!(!long.as_str().contains("aaaa"));
        assert!(short.as_str().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_correlation_tag_depends_on_key() {
        let a = correlation_tag(&key("1234"), "ABC123").unwrap();
        let b = correlation_tag(&key("1235"), "ABC123").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_self_test_passes() {
        assert!(self_test(&key("1234")).is_ok());
    }

    #[test]
    fn test_debug_redacts() {
        let secret = SharedSecret::new("1234");
        let debug = format!("{secret:?} {:?}", derive_key(&secret).unwrap());
        assert!(!debug.contains("1234"));
        assert!(debug.contains("redacted"));
    }
}
