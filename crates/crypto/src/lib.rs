use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::ChaCha20Poly1305;
use pbkdf2::pbkdf2_hmac;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

/// AEAD nonce length in bytes (96 bits, shared by both supported ciphers).
pub const NONCE_LEN: usize = 12;
/// Salt length in bytes for per-document key derivation.
pub const SALT_LEN: usize = 16;
/// Key length in bytes for both supported ciphers.
pub const KEY_LEN: usize = 32;

/// Default PBKDF2 iteration count for document key derivation.
pub const DOCUMENT_KDF_ITERATIONS: u32 = 100_000;
/// Default PBKDF2 iteration count for backup key derivation.
pub const BACKUP_KDF_ITERATIONS: u32 = 150_000;

/// Errors surfaced by the primitives wrapper.
///
/// Backend error values are intentionally not carried: every failure maps to
/// one of these kinds so that callers never branch on (or log) raw cipher
/// library messages.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CryptoError {
    /// AEAD tag verification failed during decryption.
    #[error("authentication tag mismatch")]
    AuthTagMismatch,
    /// A recomputed digest did not match its stored counterpart.
    #[error("integrity hash mismatch")]
    IntegrityMismatch,
    /// The system CSPRNG failed to produce random bytes.
    #[error("random number generation failed")]
    RngFailure,
    /// Key derivation was invoked with unusable parameters.
    #[error("key derivation failed: {0}")]
    KdfFailure(&'static str),
    /// A key of the wrong length was supplied.
    #[error("invalid key length: expected {KEY_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),
    /// A nonce of the wrong length was supplied.
    #[error("invalid nonce length: expected {NONCE_LEN} bytes, got {0}")]
    InvalidNonceLength(usize),
}

/// The AEAD ciphers a key can be bound to.
///
/// The algorithm is a property of the key, not of the operation: a key
/// created for AES-256-GCM is only ever used with AES-256-GCM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Algorithm {
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl Algorithm {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Algorithm::Aes256Gcm => "AES-256-GCM",
            Algorithm::ChaCha20Poly1305 => "ChaCha20-Poly1305",
        }
    }

    /// Parses the wire tag written into containers back into an algorithm.
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "AES-256-GCM" => Some(Algorithm::Aes256Gcm),
            "ChaCha20-Poly1305" => Some(Algorithm::ChaCha20Poly1305),
            _ => None,
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 32 bytes of secret key material, wiped from memory on drop.
#[derive(Clone)]
pub struct KeyMaterial(pub [u8; KEY_LEN]);

impl KeyMaterial {
    /// Generates a fresh key from the system CSPRNG.
    ///
    /// # Errors
    /// Returns `CryptoError::RngFailure` if the operating system cannot
    /// supply random bytes.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut k = [0u8; KEY_LEN];
        getrandom::fill(&mut k).map_err(|_| CryptoError::RngFailure)?;
        Ok(Self(k))
    }

    /// Builds key material from raw bytes retrieved out of a vault.
    ///
    /// # Errors
    /// Returns `CryptoError::InvalidKeyLength` when `bytes` is not exactly
    /// 32 bytes long.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_LEN {
            return Err(CryptoError::InvalidKeyLength(bytes.len()));
        }
        let mut k = [0u8; KEY_LEN];
        k.copy_from_slice(bytes);
        Ok(Self(k))
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for KeyMaterial {
    // Key bytes must never reach logs, including via {:?}.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyMaterial(..)")
    }
}

/// Generates a fresh 96-bit AEAD nonce from the system CSPRNG.
///
/// # Errors
/// Returns `CryptoError::RngFailure` if the CSPRNG is unavailable.
pub fn random_nonce() -> Result<[u8; NONCE_LEN], CryptoError> {
    let mut nonce = [0u8; NONCE_LEN];
    getrandom::fill(&mut nonce).map_err(|_| CryptoError::RngFailure)?;
    Ok(nonce)
}

/// Generates a fresh 16-byte KDF salt from the system CSPRNG.
///
/// # Errors
/// Returns `CryptoError::RngFailure` if the CSPRNG is unavailable.
pub fn random_salt() -> Result<[u8; SALT_LEN], CryptoError> {
    let mut salt = [0u8; SALT_LEN];
    getrandom::fill(&mut salt).map_err(|_| CryptoError::RngFailure)?;
    Ok(salt)
}

/// Encrypts `plaintext` under `key` with the given algorithm, binding `aad`
/// into the authentication tag.
///
/// # Arguments
/// * `algorithm` - The cipher the key was created for.
/// * `key` - 32 bytes of key material.
/// * `nonce` - A 96-bit nonce, unique per (key, message).
/// * `aad` - Associated data that is authenticated but not encrypted.
/// * `plaintext` - The bytes to encrypt.
///
/// # Returns
/// The ciphertext with the 16-byte authentication tag appended.
///
/// # Errors
/// * `CryptoError::InvalidNonceLength` when `nonce` is not 12 bytes.
/// * `CryptoError::RngFailure` never occurs here; nonce generation is the
///   caller's responsibility via [`random_nonce`].
pub fn aead_encrypt(
    algorithm: Algorithm,
    key: &KeyMaterial,
    nonce: &[u8],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if nonce.len() != NONCE_LEN {
        return Err(CryptoError::InvalidNonceLength(nonce.len()));
    }
    let payload = Payload { msg: plaintext, aad };
    match algorithm {
        Algorithm::Aes256Gcm => {
            let cipher = Aes256Gcm::new((&key.0).into());
            cipher
                .encrypt(aes_gcm::Nonce::from_slice(nonce), payload)
                .map_err(|_| CryptoError::AuthTagMismatch)
        }
        Algorithm::ChaCha20Poly1305 => {
            let cipher = ChaCha20Poly1305::new((&key.0).into());
            cipher
                .encrypt(chacha20poly1305::Nonce::from_slice(nonce), payload)
                .map_err(|_| CryptoError::AuthTagMismatch)
        }
    }
}

/// Decrypts `ciphertext` (with trailing tag) under `key`, verifying `aad`.
///
/// # Errors
/// * `CryptoError::InvalidNonceLength` when `nonce` is not 12 bytes.
/// * `CryptoError::AuthTagMismatch` when the tag does not verify: the
///   ciphertext, the nonce, the key, or the associated data differs from
///   what was used at encryption time.
pub fn aead_decrypt(
    algorithm: Algorithm,
    key: &KeyMaterial,
    nonce: &[u8],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if nonce.len() != NONCE_LEN {
        return Err(CryptoError::InvalidNonceLength(nonce.len()));
    }
    let payload = Payload {
        msg: ciphertext,
        aad,
    };
    match algorithm {
        Algorithm::Aes256Gcm => {
            let cipher = Aes256Gcm::new((&key.0).into());
            cipher
                .decrypt(aes_gcm::Nonce::from_slice(nonce), payload)
                .map_err(|_| CryptoError::AuthTagMismatch)
        }
        Algorithm::ChaCha20Poly1305 => {
            let cipher = ChaCha20Poly1305::new((&key.0).into());
            cipher
                .decrypt(chacha20poly1305::Nonce::from_slice(nonce), payload)
                .map_err(|_| CryptoError::AuthTagMismatch)
        }
    }
}

/// Derives a 32-byte key with PBKDF2-HMAC-SHA256.
///
/// The input keying material is `secret || context`; `context` scopes the
/// derivation (for document keys it is the UTF-8 document id, so two
/// documents under the same tenant key never share a DEK).
///
/// # Errors
/// * `CryptoError::KdfFailure` when `salt` is empty or `iterations` is zero.
pub fn derive_key(
    salt: &[u8],
    secret: &[u8],
    context: &[u8],
    iterations: u32,
) -> Result<KeyMaterial, CryptoError> {
    if salt.is_empty() {
        return Err(CryptoError::KdfFailure("empty salt"));
    }
    if iterations == 0 {
        return Err(CryptoError::KdfFailure("zero iterations"));
    }
    let mut ikm = Vec::with_capacity(secret.len() + context.len());
    ikm.extend_from_slice(secret);
    ikm.extend_from_slice(context);

    let mut out = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(&ikm, salt, iterations, &mut out);
    ikm.zeroize();
    Ok(KeyMaterial(out))
}

/// Computes the SHA-256 digest of `data`.
#[must_use]
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Computes the SHA-256 digest of `data` as lowercase hex.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    to_hex(&sha256(data))
}

/// Derives the truncated key digest recorded in containers: the first
/// 128 bits of SHA-256 over the key bytes, hex encoded.
///
/// This is an identifier for operators and audit records, not a security
/// boundary; it must never be compared as proof of key possession.
#[must_use]
pub fn key_digest(key: &KeyMaterial) -> String {
    to_hex(&sha256(&key.0)[..16])
}

/// Constant-time equality for digests and tags.
///
/// Slices of differing length compare unequal without leaking where they
/// diverge.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Lowercase hex encoding.
#[must_use]
pub fn to_hex(data: &[u8]) -> String {
    use std::fmt::Write;
    data.iter().fold(String::with_capacity(data.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    // Reduced iteration count for fast tests; production configs use
    // DOCUMENT_KDF_ITERATIONS / BACKUP_KDF_ITERATIONS.
    const TEST_ITERATIONS: u32 = 32;

    #[test]
    fn test_keymaterial_generate_is_random() {
        let a = KeyMaterial::generate().unwrap();
        let b = KeyMaterial::generate().unwrap();
        assert_eq!(a.0.len(), KEY_LEN);
        assert_ne!(to_hex(&a.0), to_hex(&b.0));
    }

    #[test]
    fn test_keymaterial_from_bytes_rejects_bad_length() {
        assert_eq!(
            KeyMaterial::from_bytes(&[0u8; 31]).unwrap_err(),
            CryptoError::InvalidKeyLength(31)
        );
        assert!(KeyMaterial::from_bytes(&[7u8; 32]).is_ok());
    }

    #[test]
    fn test_keymaterial_debug_hides_bytes() {
        let k = KeyMaterial::generate().unwrap();
        assert_eq!(format!("{k:?}"), "KeyMaterial(..)");
    }

    #[test]
    fn test_aead_roundtrip_both_algorithms() {
        for algorithm in [Algorithm::Aes256Gcm, Algorithm::ChaCha20Poly1305] {
            let key = KeyMaterial::generate().unwrap();
            let nonce = random_nonce().unwrap();
            let ct = aead_encrypt(algorithm, &key, &nonce, b"aad", b"privileged").unwrap();
            assert_ne!(ct.as_slice(), b"privileged".as_slice());
            let pt = aead_decrypt(algorithm, &key, &nonce, b"aad", &ct).unwrap();
            assert_eq!(pt, b"privileged");
        }
    }

    #[test]
    fn test_aead_decrypt_wrong_aad_fails() {
        let key = KeyMaterial::generate().unwrap();
        let nonce = random_nonce().unwrap();
        let ct = aead_encrypt(Algorithm::Aes256Gcm, &key, &nonce, b"good", b"msg").unwrap();
        let err = aead_decrypt(Algorithm::Aes256Gcm, &key, &nonce, b"evil", &ct).unwrap_err();
        assert_eq!(err, CryptoError::AuthTagMismatch);
    }

    #[test]
    fn test_aead_decrypt_wrong_key_fails() {
        let k1 = KeyMaterial::generate().unwrap();
        let k2 = KeyMaterial::generate().unwrap();
        let nonce = random_nonce().unwrap();
        let ct = aead_encrypt(Algorithm::ChaCha20Poly1305, &k1, &nonce, b"", b"msg").unwrap();
        let err = aead_decrypt(Algorithm::ChaCha20Poly1305, &k2, &nonce, b"", &ct).unwrap_err();
        assert_eq!(err, CryptoError::AuthTagMismatch);
    }

    #[test]
    fn test_aead_tamper_detection_every_position() {
        let key = KeyMaterial::generate().unwrap();
        let nonce = random_nonce().unwrap();
        let ct = aead_encrypt(Algorithm::Aes256Gcm, &key, &nonce, b"aad", b"payload").unwrap();
        for i in 0..ct.len() {
            let mut tampered = ct.clone();
            tampered[i] ^= 0x01;
            let err = aead_decrypt(Algorithm::Aes256Gcm, &key, &nonce, b"aad", &tampered);
            assert_eq!(err.unwrap_err(), CryptoError::AuthTagMismatch, "byte {i}");
        }
    }

    #[test]
    fn test_aead_rejects_bad_nonce_length() {
        let key = KeyMaterial::generate().unwrap();
        let err = aead_encrypt(Algorithm::Aes256Gcm, &key, &[0u8; 8], b"", b"x").unwrap_err();
        assert_eq!(err, CryptoError::InvalidNonceLength(8));
    }

    #[test]
    fn test_derive_key_deterministic_and_context_sensitive() {
        let salt = [1u8; SALT_LEN];
        let secret = b"tenant-key-bytes";

        let a = derive_key(&salt, secret, b"doc-1", TEST_ITERATIONS).unwrap();
        let b = derive_key(&salt, secret, b"doc-1", TEST_ITERATIONS).unwrap();
        let c = derive_key(&salt, secret, b"doc-2", TEST_ITERATIONS).unwrap();
        let d = derive_key(&[2u8; SALT_LEN], secret, b"doc-1", TEST_ITERATIONS).unwrap();

        assert_eq!(to_hex(&a.0), to_hex(&b.0));
        assert_ne!(to_hex(&a.0), to_hex(&c.0));
        assert_ne!(to_hex(&a.0), to_hex(&d.0));
    }

    #[test]
    fn test_derive_key_rejects_degenerate_params() {
        let err = derive_key(&[], b"s", b"c", TEST_ITERATIONS).unwrap_err();
        assert!(matches!(err, CryptoError::KdfFailure(_)));
        let err = derive_key(&[1u8; SALT_LEN], b"s", b"c", 0).unwrap_err();
        assert!(matches!(err, CryptoError::KdfFailure(_)));
    }

    #[test]
    fn test_sha256_known_vector() {
        // SHA-256 of the empty string.
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_key_digest_is_128_bits_hex() {
        let key = KeyMaterial::generate().unwrap();
        let digest = key_digest(&key);
        assert_eq!(digest.len(), 32);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(digest, sha256_hex(&key.0)[..32]);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }

    #[test]
    fn test_algorithm_tag_roundtrip() {
        for algorithm in [Algorithm::Aes256Gcm, Algorithm::ChaCha20Poly1305] {
            assert_eq!(Algorithm::from_tag(algorithm.as_str()), Some(algorithm));
        }
        assert_eq!(Algorithm::from_tag("ROT13"), None);
    }
}
