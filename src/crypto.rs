//! # Cryptographic Operations
//!
//! PBKDF2-HMAC-SHA256 key derivation and AES-256-GCM authenticated encryption
//! for sealed posts. One key is derived per document; the body and every image
//! are encrypted under that key with their own random IV.
//!
//! The parameters below are baked into the browser widget as well and are not
//! configurable.
//!
//! ## Chunk layout
//!
//! ```text
//! ┌──────────────┬──────────────────┬───────────────┐
//! │   IV (16B)   │    Ciphertext    │   Tag (16B)   │
//! └──────────────┴──────────────────┴───────────────┘
//!    stored as     stored as `ct`     stored as `at`
//!      `iv`
//! ```
//!
//! Web Crypto expects the tag appended to the ciphertext (`ct ‖ at`); the
//! browser concatenates the two fields before decrypting.

use crate::error::CryptoError;
use aes_gcm::aead::consts::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::AesGcm;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use std::collections::HashSet;
use zeroize::Zeroizing;

/// PBKDF2 round count.
pub const ITERATIONS: u32 = 100_000;
/// Highest round count a payload may ask the decoder to run.
pub const MAX_ITERATIONS: u32 = 10 * ITERATIONS;
/// AES-256 key length.
pub const KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 16;
/// GCM IV length. 16 bytes rather than the usual 12, to match the widget.
pub const IV_LEN: usize = 16;
/// 128-bit authentication tag.
pub const TAG_LEN: usize = 16;

/// AES-256-GCM with a 128-bit nonce.
type Cipher = AesGcm<Aes256, U16>;

/// Symmetric key material for one document.
///
/// Zeroized when dropped. Deliberately not `Clone` or serializable.
pub struct DerivedKey(Zeroizing<[u8; KEY_LEN]>);

impl DerivedKey {
    fn cipher(&self) -> Result<Cipher, CryptoError> {
        Cipher::new_from_slice(&self.0[..]).map_err(|_| CryptoError::InvalidKeyLength)
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DerivedKey(<redacted>)")
    }
}

/// Derives a 256-bit key from a password with PBKDF2-HMAC-SHA256.
pub fn derive_key(password: &str, salt: &[u8], iterations: u32) -> DerivedKey {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut key[..]);
    DerivedKey(key)
}

/// Generates a fresh random salt.
pub fn random_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Tracks every IV handed out under one key.
///
/// GCM loses both confidentiality and integrity if an IV repeats under the
/// same key, so a document's encoder draws all of its IVs through one ledger.
#[derive(Debug, Default)]
pub struct IvLedger {
    used: HashSet<[u8; IV_LEN]>,
}

impl IvLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns an IV that this ledger has never returned before.
    pub fn fresh_iv(&mut self) -> [u8; IV_LEN] {
        loop {
            let mut iv = [0u8; IV_LEN];
            OsRng.fill_bytes(&mut iv);
            if self.used.insert(iv) {
                return iv;
            }
        }
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.used.len()
    }
}

/// One AES-GCM ciphertext with its IV and detached tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedChunk {
    pub ciphertext: Vec<u8>,
    pub iv: [u8; IV_LEN],
    pub tag: [u8; TAG_LEN],
}

/// Encrypts `plaintext` under `key` with an IV drawn from `ledger`.
pub fn seal(
    key: &DerivedKey,
    plaintext: &[u8],
    ledger: &mut IvLedger,
) -> Result<SealedChunk, CryptoError> {
    let cipher = key.cipher()?;
    let iv = ledger.fresh_iv();

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(GenericArray::from_slice(&iv), b"", &mut buffer)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut tag_bytes = [0u8; TAG_LEN];
    tag_bytes.copy_from_slice(tag.as_slice());

    Ok(SealedChunk {
        ciphertext: buffer,
        iv,
        tag: tag_bytes,
    })
}

/// Decrypts and authenticates one chunk.
///
/// Returns [`CryptoError::DecryptionFailed`] if the tag does not verify,
/// whatever the cause.
pub fn open(
    key: &DerivedKey,
    ciphertext: &[u8],
    iv: &[u8],
    tag: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    check_len("iv", iv, IV_LEN)?;
    check_len("tag", tag, TAG_LEN)?;

    let cipher = key.cipher()?;
    let mut buffer = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(
            GenericArray::from_slice(iv),
            b"",
            &mut buffer,
            GenericArray::from_slice(tag),
        )
        .map_err(|_| CryptoError::DecryptionFailed)?;

    Ok(buffer)
}

fn check_len(field: &'static str, bytes: &[u8], expected: usize) -> Result<(), CryptoError> {
    if bytes.len() != expected {
        return Err(CryptoError::InvalidLength {
            field,
            expected,
            actual: bytes.len(),
        });
    }
    Ok(())
}
