//! Cryptographic building blocks for the sync protocol.
//!
//! This module provides:
//! - AES-256-CBC encryption/decryption with PKCS#7 padding
//! - HMAC-SHA256 tagging and constant-time verification
//! - Sync Key decoding and the per-collection key bundle derivation
//! - the legacy passphrase stretch and RSA private-key recovery
//!
//! The protocol fixes these algorithms on the wire; everything here is a
//! thin layer over the RustCrypto crates.

pub mod cipher;
pub mod kdf;

pub use cipher::{
    aes256_cbc_decrypt, aes256_cbc_encrypt, hmac_sha256, random_iv, tag_matches_hex, KeyBundle,
};
pub use kdf::{decode_key_base32, derive_key_bundle, normalize_passphrase, stretch_passphrase};

use thiserror::Error;

/// Errors that can occur in cryptographic operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CryptoError {
    #[error("key derivation failed: {0}")]
    KdfFailed(String),

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),
}

/// Result type for crypto operations.
pub type Result<T> = std::result::Result<T, CryptoError>;
