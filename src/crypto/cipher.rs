//! AES-256-CBC and HMAC primitives.
//!
//! Record payloads are encrypted with AES-256-CBC (PKCS#7 padding) and
//! authenticated with an HMAC over the base64 ciphertext text. Tags are
//! always verified in constant time before any decryption is attempted.

use aes::Aes256;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::{CryptoError, Result};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// An encryption key paired with the HMAC key that authenticates records
/// encrypted under it.
///
/// The HMAC key is kept as raw bytes: derived bundles use a 32-byte key,
/// while the legacy scheme keys the HMAC with the base64 *text* of the
/// bulk key, which is longer.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyBundle {
    pub encryption: [u8; 32],
    pub hmac: Vec<u8>,
}

impl std::fmt::Debug for KeyBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyBundle").finish_non_exhaustive()
    }
}

impl KeyBundle {
    pub fn new(encryption: [u8; 32], hmac: Vec<u8>) -> Self {
        Self { encryption, hmac }
    }

    /// Builds a bundle from two raw 32-byte keys, as stored in the keyring.
    pub fn from_slices(encryption: &[u8], hmac: &[u8]) -> Result<Self> {
        let encryption: [u8; 32] = encryption
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("encryption key must be 32 bytes".into()))?;
        Ok(Self {
            encryption,
            hmac: hmac.to_vec(),
        })
    }
}

/// Encrypts plaintext with AES-256-CBC and PKCS#7 padding.
pub fn aes256_cbc_encrypt(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256CbcEnc::new_from_slices(key, iv)
        .map_err(|e| CryptoError::InvalidKey(format!("bad AES key/IV length: {e}")))?;
    Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

/// Decrypts AES-256-CBC ciphertext and strips PKCS#7 padding.
pub fn aes256_cbc_decrypt(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256CbcDec::new_from_slices(key, iv)
        .map_err(|e| CryptoError::InvalidKey(format!("bad AES key/IV length: {e}")))?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed("invalid padding".into()))
}

/// Computes HMAC-SHA256 over `data`.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32]> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|e| CryptoError::InvalidKey(format!("bad HMAC key: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// Generates a random 16-byte IV from the operating system RNG.
pub fn random_iv() -> [u8; 16] {
    let mut iv = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut iv);
    iv
}

/// Compares a computed tag against a hex-encoded tag from the wire in
/// constant time.
pub fn tag_matches_hex(computed: &[u8], wire_hex: &str) -> bool {
    let wire = match data_encoding::HEXLOWER_PERMISSIVE.decode(wire_hex.as_bytes()) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    computed.ct_eq(&wire).into()
}
