//! Key derivation and recovery.
//!
//! Two schemes coexist on the wire:
//!
//! - Storage version 5 derives per-user encryption and HMAC keys from a
//!   16-byte Sync Key that the user holds as a "friendly" base32
//!   passphrase.
//! - Storage version 3 stretches the account passphrase with PBKDF2 to
//!   decrypt an RSA private key, which in turn unwraps the bulk key that
//!   encrypts records.

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use data_encoding::Specification;
use hmac::Hmac;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey};
use sha1::Sha1;

use super::cipher::{aes256_cbc_decrypt, hmac_sha256, KeyBundle};
use super::{CryptoError, Result};

/// Context string mixed into the version 5 key derivation.
const HMAC_INPUT: &[u8] = b"Sync-AES_256_CBC-HMAC256";

/// PBKDF2 iteration count for the legacy passphrase stretch.
const STRETCH_ROUNDS: u32 = 4096;

/// Canonicalizes a user-entered Sync Key passphrase.
///
/// Users see the key grouped with hyphens and in the "friendly" alphabet
/// where `l` and `o` are replaced by `8` and `9`. This reverses both and
/// pads to a full base32 quantum.
pub fn normalize_passphrase(passphrase: &str) -> String {
    let mut out: String = passphrase
        .trim()
        .chars()
        .filter(|c| *c != '-')
        .map(|c| match c.to_ascii_uppercase() {
            '8' => 'L',
            '9' => 'O',
            c => c,
        })
        .collect();
    while out.len() % 8 != 0 {
        out.push('=');
    }
    out
}

/// Encodes bytes in the lowercase "friendly" base32 alphabet.
///
/// Used for hashed usernames as well as for rendering the Sync Key.
pub fn encode_friendly_base32(data: &[u8]) -> String {
    data_encoding::BASE32
        .encode(data)
        .to_ascii_lowercase()
        .replace('l', "8")
        .replace('o', "9")
}

fn tolerant_base32() -> Result<data_encoding::Encoding> {
    let mut spec = Specification::new();
    spec.symbols.push_str("ABCDEFGHIJKLMNOPQRSTUVWXYZ234567");
    spec.padding = Some('=');
    spec.check_trailing_bits = false;
    spec.encoding()
        .map_err(|e| CryptoError::KdfFailed(format!("base32 alphabet: {e}")))
}

/// Decodes a Sync Key passphrase into the 16-byte Sync Key.
///
/// Decoding tolerates non-zero trailing bits to accept keys minted by
/// sloppier encoders.
pub fn decode_key_base32(passphrase: &str) -> Result<[u8; 16]> {
    let normalized = normalize_passphrase(passphrase);
    let decoded = tolerant_base32()?
        .decode(normalized.as_bytes())
        .map_err(|e| CryptoError::KdfFailed(format!("invalid sync key: {e}")))?;
    if decoded.len() < 16 {
        return Err(CryptoError::KdfFailed(format!(
            "sync key too short: {} bytes",
            decoded.len()
        )));
    }
    let mut key = [0u8; 16];
    key.copy_from_slice(&decoded[..16]);
    Ok(key)
}

/// Derives the per-user encryption and HMAC keys from the Sync Key.
///
/// The derivation is two chained HMAC-SHA256 rounds keyed with the Sync
/// Key, bound to the wire-encoded username.
pub fn derive_key_bundle(sync_key: &[u8; 16], wire_username: &str) -> Result<KeyBundle> {
    let mut info = Vec::with_capacity(HMAC_INPUT.len() + wire_username.len() + 1);
    info.extend_from_slice(HMAC_INPUT);
    info.extend_from_slice(wire_username.as_bytes());

    let mut first = info.clone();
    first.push(0x01);
    let encryption = hmac_sha256(sync_key, &first)?;

    let mut second = Vec::with_capacity(32 + info.len() + 1);
    second.extend_from_slice(&encryption);
    second.extend_from_slice(&info);
    second.push(0x02);
    let hmac = hmac_sha256(sync_key, &second)?;

    Ok(KeyBundle::new(encryption, hmac.to_vec()))
}

/// Stretches a passphrase with PBKDF2-HMAC-SHA1 into an AES-256 key.
pub fn stretch_passphrase(passphrase: &str, salt: &[u8]) -> Result<[u8; 32]> {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2::<Hmac<Sha1>>(passphrase.as_bytes(), salt, STRETCH_ROUNDS, &mut key)
        .map_err(|e| CryptoError::KdfFailed(format!("pbkdf2: {e}")))?;
    Ok(key)
}

/// Decrypts and parses the server-stored RSA private key.
///
/// The stretched passphrase decrypts the DER blob; parse failures are
/// reported as key-derivation failures since a wrong passphrase yields
/// garbage rather than a clean decryption error.
pub fn recover_private_key(
    passphrase: &str,
    salt_b64: &str,
    iv_b64: &str,
    key_data_b64: &str,
) -> Result<RsaPrivateKey> {
    let salt = decode_b64(salt_b64, "private key salt")?;
    let iv = decode_b64(iv_b64, "private key IV")?;
    let key_data = decode_b64(key_data_b64, "private key data")?;

    let stretched = stretch_passphrase(passphrase, &salt)?;
    let der = aes256_cbc_decrypt(&stretched, &iv, &key_data)?;

    RsaPrivateKey::from_pkcs8_der(&der)
        .or_else(|_| RsaPrivateKey::from_pkcs1_der(&der))
        .map_err(|e| CryptoError::KdfFailed(format!("private key parse: {e}")))
}

/// Unwraps the RSA-wrapped bulk key that encrypts legacy records.
pub fn unwrap_symmetric_key(private_key: &RsaPrivateKey, wrapped_b64: &str) -> Result<Vec<u8>> {
    let wrapped = decode_b64(wrapped_b64, "wrapped key")?;
    private_key
        .decrypt(Pkcs1v15Encrypt, &wrapped)
        .map_err(|e| CryptoError::DecryptionFailed(format!("key unwrap: {e}")))
}

fn decode_b64(data: &str, what: &str) -> Result<Vec<u8>> {
    B64.decode(data)
        .map_err(|e| CryptoError::KdfFailed(format!("{what}: {e}")))
}
