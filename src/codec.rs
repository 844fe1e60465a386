//! Record encryption and decryption.
//!
//! The codec turns cleartext record data into the encrypted payload
//! envelope and back. Decryption verifies the envelope's HMAC before
//! touching the ciphertext; a mismatch never yields cleartext.

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use data_encoding::HEXLOWER;
use tracing::trace;

use crate::crypto::cipher::{
    aes256_cbc_decrypt, aes256_cbc_encrypt, hmac_sha256, random_iv, tag_matches_hex,
};
use crate::keys::{KeyManager, KeyStrategy};
use crate::record::{CryptoEnvelope, RecordData, Wbo};
use crate::{Result, SyncError};

/// Encrypts record cleartext into a payload-bearing WBO.
///
/// A fresh random IV is drawn for every call. The HMAC is computed over
/// the base64 ciphertext text. In the legacy scheme the envelope also
/// names the key URI that protects this record.
pub async fn encrypt_wbo(keys: &KeyManager, collection: &str, data: &RecordData) -> Result<Wbo> {
    let identifier = keys.key_identifier(collection, None)?;
    let bundle = keys.bulk_key(&identifier).await?;

    let cleartext = data.to_cleartext()?;
    let iv = random_iv();
    let ciphertext = aes256_cbc_encrypt(&bundle.encryption, &iv, cleartext.as_bytes())?;
    let ciphertext_b64 = B64.encode(&ciphertext);
    let tag = hmac_sha256(&bundle.hmac, ciphertext_b64.as_bytes())?;

    let envelope = CryptoEnvelope {
        encryption: match keys.strategy() {
            KeyStrategy::LegacyRsa => Some(identifier),
            KeyStrategy::DerivedHmac => None,
        },
        ciphertext: ciphertext_b64,
        iv: B64.encode(iv),
        hmac: HEXLOWER.encode(&tag),
    };
    let payload =
        serde_json::to_string(&envelope).map_err(|e| SyncError::JsonError(e.to_string()))?;
    trace!(id = data.id(), collection, "record encrypted");
    Ok(Wbo::new(data.id(), payload))
}

/// Verifies and decrypts a WBO's payload into record cleartext.
///
/// Fails with [`SyncError::WboHmacFailed`] before any decryption if the
/// envelope's tag does not match.
pub async fn decrypt_wbo(keys: &KeyManager, collection: &str, wbo: &Wbo) -> Result<RecordData> {
    let envelope: CryptoEnvelope =
        serde_json::from_str(&wbo.payload).map_err(|e| SyncError::JsonError(e.to_string()))?;
    let identifier = keys.key_identifier(collection, envelope.encryption.as_deref())?;
    let bundle = keys.bulk_key(&identifier).await?;

    let tag = hmac_sha256(&bundle.hmac, envelope.ciphertext.as_bytes())?;
    if !tag_matches_hex(&tag, &envelope.hmac) {
        return Err(SyncError::WboHmacFailed {
            id: wbo.id.clone(),
        });
    }

    let ciphertext = B64
        .decode(&envelope.ciphertext)
        .map_err(|e| SyncError::JsonError(format!("ciphertext: {e}")))?;
    let iv = B64
        .decode(&envelope.iv)
        .map_err(|e| SyncError::JsonError(format!("IV: {e}")))?;
    let cleartext_bytes = aes256_cbc_decrypt(&bundle.encryption, &iv, &ciphertext)?;
    let cleartext = String::from_utf8(cleartext_bytes)
        .map_err(|e| SyncError::JsonError(e.to_string()))?;
    RecordData::from_cleartext(collection, &cleartext)
}
