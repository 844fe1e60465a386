//! Key management.
//!
//! Two key protocols exist on the wire, selected once per session from
//! the server's storage version:
//!
//! - [`KeyStrategy::DerivedHmac`] (version 5): keys derived from the
//!   user's Sync Key protect the `crypto/keys` keyring, which holds the
//!   default and per-collection bulk key pairs.
//! - [`KeyStrategy::LegacyRsa`] (version 3): each collection's bulk key
//!   is wrapped with the user's RSA public key and fetched from a key
//!   URI; the private key is recovered from the `keys` collection with
//!   the stretched passphrase.
//!
//! Bulk key fetches are coalesced: concurrent requests for the same
//! identifier trigger one network fetch, and every waiter is released
//! in registration order.

use std::collections::HashMap;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use rsa::RsaPrivateKey;
use serde::Deserialize;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, trace};

use crate::client::{CollectionOptions, StorageClient};
use crate::crypto::cipher::{aes256_cbc_decrypt, hmac_sha256, tag_matches_hex, KeyBundle};
use crate::crypto::kdf::{
    decode_key_base32, derive_key_bundle, recover_private_key, unwrap_symmetric_key,
};
use crate::record::{CryptoEnvelope, KeysCleartext, Wbo};
use crate::{Result, SyncError};

/// Identifier of the keyring entry used when a collection has no key
/// pair of its own.
pub const DEFAULT_KEY: &str = "default";

/// Pending-fetch slot shared by every derived-scheme lookup, since one
/// keyring record serves all collections.
const KEYRING_FETCH: &str = "crypto/keys";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStrategy {
    DerivedHmac,
    LegacyRsa,
}

impl KeyStrategy {
    pub fn for_storage_version(version: u32) -> Option<Self> {
        match version {
            5 => Some(Self::DerivedHmac),
            3 => Some(Self::LegacyRsa),
            _ => None,
        }
    }

    pub fn storage_version(self) -> u32 {
        match self {
            Self::DerivedHmac => 5,
            Self::LegacyRsa => 3,
        }
    }
}

/// Payload of the legacy `keys/privkey` record.
#[derive(Debug, Clone, Deserialize)]
struct PrivKeyPayload {
    salt: String,
    iv: String,
    #[serde(rename = "keyData")]
    key_data: String,
    #[serde(rename = "publicKeyUri")]
    public_key_uri: String,
}

/// Payload of a legacy key-URI record.
#[derive(Debug, Deserialize)]
struct WrappedKeyRecord {
    keyring: HashMap<String, WrappedKey>,
}

#[derive(Debug, Deserialize)]
struct WrappedKey {
    wrapped: String,
    hmac: String,
}

type Waiter = (String, oneshot::Sender<Result<KeyBundle>>);

#[derive(Default)]
struct KeyCache {
    ring: HashMap<String, KeyBundle>,
    pending: HashMap<String, Vec<Waiter>>,
}

pub struct KeyManager {
    client: Arc<StorageClient>,
    strategy: KeyStrategy,
    cache: Mutex<KeyCache>,
    private_key: Mutex<Option<(RsaPrivateKey, String)>>,
}

impl KeyManager {
    pub fn new(client: Arc<StorageClient>, strategy: KeyStrategy) -> Self {
        Self {
            client,
            strategy,
            cache: Mutex::new(KeyCache::default()),
            private_key: Mutex::new(None),
        }
    }

    pub fn strategy(&self) -> KeyStrategy {
        self.strategy
    }

    fn passphrase(&self) -> Result<String> {
        self.client
            .session()
            .passphrase
            .clone()
            .ok_or(SyncError::MissingCredentials)
    }

    /// The cache identifier for a collection's bulk key: the collection
    /// name in the derived scheme, a key URI in the legacy one. Records
    /// being decrypted may carry their own key URI in the envelope.
    pub fn key_identifier(&self, collection: &str, envelope_uri: Option<&str>) -> Result<String> {
        match self.strategy {
            KeyStrategy::DerivedHmac => Ok(collection.to_string()),
            KeyStrategy::LegacyRsa => match envelope_uri {
                Some(uri) => Ok(uri.to_string()),
                None => self.client.crypto_key_uri(collection),
            },
        }
    }

    fn lookup(cache: &KeyCache, strategy: KeyStrategy, identifier: &str) -> Option<KeyBundle> {
        if let Some(bundle) = cache.ring.get(identifier) {
            return Some(bundle.clone());
        }
        if strategy == KeyStrategy::DerivedHmac {
            return cache.ring.get(DEFAULT_KEY).cloned();
        }
        None
    }

    /// Ensures key material is present: the keyring in the derived
    /// scheme, the recovered private key in the legacy one. No-op when
    /// already cached.
    pub async fn ensure_keys(&self) -> Result<()> {
        match self.strategy {
            KeyStrategy::DerivedHmac => self.bulk_key(DEFAULT_KEY).await.map(|_| ()),
            KeyStrategy::LegacyRsa => self.ensure_private_key().await.map(|_| ()),
        }
    }

    /// Resolves the bulk key pair for `identifier`, fetching it at most
    /// once while any number of callers wait.
    pub async fn bulk_key(&self, identifier: &str) -> Result<KeyBundle> {
        let pending_key = match self.strategy {
            KeyStrategy::DerivedHmac => KEYRING_FETCH.to_string(),
            KeyStrategy::LegacyRsa => identifier.to_string(),
        };

        let waiter = {
            let mut cache = self.cache.lock().await;
            if let Some(bundle) = Self::lookup(&cache, self.strategy, identifier) {
                return Ok(bundle);
            }
            match cache.pending.get_mut(&pending_key) {
                Some(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push((identifier.to_string(), tx));
                    Some(rx)
                }
                None => {
                    cache.pending.insert(pending_key.clone(), Vec::new());
                    None
                }
            }
        };

        if let Some(rx) = waiter {
            trace!(identifier, "joining in-flight key fetch");
            return rx
                .await
                .map_err(|_| SyncError::RequestError("key fetch abandoned".into()))?;
        }

        debug!(identifier, "fetching bulk key");
        let outcome = match self.strategy {
            KeyStrategy::DerivedHmac => self.fetch_keyring().await,
            KeyStrategy::LegacyRsa => self
                .fetch_wrapped_key(identifier)
                .await
                .map(|bundle| vec![(identifier.to_string(), bundle)]),
        };

        let mut cache = self.cache.lock().await;
        if let Ok(entries) = &outcome {
            for (id, bundle) in entries {
                cache.ring.insert(id.clone(), bundle.clone());
            }
        }
        let waiters = cache.pending.remove(&pending_key).unwrap_or_default();

        let resolve = |id: &str| match &outcome {
            Ok(_) => Self::lookup(&cache, self.strategy, id)
                .ok_or_else(|| SyncError::RequestError("bulk key missing after fetch".into())),
            Err(e) => Err(e.clone()),
        };
        for (id, tx) in waiters {
            let _ = tx.send(resolve(&id));
        }
        resolve(identifier)
    }

    /// Fetches and opens the derived-scheme keyring: verify its HMAC
    /// with the derived HMAC key, decrypt with the derived encryption
    /// key, then split into per-collection bundles.
    async fn fetch_keyring(&self) -> Result<Vec<(String, KeyBundle)>> {
        let passphrase = self.passphrase()?;
        let sync_key = decode_key_base32(&passphrase)?;
        let derived = derive_key_bundle(&sync_key, &self.client.session().wire_user)?;

        let wbo = self.client.get_record(KEYRING_FETCH).await?;
        let envelope: CryptoEnvelope = serde_json::from_str(&wbo.payload)
            .map_err(|e| SyncError::JsonError(e.to_string()))?;

        // A wrong passphrase yields a wrong HMAC key, so it surfaces
        // here as a key integrity failure.
        let tag = hmac_sha256(&derived.hmac, envelope.ciphertext.as_bytes())?;
        if !tag_matches_hex(&tag, &envelope.hmac) {
            return Err(SyncError::KeyHmacFailed);
        }

        let ciphertext = B64
            .decode(&envelope.ciphertext)
            .map_err(|e| SyncError::JsonError(format!("keyring ciphertext: {e}")))?;
        let iv = B64
            .decode(&envelope.iv)
            .map_err(|e| SyncError::JsonError(format!("keyring IV: {e}")))?;
        let cleartext = aes256_cbc_decrypt(&derived.encryption, &iv, &ciphertext)?;
        let keys: KeysCleartext = serde_json::from_slice(&cleartext)
            .map_err(|e| SyncError::JsonError(e.to_string()))?;

        let mut entries = vec![(DEFAULT_KEY.to_string(), decode_pair(&keys.default)?)];
        for (collection, pair) in &keys.collections {
            entries.push((collection.clone(), decode_pair(pair)?));
        }
        debug!(collections = entries.len() - 1, "keyring opened");
        Ok(entries)
    }

    /// Fetches a legacy wrapped bulk key, verifies its passphrase-keyed
    /// HMAC and unwraps it with the private key.
    async fn fetch_wrapped_key(&self, uri: &str) -> Result<KeyBundle> {
        let passphrase = self.passphrase()?;
        let (private_key, public_key_uri) = self.ensure_private_key().await?;

        let wbo = self.client.get_record_absolute(uri).await?;
        let record: WrappedKeyRecord = serde_json::from_str(&wbo.payload)
            .map_err(|e| SyncError::JsonError(e.to_string()))?;
        let wrapped = record.keyring.get(&public_key_uri).ok_or_else(|| {
            SyncError::JsonError(format!("no wrapped key for {public_key_uri}"))
        })?;

        let tag = hmac_sha256(passphrase.as_bytes(), wrapped.wrapped.as_bytes())?;
        if !tag_matches_hex(&tag, &wrapped.hmac) {
            return Err(SyncError::KeyHmacFailed);
        }

        let bulk = unwrap_symmetric_key(&private_key, &wrapped.wrapped)?;
        // Legacy record HMACs are keyed with the base64 text of the
        // bulk key, not its raw bytes.
        let hmac_key = B64.encode(&bulk).into_bytes();
        Ok(KeyBundle::from_slices(&bulk, &hmac_key)?)
    }

    /// Recovers and caches the legacy private key from the `keys`
    /// collection. A passphrase that fails to decrypt a parseable key
    /// is the legacy scheme's only wrong-passphrase signal.
    async fn ensure_private_key(&self) -> Result<(RsaPrivateKey, String)> {
        let mut slot = self.private_key.lock().await;
        if let Some((key, uri)) = slot.as_ref() {
            return Ok((key.clone(), uri.clone()));
        }

        let passphrase = self.passphrase()?;
        let wbos: Vec<Wbo> = self
            .client
            .load_collection("keys", &CollectionOptions::full())
            .await?;
        let privkey = wbos
            .iter()
            .find(|w| w.id == "privkey")
            .ok_or_else(|| SyncError::JsonError("no privkey record in keys".into()))?;
        let payload: PrivKeyPayload = serde_json::from_str(&privkey.payload)
            .map_err(|e| SyncError::JsonError(e.to_string()))?;

        let key = recover_private_key(&passphrase, &payload.salt, &payload.iv, &payload.key_data)
            .map_err(|_| SyncError::WrongPassphrase)?;
        debug!("legacy private key recovered");
        *slot = Some((key.clone(), payload.public_key_uri.clone()));
        Ok((key, payload.public_key_uri))
    }

    #[cfg(test)]
    pub(crate) async fn prime(&self, identifier: &str, bundle: KeyBundle) {
        self.cache
            .lock()
            .await
            .ring
            .insert(identifier.to_string(), bundle);
    }
}

fn decode_pair(pair: &[String]) -> Result<KeyBundle> {
    if pair.len() != 2 {
        return Err(SyncError::JsonError(format!(
            "keyring entry has {} elements, expected 2",
            pair.len()
        )));
    }
    let encryption = B64
        .decode(&pair[0])
        .map_err(|e| SyncError::JsonError(format!("keyring encryption key: {e}")))?;
    let hmac = B64
        .decode(&pair[1])
        .map_err(|e| SyncError::JsonError(format!("keyring hmac key: {e}")))?;
    Ok(KeyBundle::from_slices(&encryption, &hmac)?)
}
