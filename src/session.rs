//! Session lifecycle.
//!
//! A session is created by [`SessionManager::connect`] and torn down by
//! `disconnect`. Everything that needs credentials or the resolved
//! storage node borrows the session through an `Arc`; no ambient global
//! state exists. Only one session may be active at a time.

use std::sync::{Arc, Mutex};

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tracing::{debug, info};

use crate::crypto::kdf::encode_friendly_base32;
use crate::record::ClientRecord;
use crate::store::{set_json, LocalStore};
use crate::{Result, SyncError};

/// Generates a 12-character record GUID from 9 random bytes.
pub fn make_guid() -> String {
    let mut bytes = [0u8; 9];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    B64.encode(bytes).replace('+', "-").replace('/', "_")
}

/// The device class reported in our client record.
pub fn current_device_type() -> &'static str {
    if cfg!(any(target_os = "android", target_os = "ios")) {
        "mobile"
    } else {
        "desktop"
    }
}

/// Transforms a username into its wire form: lowercased, and hashed to
/// friendly base32 when it looks like an email address.
pub fn encode_username(user: &str) -> String {
    let lowered = user.to_lowercase();
    if !lowered.contains('@') {
        return lowered;
    }
    let digest = Sha1::digest(lowered.as_bytes());
    encode_friendly_base32(&digest)
}

/// Connection configuration, persisted in the local store between runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectOptions {
    pub server: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Sync Key passphrase (current scheme) or account passphrase
    /// (legacy scheme). Absent when only unencrypted access is needed.
    pub passphrase: Option<String>,
    pub client: Option<ClientRecord>,
}

const OPTIONS_SLOT: &str = "options";

/// An active connection to one account on one server.
#[derive(Debug)]
pub struct Session {
    pub server: String,
    pub user: String,
    /// Wire-encoded username used in every URL and for key derivation.
    pub wire_user: String,
    pub password: String,
    pub passphrase: Option<String>,
    pub client: ClientRecord,
    storage_url: Mutex<Option<String>>,
}

impl Session {
    pub fn storage_url(&self) -> Result<Option<String>> {
        let slot = self
            .storage_url
            .lock()
            .map_err(|_| SyncError::Store("session lock poisoned".into()))?;
        Ok(slot.clone())
    }

    pub fn set_storage_url(&self, url: String) -> Result<()> {
        let mut slot = self
            .storage_url
            .lock()
            .map_err(|_| SyncError::Store("session lock poisoned".into()))?;
        *slot = Some(url);
        Ok(())
    }
}

/// Owns the one active [`Session`].
pub struct SessionManager {
    store: Arc<dyn LocalStore>,
    session: Mutex<Option<Arc<Session>>>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self {
            store,
            session: Mutex::new(None),
        }
    }

    /// Validates the options, persists them, and activates a session.
    pub fn connect(&self, options: ConnectOptions) -> Result<Arc<Session>> {
        let mut slot = self
            .session
            .lock()
            .map_err(|_| SyncError::Store("session lock poisoned".into()))?;
        if slot.is_some() {
            return Err(SyncError::AlreadyConnected);
        }

        let server = options
            .server
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or(SyncError::MissingServer)?;
        let user = options
            .user
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or(SyncError::MissingCredentials)?;
        let password = options
            .password
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or(SyncError::MissingCredentials)?;

        let client = options.client.clone().unwrap_or_else(|| ClientRecord {
            id: make_guid(),
            name: format!("weftsync ({})", current_device_type()),
            client_type: current_device_type().to_string(),
            commands: None,
        });

        let mut persisted = options;
        persisted.client = Some(client.clone());
        set_json(self.store.as_ref(), OPTIONS_SLOT, &persisted)?;

        let wire_user = encode_username(&user);
        let session = Arc::new(Session {
            server: server.trim_end_matches('/').to_string(),
            user,
            wire_user,
            password,
            passphrase: persisted.passphrase,
            client,
            storage_url: Mutex::new(None),
        });
        info!(server = %session.server, user = %session.wire_user, "session connected");
        *slot = Some(Arc::clone(&session));
        Ok(session)
    }

    /// Tears down the active session. Idempotent; in-flight operations
    /// holding their own `Arc<Session>` run to completion against the
    /// detached session.
    pub fn disconnect(&self) -> Result<()> {
        let mut slot = self
            .session
            .lock()
            .map_err(|_| SyncError::Store("session lock poisoned".into()))?;
        if slot.take().is_some() {
            debug!("session disconnected");
        }
        Ok(())
    }

    pub fn session(&self) -> Result<Option<Arc<Session>>> {
        let slot = self
            .session
            .lock()
            .map_err(|_| SyncError::Store("session lock poisoned".into()))?;
        Ok(slot.clone())
    }

    /// Options persisted by the last successful connect, if any.
    pub fn stored_options(&self) -> Result<Option<ConnectOptions>> {
        crate::store::get_json(self.store.as_ref(), OPTIONS_SLOT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn options() -> ConnectOptions {
        ConnectOptions {
            server: Some("http://server/".into()),
            user: Some("User@Example.com".into()),
            password: Some("secret".into()),
            passphrase: Some("a-aaqea-yeaud-a9caj-bifqy-di9b4".into()),
            client: None,
        }
    }

    #[test]
    fn test_encode_username() {
        assert_eq!(
            encode_username("user@example.com"),
            "m9travusmgrewn3ge5nxaag9rv5tfyxx"
        );
        assert_eq!(
            encode_username("John@example.org"),
            "2v7ub5g3tdznw4dp6rnuy7knigy22jxp"
        );
        assert_eq!(encode_username("PlainUser"), "plainuser");
    }

    #[test]
    fn test_make_guid_shape() {
        let guid = make_guid();
        assert_eq!(guid.len(), 12);
        assert!(!guid.contains('+') && !guid.contains('/'));
        assert_ne!(guid, make_guid());
    }

    #[test]
    fn test_connect_contract() {
        let manager = SessionManager::new(Arc::new(MemoryStore::new()));

        let mut missing_server = options();
        missing_server.server = None;
        assert_eq!(
            manager.connect(missing_server).unwrap_err(),
            SyncError::MissingServer
        );

        let mut missing_user = options();
        missing_user.user = None;
        assert_eq!(
            manager.connect(missing_user).unwrap_err(),
            SyncError::MissingCredentials
        );

        let mut missing_password = options();
        missing_password.password = Some(String::new());
        assert_eq!(
            manager.connect(missing_password).unwrap_err(),
            SyncError::MissingCredentials
        );

        let session = manager.connect(options()).unwrap();
        assert_eq!(session.server, "http://server");
        assert_eq!(session.wire_user, "m9travusmgrewn3ge5nxaag9rv5tfyxx");
        assert_eq!(
            manager.connect(options()).unwrap_err(),
            SyncError::AlreadyConnected
        );

        manager.disconnect().unwrap();
        manager.disconnect().unwrap();
        assert!(manager.session().unwrap().is_none());
        manager.connect(options()).unwrap();
    }

    #[test]
    fn test_connect_persists_options_with_client() {
        let store = Arc::new(MemoryStore::new());
        let manager = SessionManager::new(store);
        let session = manager.connect(options()).unwrap();

        let stored = manager.stored_options().unwrap().unwrap();
        let client = stored.client.unwrap();
        assert_eq!(client.id, session.client.id);
        assert_eq!(client.id.len(), 12);
    }

    #[test]
    fn test_storage_url_slot() {
        let manager = SessionManager::new(Arc::new(MemoryStore::new()));
        let session = manager.connect(options()).unwrap();
        assert_eq!(session.storage_url().unwrap(), None);
        session
            .set_storage_url("http://node/1.0".into())
            .unwrap();
        assert_eq!(
            session.storage_url().unwrap().as_deref(),
            Some("http://node/1.0")
        );
    }
}
