//! Client engine for the Weave encrypted record-synchronization protocol.
//!
//! Collections of small JSON records (WBOs) live on a remote storage node,
//! each record's body encrypted and integrity-protected with per-collection
//! keys ultimately derived from a user passphrase. This crate provides:
//! - session/credential management ([`session`])
//! - key derivation and caching with single-flight fetch coalescing ([`keys`])
//! - the encrypt/verify/decrypt record envelope ([`codec`])
//! - the authenticated collection load/post protocol ([`client`])
//! - per-collection sync engines, including the bookmark-tree
//!   reconciliation ([`engine`])
//!
//! The host environment supplies the persisted key-value store and the
//! bookmark/tab providers through the [`store`] and [`host`] traits.

pub mod client;
pub mod codec;
pub mod crypto;
pub mod engine;
pub mod host;
pub mod keys;
pub mod record;
pub mod session;
pub mod store;

pub use client::{CollectionOptions, StorageClient};
pub use crypto::{CryptoError, KeyBundle};
pub use engine::SyncEngine;
pub use keys::{KeyManager, KeyStrategy};
pub use record::{BookmarkRecord, ClientRecord, RecordData, TabsRecord, Wbo};
pub use session::{ConnectOptions, Session, SessionManager};
pub use store::{LocalStore, MemoryStore};

use thiserror::Error;

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors reported by the sync engine.
///
/// `Clone` on purpose: a single key fetch may have several queued waiters,
/// and each of them receives the failure (transport details are therefore
/// carried as strings rather than source errors).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("a session is already active")]
    AlreadyConnected,

    #[error("no server URL configured")]
    MissingServer,

    #[error("username or password missing")]
    MissingCredentials,

    #[error("storage node has not been resolved")]
    MissingStorageUrl,

    #[error("request failed: {0}")]
    RequestError(String),

    #[error("unexpected HTTP status {0}")]
    HttpStatusError(u16),

    #[error("invalid JSON: {0}")]
    JsonError(String),

    #[error("keyring failed HMAC verification")]
    KeyHmacFailed,

    #[error("record {id} failed HMAC verification")]
    WboHmacFailed { id: String },

    #[error("wrong passphrase")]
    WrongPassphrase,

    #[error("server storage version {server} is not supported")]
    StorageVersionMismatch { server: u32 },

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("host error: {0}")]
    Host(String),

    #[error("local store error: {0}")]
    Store(String),
}
