//! Wire record types.
//!
//! Everything a collection stores is a WBO: an id, a server-assigned
//! modification timestamp, an optional sort index and an opaque payload
//! string. For encrypted collections the payload is the JSON text of a
//! [`CryptoEnvelope`]; the envelope's ciphertext decrypts to the JSON
//! text of one of the per-collection cleartext schemas below.
//!
//! Serialization goes through explicit structs so only known fields ever
//! reach the wire.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::SyncError;

/// Timestamps are seconds since the epoch with centisecond precision.
pub fn timestamp_now() -> f64 {
    let millis = chrono::Utc::now().timestamp_millis();
    (millis as f64 / 10.0).round() / 100.0
}

/// A Basic Object, the atomic unit of collection storage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Wbo {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sortindex: Option<i64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub payload: String,
}

impl Wbo {
    pub fn new(id: impl Into<String>, payload: String) -> Self {
        Self {
            id: id.into(),
            modified: None,
            sortindex: None,
            payload,
        }
    }
}

/// The encrypted payload envelope.
///
/// `encryption` is only present in the legacy scheme, where it carries
/// the URI of the wrapped bulk key protecting this record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CryptoEnvelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption: Option<String>,
    pub ciphertext: String,
    #[serde(rename = "IV")]
    pub iv: String,
    pub hmac: String,
}

/// Cleartext of the `crypto/keys` keyring record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysCleartext {
    /// Base64 (encryption, hmac) key pair used by collections without
    /// their own entry.
    pub default: Vec<String>,
    #[serde(default)]
    pub collections: HashMap<String, Vec<String>>,
}

/// Payload of the `meta/global` record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaGlobal {
    #[serde(rename = "storageVersion")]
    pub storage_version: u32,
    #[serde(rename = "syncID", default, skip_serializing_if = "Option::is_none")]
    pub sync_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookmarkKind {
    Bookmark,
    #[default]
    Folder,
    /// Separators, queries, livemarks. Preserved but never materialized
    /// as local nodes.
    #[serde(other)]
    Other,
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// Cleartext schema of a `bookmarks` record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BookmarkRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub deleted: bool,
    #[serde(rename = "type", default)]
    pub kind: BookmarkKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(rename = "bmkUri", skip_serializing_if = "Option::is_none")]
    pub bmk_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "loadInSidebar", skip_serializing_if = "Option::is_none")]
    pub load_in_sidebar: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyword: Option<String>,
    #[serde(rename = "parentName", skip_serializing_if = "Option::is_none")]
    pub parent_name: Option<String>,
    #[serde(rename = "predecessorid", skip_serializing_if = "Option::is_none")]
    pub predecessor_id: Option<String>,
}

impl BookmarkRecord {
    pub fn new(id: impl Into<String>, kind: BookmarkKind) -> Self {
        Self {
            id: id.into(),
            deleted: false,
            kind,
            title: None,
            bmk_uri: None,
            description: None,
            load_in_sidebar: None,
            tags: None,
            keyword: None,
            parent_name: None,
            predecessor_id: None,
        }
    }

    /// Merges every populated incoming field onto `self`, keeping fields
    /// the incoming record leaves unset.
    pub fn merge_from(&mut self, incoming: &BookmarkRecord) {
        self.deleted = incoming.deleted;
        self.kind = incoming.kind;
        merge(&mut self.title, &incoming.title);
        merge(&mut self.bmk_uri, &incoming.bmk_uri);
        merge(&mut self.description, &incoming.description);
        merge(&mut self.load_in_sidebar, &incoming.load_in_sidebar);
        merge(&mut self.tags, &incoming.tags);
        merge(&mut self.keyword, &incoming.keyword);
        merge(&mut self.parent_name, &incoming.parent_name);
        merge(&mut self.predecessor_id, &incoming.predecessor_id);
    }
}

fn merge<T: Clone>(slot: &mut Option<T>, incoming: &Option<T>) {
    if let Some(v) = incoming {
        *slot = Some(v.clone());
    }
}

/// One open tab inside a device's tabs record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TabEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(rename = "urlHistory")]
    pub url_history: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(rename = "lastUsed", skip_serializing_if = "Option::is_none")]
    pub last_used: Option<f64>,
}

/// Cleartext schema of a `tabs` record: one record per device, holding
/// that device's full tab list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TabsRecord {
    pub id: String,
    #[serde(rename = "clientName")]
    pub client_name: String,
    pub tabs: Vec<TabEntry>,
}

/// Cleartext schema of a `clients` record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientRecord {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub client_type: String,
    /// Commands queued for this device by its peers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commands: Option<Vec<serde_json::Value>>,
}

/// Decrypted record cleartext, dispatched on the owning collection.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordData {
    Bookmark(BookmarkRecord),
    Tabs(TabsRecord),
    Client(ClientRecord),
}

impl RecordData {
    /// Parses decrypted cleartext according to the collection's schema.
    pub fn from_cleartext(collection: &str, text: &str) -> crate::Result<Self> {
        let parse_err = |e: serde_json::Error| SyncError::JsonError(e.to_string());
        match collection {
            "bookmarks" => Ok(Self::Bookmark(serde_json::from_str(text).map_err(parse_err)?)),
            "tabs" => Ok(Self::Tabs(serde_json::from_str(text).map_err(parse_err)?)),
            "clients" => Ok(Self::Client(serde_json::from_str(text).map_err(parse_err)?)),
            other => Err(SyncError::JsonError(format!(
                "no cleartext schema for collection {other:?}"
            ))),
        }
    }

    /// Serializes only the collection's schema fields to cleartext JSON.
    pub fn to_cleartext(&self) -> crate::Result<String> {
        let ser_err = |e: serde_json::Error| SyncError::JsonError(e.to_string());
        match self {
            Self::Bookmark(r) => serde_json::to_string(r).map_err(ser_err),
            Self::Tabs(r) => serde_json::to_string(r).map_err(ser_err),
            Self::Client(r) => serde_json::to_string(r).map_err(ser_err),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Bookmark(r) => &r.id,
            Self::Tabs(r) => &r.id,
            Self::Client(r) => &r.id,
        }
    }
}
