//! HTTP storage client.
//!
//! Speaks the 1.0 storage API: node discovery, global metadata, the key
//! material endpoints and collection load/post. All requests except node
//! discovery authenticate with Basic credentials built from the
//! wire-encoded username.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tracing::{debug, trace, warn};

use crate::codec;
use crate::keys::{KeyManager, KeyStrategy};
use crate::record::{MetaGlobal, RecordData, Wbo};
use crate::session::Session;
use crate::{Result, SyncError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Query options for collection GETs. Each set option becomes one
/// `key=value` pair; `full` is flag-like and sent as `full=1`.
#[derive(Debug, Clone, Default)]
pub struct CollectionOptions {
    pub full: bool,
    pub newer: Option<f64>,
    pub limit: Option<u32>,
    pub sort: Option<String>,
    pub ids: Option<Vec<String>>,
}

impl CollectionOptions {
    pub fn full() -> Self {
        Self {
            full: true,
            ..Default::default()
        }
    }

    pub fn query_string(&self) -> String {
        let mut pairs = Vec::new();
        if self.full {
            pairs.push("full=1".to_string());
        }
        if let Some(newer) = self.newer {
            pairs.push(format!("newer={newer}"));
        }
        if let Some(limit) = self.limit {
            pairs.push(format!("limit={limit}"));
        }
        if let Some(sort) = &self.sort {
            pairs.push(format!("sort={sort}"));
        }
        if let Some(ids) = &self.ids {
            pairs.push(format!("ids={}", ids.join(",")));
        }
        if pairs.is_empty() {
            String::new()
        } else {
            format!("?{}", pairs.join("&"))
        }
    }
}

pub struct StorageClient {
    http: reqwest::Client,
    session: Arc<Session>,
}

impl StorageClient {
    pub fn new(session: Arc<Session>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| SyncError::RequestError(e.to_string()))?;
        Ok(Self { http, session })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Resolves the user's storage node, unauthenticated. A non-success
    /// status or empty body falls back to the configured server.
    pub async fn get_user_storage_node(&self) -> Result<String> {
        let url = format!(
            "{}/user/1.0/{}/node/weave",
            self.session.server, self.session.wire_user
        );
        let resolved = match self.http.get(&url).send().await {
            Ok(resp) if resp.status() == StatusCode::OK => {
                let body = resp
                    .text()
                    .await
                    .map_err(|e| SyncError::RequestError(e.to_string()))?;
                let node = body.trim();
                if node.is_empty() {
                    warn!("node discovery returned empty body, using configured server");
                    self.session.server.clone()
                } else {
                    node.trim_end_matches('/').to_string()
                }
            }
            Ok(resp) => {
                warn!(status = resp.status().as_u16(), "node discovery failed, using configured server");
                self.session.server.clone()
            }
            Err(e) => return Err(SyncError::RequestError(e.to_string())),
        };
        debug!(node = %resolved, "storage node resolved");
        self.session.set_storage_url(resolved.clone())?;
        Ok(resolved)
    }

    /// Node discovery, cached for the life of the session.
    pub async fn ensure_user_storage_node(&self) -> Result<String> {
        if let Some(url) = self.session.storage_url()? {
            return Ok(url);
        }
        self.get_user_storage_node().await
    }

    fn storage_base(&self) -> Result<String> {
        self.session.storage_url()?.ok_or(SyncError::MissingStorageUrl)
    }

    fn storage_path(&self, suffix: &str) -> Result<String> {
        Ok(format!(
            "{}/1.0/{}/storage/{}",
            self.storage_base()?,
            self.session.wire_user,
            suffix
        ))
    }

    /// URI identifying the bulk key that protects a collection in the
    /// legacy scheme.
    pub fn crypto_key_uri(&self, collection: &str) -> Result<String> {
        self.storage_path(&format!("crypto/{collection}"))
    }

    async fn get_json_url<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        trace!(%url, "GET");
        let resp = self
            .http
            .get(url)
            .basic_auth(&self.session.wire_user, Some(&self.session.password))
            .send()
            .await
            .map_err(|e| SyncError::RequestError(e.to_string()))?;
        if resp.status() != StatusCode::OK {
            return Err(SyncError::HttpStatusError(resp.status().as_u16()));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| SyncError::RequestError(e.to_string()))?;
        serde_json::from_str(&body).map_err(|e| SyncError::JsonError(e.to_string()))
    }

    /// Fetches a single record by its storage path (e.g. `meta/global`).
    pub async fn get_record(&self, path: &str) -> Result<Wbo> {
        let url = self.storage_path(path)?;
        self.get_json_url(&url).await
    }

    /// Fetches a record by absolute URL. Used for legacy key URIs, which
    /// the server hands out fully qualified.
    pub async fn get_record_absolute(&self, url: &str) -> Result<Wbo> {
        self.get_json_url(url).await
    }

    /// Checks the server's `meta/global` storage version and selects the
    /// matching key strategy.
    pub async fn check_storage_version(&self) -> Result<KeyStrategy> {
        let wbo = self.get_record("meta/global").await?;
        let meta: MetaGlobal = serde_json::from_str(&wbo.payload)
            .map_err(|e| SyncError::JsonError(e.to_string()))?;
        let strategy = KeyStrategy::for_storage_version(meta.storage_version).ok_or(
            SyncError::StorageVersionMismatch {
                server: meta.storage_version,
            },
        )?;
        debug!(version = meta.storage_version, ?strategy, "storage version accepted");
        Ok(strategy)
    }

    /// GETs a collection. With `full` unset the server returns bare ids,
    /// so the element type is caller-chosen.
    pub async fn load_collection<T: DeserializeOwned>(
        &self,
        collection: &str,
        options: &CollectionOptions,
    ) -> Result<Vec<T>> {
        let url = format!(
            "{}{}",
            self.storage_path(collection)?,
            options.query_string()
        );
        self.get_json_url(&url).await
    }

    /// POSTs records to a collection, serializing only the record wire
    /// fields. Returns the server's status body.
    pub async fn post_collection(
        &self,
        collection: &str,
        records: &[Wbo],
    ) -> Result<serde_json::Value> {
        let url = self.storage_path(collection)?;
        trace!(%url, count = records.len(), "POST");
        let body =
            serde_json::to_string(records).map_err(|e| SyncError::JsonError(e.to_string()))?;
        let resp = self
            .http
            .post(&url)
            .basic_auth(&self.session.wire_user, Some(&self.session.password))
            .body(body)
            .send()
            .await
            .map_err(|e| SyncError::RequestError(e.to_string()))?;
        if resp.status() != StatusCode::OK {
            return Err(SyncError::HttpStatusError(resp.status().as_u16()));
        }
        let text = resp
            .text()
            .await
            .map_err(|e| SyncError::RequestError(e.to_string()))?;
        serde_json::from_str(&text).map_err(|e| SyncError::JsonError(e.to_string()))
    }

    /// Loads a collection and decrypts every record. The first record
    /// that fails integrity or decryption aborts the whole batch.
    pub async fn load_collection_decrypt(
        &self,
        keys: &KeyManager,
        collection: &str,
        options: &CollectionOptions,
    ) -> Result<Vec<(Wbo, RecordData)>> {
        let wbos: Vec<Wbo> = self.load_collection(collection, options).await?;
        let mut out = Vec::with_capacity(wbos.len());
        for wbo in wbos {
            let data = codec::decrypt_wbo(keys, collection, &wbo).await?;
            out.push((wbo, data));
        }
        Ok(out)
    }

    /// Encrypts and POSTs a batch. An empty batch is a trivial success
    /// and performs no network call.
    pub async fn encrypt_post_collection(
        &self,
        keys: &KeyManager,
        collection: &str,
        records: &[RecordData],
    ) -> Result<serde_json::Value> {
        if records.is_empty() {
            return Ok(serde_json::json!({"success": [], "failed": {}}));
        }
        let mut wbos = Vec::with_capacity(records.len());
        for record in records {
            wbos.push(codec::encrypt_wbo(keys, collection, record).await?);
        }
        self.post_collection(collection, &wbos).await
    }
}
