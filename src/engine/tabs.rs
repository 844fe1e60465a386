//! Tabs synchronization.
//!
//! Tabs are the simplest collection: one record per device, holding the
//! device's full tab list. Incoming records replace local entries
//! wholesale; there is nothing to merge. Each round ends by rebuilding
//! and pushing this device's own record from the host's open windows.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::client::{CollectionOptions, StorageClient};
use crate::host::{HostTab, TabHost};
use crate::keys::KeyManager;
use crate::record::{ClientRecord, RecordData, TabEntry, TabsRecord};
use crate::store::{get_json, set_json, LocalStore};
use crate::Result;

const MODEL_SLOT: &str = "tabs.model";

/// Every device's last known tab record, keyed by client id.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TabsModel {
    pub devices: HashMap<String, TabsRecord>,
}

impl TabsModel {
    /// Whole-record replacement: each incoming record displaces the
    /// stored one for its device.
    pub fn apply_incoming(&mut self, records: impl IntoIterator<Item = TabsRecord>) {
        for record in records {
            self.devices.insert(record.id.clone(), record);
        }
    }
}

/// Builds this device's outgoing record from the host's open windows,
/// keeping only fetchable (http/https) URLs.
pub fn build_own_record(client: &ClientRecord, windows: &[Vec<HostTab>]) -> TabsRecord {
    let now = chrono::Utc::now().timestamp_millis() as f64;
    let tabs = windows
        .iter()
        .flatten()
        .filter(|tab| tab.url.starts_with("http"))
        .map(|tab| TabEntry {
            title: Some(tab.title.clone()),
            url_history: vec![tab.url.clone()],
            icon: tab.icon.clone(),
            last_used: Some(now),
        })
        .collect();
    TabsRecord {
        id: client.id.clone(),
        client_name: client.name.clone(),
        tabs,
    }
}

pub struct TabsSync {
    client: Arc<StorageClient>,
    keys: Arc<KeyManager>,
    host: Arc<dyn TabHost>,
    store: Arc<dyn LocalStore>,
}

impl TabsSync {
    pub fn new(
        client: Arc<StorageClient>,
        keys: Arc<KeyManager>,
        host: Arc<dyn TabHost>,
        store: Arc<dyn LocalStore>,
    ) -> Self {
        Self {
            client,
            keys,
            host,
            store,
        }
    }

    pub async fn sync(&self) -> Result<()> {
        let mut model: TabsModel =
            get_json(self.store.as_ref(), MODEL_SLOT)?.unwrap_or_default();

        let incoming = self
            .client
            .load_collection_decrypt(&self.keys, "tabs", &CollectionOptions::full())
            .await?;
        model.apply_incoming(incoming.into_iter().filter_map(|(_, data)| match data {
            RecordData::Tabs(record) => Some(record),
            _ => None,
        }));

        let windows = self.host.windows().await?;
        let own = build_own_record(&self.client.session().client, &windows);
        debug!(devices = model.devices.len(), own_tabs = own.tabs.len(), "tabs reconciled");
        model.devices.insert(own.id.clone(), own.clone());
        set_json(self.store.as_ref(), MODEL_SLOT, &model)?;

        self.client
            .encrypt_post_collection(&self.keys, "tabs", &[RecordData::Tabs(own)])
            .await?;
        Ok(())
    }
}
