//! Sync engines and the per-session orchestrator.
//!
//! [`SyncEngine::connect`] performs the whole session setup: node
//! discovery, storage version check, key material, and the client
//! record. Each call to [`SyncEngine::sync`] then runs one round of
//! every collection engine, sequentially.

pub mod bookmarks;
pub mod tabs;

pub use bookmarks::{BookmarkModel, BookmarkReconciler, BookmarkSync, StoredRecord};
pub use tabs::{build_own_record, TabsModel, TabsSync};

use std::sync::Arc;

use tracing::{debug, info};

use crate::client::{CollectionOptions, StorageClient};
use crate::host::{BookmarkHost, TabHost};
use crate::keys::KeyManager;
use crate::record::RecordData;
use crate::session::{ConnectOptions, SessionManager};
use crate::store::LocalStore;
use crate::Result;

pub struct SyncEngine {
    client: Arc<StorageClient>,
    keys: Arc<KeyManager>,
    bookmarks: BookmarkSync,
    tabs: TabsSync,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine").finish_non_exhaustive()
    }
}

impl SyncEngine {
    /// Connects a session and prepares it end to end. On any failure
    /// the session is torn down again, so a retry starts clean.
    pub async fn connect(
        sessions: &SessionManager,
        options: ConnectOptions,
        bookmark_host: Arc<dyn BookmarkHost>,
        tab_host: Arc<dyn TabHost>,
        store: Arc<dyn LocalStore>,
    ) -> Result<Self> {
        let session = sessions.connect(options)?;
        let setup = async {
            let client = Arc::new(StorageClient::new(session)?);
            client.ensure_user_storage_node().await?;
            let strategy = client.check_storage_version().await?;
            let keys = Arc::new(KeyManager::new(Arc::clone(&client), strategy));
            keys.ensure_keys().await?;

            let engine = Self {
                bookmarks: BookmarkSync::new(
                    Arc::clone(&client),
                    Arc::clone(&keys),
                    bookmark_host,
                    Arc::clone(&store),
                ),
                tabs: TabsSync::new(
                    Arc::clone(&client),
                    Arc::clone(&keys),
                    tab_host,
                    store,
                ),
                client,
                keys,
            };
            engine.ensure_client_record().await?;
            info!("sync engine ready");
            Ok(engine)
        };
        match setup.await {
            Ok(engine) => Ok(engine),
            Err(e) => {
                sessions.disconnect()?;
                Err(e)
            }
        }
    }

    /// Registers this device in the `clients` collection unless the
    /// server already knows it.
    async fn ensure_client_record(&self) -> Result<()> {
        let ids: Vec<String> = self
            .client
            .load_collection("clients", &CollectionOptions::default())
            .await?;
        let record = self.client.session().client.clone();
        if ids.iter().any(|id| *id == record.id) {
            debug!(id = %record.id, "client record already present");
            return Ok(());
        }
        debug!(id = %record.id, "registering client record");
        self.client
            .encrypt_post_collection(&self.keys, "clients", &[RecordData::Client(record)])
            .await?;
        Ok(())
    }

    /// Runs one sync round over every collection engine.
    pub async fn sync(&self) -> Result<()> {
        self.tabs.sync().await?;
        self.bookmarks.sync().await?;
        info!("sync round complete");
        Ok(())
    }

    pub fn client(&self) -> &Arc<StorageClient> {
        &self.client
    }

    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }
}
