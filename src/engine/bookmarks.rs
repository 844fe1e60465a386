//! Bookmark tree reconciliation.
//!
//! Incoming bookmark records form a flat batch; the local side is a
//! tree owned by the host. One sync round runs three phases:
//!
//! 1. **Apply**: create, update or delete one local node per record,
//!    last-writer-wins on the record timestamp.
//! 2. **Reorder**: after the whole batch has been applied, walk the
//!    live tree and move any node whose mapped record names a different
//!    parent. Runs even for an empty batch, so a round with no incoming
//!    records still repairs structural drift.
//! 3. **Outgoing**: walk the tree for nodes with no mapped record and
//!    generate records for them.
//!
//! Identity continuity lives in the model's mapping tables; root
//! containers are seeded into them up front and are never deleted.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::client::{CollectionOptions, StorageClient};
use crate::host::{BookmarkHost, BookmarkNode, NewNode, NodeId, RootNodes};
use crate::keys::KeyManager;
use crate::record::{timestamp_now, BookmarkKind, BookmarkRecord, RecordData};
use crate::store::{get_json, set_json, LocalStore};
use crate::Result;

const MODEL_SLOT: &str = "bookmarks.model";

/// Record id of the default insertion container for records whose
/// parent is unmapped.
const DEFAULT_CONTAINER: &str = "unfiled";

/// A known record plus its local bindings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRecord {
    pub modified: f64,
    /// Local node, absent for record kinds that are never materialized.
    pub node: Option<NodeId>,
    #[serde(flatten)]
    pub record: BookmarkRecord,
}

/// The local bookmark model: every known record, the folder-title and
/// node-identity mapping tables, and the seeded root containers.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct BookmarkModel {
    pub records: HashMap<String, StoredRecord>,
    /// Folder title to local node, used to resolve `parentName` links.
    pub folders: HashMap<String, NodeId>,
    pub node_to_record: HashMap<NodeId, String>,
    /// Root record id to its fixed local node. Entries here are
    /// protected from deletion and re-creation.
    pub roots: HashMap<String, NodeId>,
}

impl BookmarkModel {
    /// Builds a model with the well-known containers pre-mapped to the
    /// host's fixed root nodes.
    pub fn seeded(roots: &RootNodes) -> Self {
        let mut model = Self::default();
        let seeds: [(&str, &[&str], &NodeId); 5] = [
            ("places", &["places"], &roots.places),
            ("menu", &["menu", "Bookmarks Menu"], &roots.menu),
            ("toolbar", &["toolbar", "Bookmarks Toolbar"], &roots.toolbar),
            ("unfiled", &["unfiled", "Unsorted Bookmarks"], &roots.unfiled),
            ("mobile", &["mobile", "Mobile Bookmarks"], &roots.mobile),
        ];
        for (record_id, titles, node) in seeds {
            let mut record = BookmarkRecord::new(record_id, BookmarkKind::Folder);
            record.title = Some(titles[titles.len() - 1].to_string());
            model.records.insert(
                record_id.to_string(),
                StoredRecord {
                    modified: 0.0,
                    node: Some(node.clone()),
                    record,
                },
            );
            model.node_to_record.insert(node.clone(), record_id.to_string());
            for title in titles {
                model.folders.insert(title.to_string(), node.clone());
            }
            model.roots.insert(record_id.to_string(), node.clone());
        }
        model
    }

    pub fn is_root(&self, record_id: &str) -> bool {
        self.roots.contains_key(record_id)
    }

    /// The node new records land under when their parent is unmapped.
    fn default_parent(&self) -> Option<NodeId> {
        self.roots.get(DEFAULT_CONTAINER).cloned()
    }

    fn parent_for(&self, record: &BookmarkRecord) -> Option<NodeId> {
        record
            .parent_name
            .as_deref()
            .and_then(|name| self.folders.get(name).cloned())
            .or_else(|| self.default_parent())
    }
}

/// Applies incoming batches to the model and tree, and generates the
/// outgoing records.
pub struct BookmarkReconciler {
    host: Arc<dyn BookmarkHost>,
}

impl BookmarkReconciler {
    pub fn new(host: Arc<dyn BookmarkHost>) -> Self {
        Self { host }
    }

    /// Runs one full reconciliation round over an incoming batch.
    pub async fn reconcile(
        &self,
        model: &mut BookmarkModel,
        batch: &[(f64, BookmarkRecord)],
    ) -> Result<()> {
        self.apply_batch(model, batch).await?;
        // Reorder is unconditional: an empty batch must not skip it.
        self.reorder(model).await
    }

    /// Apply phase: one create/update/delete per incoming record.
    pub async fn apply_batch(
        &self,
        model: &mut BookmarkModel,
        batch: &[(f64, BookmarkRecord)],
    ) -> Result<()> {
        debug!(records = batch.len(), "applying bookmark batch");
        for (modified, incoming) in batch {
            self.apply_one(model, *modified, incoming).await?;
        }
        Ok(())
    }

    async fn apply_one(
        &self,
        model: &mut BookmarkModel,
        modified: f64,
        incoming: &BookmarkRecord,
    ) -> Result<()> {
        let id = incoming.id.clone();
        let stored_modified = model.records.get(&id).map(|s| s.modified);
        match stored_modified {
            None => {
                if incoming.deleted {
                    trace!(%id, "tombstone for unknown record, ignored");
                    return Ok(());
                }
                self.create(model, modified, incoming).await
            }
            Some(_) if incoming.deleted => self.delete(model, &id).await,
            Some(stored) if modified > stored => {
                self.update(model, &id, modified, incoming).await
            }
            Some(stored) => {
                trace!(%id, incoming = modified, stored, "stale update discarded");
                Ok(())
            }
        }
    }

    async fn create(
        &self,
        model: &mut BookmarkModel,
        modified: f64,
        incoming: &BookmarkRecord,
    ) -> Result<()> {
        let node = match incoming.kind {
            BookmarkKind::Other => None,
            kind => {
                let Some(parent) = model.parent_for(incoming) else {
                    warn!(id = %incoming.id, "no insertion container, record kept unmaterialized");
                    return self.register_only(model, modified, incoming);
                };
                let title = incoming
                    .title
                    .clone()
                    .or_else(|| incoming.bmk_uri.clone())
                    .unwrap_or_default();
                let url = match kind {
                    BookmarkKind::Bookmark => incoming.bmk_uri.clone(),
                    _ => None,
                };
                let node = self
                    .host
                    .create(NewNode { parent, title, url })
                    .await?;
                trace!(id = %incoming.id, %node, "node created");
                Some(node)
            }
        };

        if let Some(node) = &node {
            model.node_to_record.insert(node.clone(), incoming.id.clone());
            if incoming.kind == BookmarkKind::Folder {
                if let Some(title) = &incoming.title {
                    model.folders.insert(title.clone(), node.clone());
                }
            }
        }
        model.records.insert(
            incoming.id.clone(),
            StoredRecord {
                modified,
                node,
                record: incoming.clone(),
            },
        );
        Ok(())
    }

    fn register_only(
        &self,
        model: &mut BookmarkModel,
        modified: f64,
        incoming: &BookmarkRecord,
    ) -> Result<()> {
        model.records.insert(
            incoming.id.clone(),
            StoredRecord {
                modified,
                node: None,
                record: incoming.clone(),
            },
        );
        Ok(())
    }

    async fn delete(&self, model: &mut BookmarkModel, id: &str) -> Result<()> {
        if model.is_root(id) {
            warn!(%id, "deletion of root container refused");
            return Ok(());
        }
        let Some(stored) = model.records.remove(id) else {
            return Ok(());
        };
        if let Some(node) = &stored.node {
            model.node_to_record.remove(node);
            if let Some(title) = &stored.record.title {
                if model.folders.get(title) == Some(node) {
                    model.folders.remove(title);
                }
            }
        }
        trace!(%id, "record deleted");
        if let Some(node) = &stored.node {
            self.host.remove(node).await?;
        }
        Ok(())
    }

    async fn update(
        &self,
        model: &mut BookmarkModel,
        id: &str,
        modified: f64,
        incoming: &BookmarkRecord,
    ) -> Result<()> {
        let (node, old_title, was_folder) = match model.records.get(id) {
            Some(stored) => (
                stored.node.clone(),
                stored.record.title.clone(),
                stored.record.kind == BookmarkKind::Folder,
            ),
            None => (None, None, false),
        };

        if let Some(node) = &node {
            self.host
                .update(
                    node,
                    incoming.title.as_deref(),
                    incoming.bmk_uri.as_deref(),
                )
                .await?;
            if was_folder {
                if let Some(new_title) = &incoming.title {
                    if old_title.as_deref() != Some(new_title.as_str()) {
                        if let Some(old) = &old_title {
                            if model.folders.get(old) == Some(node) {
                                model.folders.remove(old);
                            }
                        }
                        model.folders.insert(new_title.clone(), node.clone());
                    }
                }
            }
        }

        if let Some(stored) = model.records.get_mut(id) {
            stored.record.merge_from(incoming);
            stored.modified = modified;
        }
        trace!(%id, modified, "record updated");
        Ok(())
    }

    /// Reorder phase: move every mapped node whose record names a
    /// parent other than the node's current one.
    pub async fn reorder(&self, model: &BookmarkModel) -> Result<()> {
        let tree = self.host.tree().await?;
        for node in &tree {
            let Some(record_id) = model.node_to_record.get(&node.id) else {
                continue;
            };
            if model.is_root(record_id) {
                continue;
            }
            let Some(stored) = model.records.get(record_id) else {
                continue;
            };
            let Some(wanted) = stored
                .record
                .parent_name
                .as_deref()
                .and_then(|name| model.folders.get(name))
            else {
                continue;
            };
            if node.parent.as_ref() != Some(wanted) && node.id != *wanted {
                debug!(node = %node.id, record = %record_id, parent = %wanted, "relocating node");
                self.host.relocate(&node.id, wanted).await?;
            }
        }
        Ok(())
    }

    /// Outgoing phase: generate records for local nodes the model has
    /// never seen, registering them so they are pushed exactly once.
    pub async fn collect_outgoing(&self, model: &mut BookmarkModel) -> Result<Vec<RecordData>> {
        let tree = self.host.tree().await?;
        let by_id: HashMap<&NodeId, &BookmarkNode> = tree.iter().map(|n| (&n.id, n)).collect();

        // Parents before children so parentName links resolve.
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = model.roots.values().cloned().collect();
        let mut seen = std::collections::HashSet::new();
        while let Some(id) = stack.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            let Some(node) = by_id.get(&id) else { continue };
            for child in node.children.iter().rev() {
                stack.push(child.clone());
            }
            if model.node_to_record.contains_key(&node.id) {
                continue;
            }

            let record_id = format!("{{{}}}", Uuid::new_v4());
            let kind = if node.url.is_some() {
                BookmarkKind::Bookmark
            } else {
                BookmarkKind::Folder
            };
            let mut record = BookmarkRecord::new(record_id.clone(), kind);
            record.title = Some(node.title.clone());
            record.bmk_uri = node.url.clone();
            record.parent_name = node
                .parent
                .as_ref()
                .and_then(|p| model.node_to_record.get(p))
                .and_then(|rid| model.records.get(rid))
                .and_then(|stored| stored.record.title.clone());

            model.node_to_record.insert(node.id.clone(), record_id.clone());
            if kind == BookmarkKind::Folder {
                if let Some(title) = &record.title {
                    model.folders.insert(title.clone(), node.id.clone());
                }
            }
            model.records.insert(
                record_id,
                StoredRecord {
                    modified: timestamp_now(),
                    node: Some(node.id.clone()),
                    record: record.clone(),
                },
            );
            out.push(RecordData::Bookmark(record));
        }
        debug!(outgoing = out.len(), "new local bookmarks collected");
        Ok(out)
    }
}

/// One collection engine: load-decrypt, reconcile, push.
pub struct BookmarkSync {
    client: Arc<StorageClient>,
    keys: Arc<KeyManager>,
    host: Arc<dyn BookmarkHost>,
    store: Arc<dyn LocalStore>,
}

impl BookmarkSync {
    pub fn new(
        client: Arc<StorageClient>,
        keys: Arc<KeyManager>,
        host: Arc<dyn BookmarkHost>,
        store: Arc<dyn LocalStore>,
    ) -> Self {
        Self {
            client,
            keys,
            host,
            store,
        }
    }

    async fn load_model(&self) -> Result<BookmarkModel> {
        if let Some(model) = get_json(self.store.as_ref(), MODEL_SLOT)? {
            return Ok(model);
        }
        let roots = self.host.roots().await?;
        Ok(BookmarkModel::seeded(&roots))
    }

    pub async fn sync(&self) -> Result<()> {
        let mut model = self.load_model().await?;
        let incoming = self
            .client
            .load_collection_decrypt(&self.keys, "bookmarks", &CollectionOptions::full())
            .await?;

        let batch: Vec<(f64, BookmarkRecord)> = incoming
            .into_iter()
            .filter_map(|(wbo, data)| match data {
                RecordData::Bookmark(record) => {
                    Some((wbo.modified.unwrap_or_else(timestamp_now), record))
                }
                _ => None,
            })
            .collect();

        let reconciler = BookmarkReconciler::new(Arc::clone(&self.host));
        reconciler.reconcile(&mut model, &batch).await?;
        let outgoing = reconciler.collect_outgoing(&mut model).await?;
        self.client
            .encrypt_post_collection(&self.keys, "bookmarks", &outgoing)
            .await?;

        set_json(self.store.as_ref(), MODEL_SLOT, &model)?;
        debug!("bookmark sync round complete");
        Ok(())
    }
}
