//! Host integration traits.
//!
//! The engines never touch the browser directly; they go through a
//! bookmark tree provider and a tab enumerator. In-memory
//! implementations are provided for tests and headless use.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::{Result, SyncError};

/// Local node identity assigned by the host.
pub type NodeId = String;

/// The host's fixed root containers.
#[derive(Debug, Clone)]
pub struct RootNodes {
    pub places: NodeId,
    pub menu: NodeId,
    pub toolbar: NodeId,
    pub unfiled: NodeId,
    pub mobile: NodeId,
}

/// One node of the host's bookmark tree.
#[derive(Debug, Clone)]
pub struct BookmarkNode {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    pub title: String,
    /// `None` for folders.
    pub url: Option<String>,
    pub children: Vec<NodeId>,
}

/// Parameters for creating a node.
#[derive(Debug, Clone)]
pub struct NewNode {
    pub parent: NodeId,
    pub title: String,
    pub url: Option<String>,
}

/// A bookmark tree provider. Mutations are serialized by the host; the
/// engine issues one at a time.
#[async_trait]
pub trait BookmarkHost: Send + Sync {
    async fn roots(&self) -> Result<RootNodes>;
    /// Enumerates the whole tree as a flat list with parent links.
    async fn tree(&self) -> Result<Vec<BookmarkNode>>;
    async fn create(&self, node: NewNode) -> Result<NodeId>;
    async fn update(&self, id: &str, title: Option<&str>, url: Option<&str>) -> Result<()>;
    async fn relocate(&self, id: &str, new_parent: &str) -> Result<()>;
    async fn remove(&self, id: &str) -> Result<()>;
}

/// One open tab as reported by the host.
#[derive(Debug, Clone)]
pub struct HostTab {
    pub title: String,
    pub url: String,
    pub icon: Option<String>,
}

/// Enumerates the open windows and their tabs.
#[async_trait]
pub trait TabHost: Send + Sync {
    async fn windows(&self) -> Result<Vec<Vec<HostTab>>>;
}

struct BookmarkState {
    nodes: HashMap<NodeId, BookmarkNode>,
    next_id: u64,
}

/// In-memory bookmark tree with the standard root containers seeded.
pub struct MemoryBookmarks {
    state: Mutex<BookmarkState>,
}

impl Default for MemoryBookmarks {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBookmarks {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            "0".to_string(),
            BookmarkNode {
                id: "0".into(),
                parent: None,
                title: String::new(),
                url: None,
                children: vec!["1".into(), "2".into(), "3".into(), "4".into()],
            },
        );
        for (id, title) in [
            ("1", "Bookmarks Menu"),
            ("2", "Bookmarks Toolbar"),
            ("3", "Unsorted Bookmarks"),
            ("4", "Mobile Bookmarks"),
        ] {
            nodes.insert(
                id.to_string(),
                BookmarkNode {
                    id: id.into(),
                    parent: Some("0".into()),
                    title: title.into(),
                    url: None,
                    children: Vec::new(),
                },
            );
        }
        Self {
            state: Mutex::new(BookmarkState { nodes, next_id: 5 }),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BookmarkState>> {
        self.state
            .lock()
            .map_err(|_| SyncError::Host("bookmark state lock poisoned".into()))
    }
}

#[async_trait]
impl BookmarkHost for MemoryBookmarks {
    async fn roots(&self) -> Result<RootNodes> {
        Ok(RootNodes {
            places: "0".into(),
            menu: "1".into(),
            toolbar: "2".into(),
            unfiled: "3".into(),
            mobile: "4".into(),
        })
    }

    async fn tree(&self) -> Result<Vec<BookmarkNode>> {
        let state = self.lock()?;
        Ok(state.nodes.values().cloned().collect())
    }

    async fn create(&self, node: NewNode) -> Result<NodeId> {
        let mut state = self.lock()?;
        if !state.nodes.contains_key(&node.parent) {
            return Err(SyncError::Host(format!("no such parent: {}", node.parent)));
        }
        let id = state.next_id.to_string();
        state.next_id += 1;
        state.nodes.insert(
            id.clone(),
            BookmarkNode {
                id: id.clone(),
                parent: Some(node.parent.clone()),
                title: node.title,
                url: node.url,
                children: Vec::new(),
            },
        );
        if let Some(parent) = state.nodes.get_mut(&node.parent) {
            parent.children.push(id.clone());
        }
        Ok(id)
    }

    async fn update(&self, id: &str, title: Option<&str>, url: Option<&str>) -> Result<()> {
        let mut state = self.lock()?;
        let node = state
            .nodes
            .get_mut(id)
            .ok_or_else(|| SyncError::Host(format!("no such node: {id}")))?;
        if let Some(title) = title {
            node.title = title.to_string();
        }
        if let Some(url) = url {
            node.url = Some(url.to_string());
        }
        Ok(())
    }

    async fn relocate(&self, id: &str, new_parent: &str) -> Result<()> {
        let mut state = self.lock()?;
        if !state.nodes.contains_key(id) {
            return Err(SyncError::Host(format!("no such node: {id}")));
        }
        if !state.nodes.contains_key(new_parent) {
            return Err(SyncError::Host(format!("no such parent: {new_parent}")));
        }
        let old_parent = state
            .nodes
            .get(id)
            .and_then(|n| n.parent.clone());
        if let Some(old) = old_parent {
            if let Some(parent) = state.nodes.get_mut(&old) {
                parent.children.retain(|c| c != id);
            }
        }
        if let Some(parent) = state.nodes.get_mut(new_parent) {
            parent.children.push(id.to_string());
        }
        if let Some(node) = state.nodes.get_mut(id) {
            node.parent = Some(new_parent.to_string());
        }
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let mut state = self.lock()?;
        let node = state
            .nodes
            .remove(id)
            .ok_or_else(|| SyncError::Host(format!("no such node: {id}")))?;
        if let Some(parent) = node.parent.as_ref().and_then(|p| state.nodes.get_mut(p)) {
            parent.children.retain(|c| c != id);
        }
        // Orphan any children rather than cascading.
        for child in node.children {
            if let Some(c) = state.nodes.get_mut(&child) {
                c.parent = None;
            }
        }
        Ok(())
    }
}

/// In-memory tab enumerator.
#[derive(Default)]
pub struct MemoryTabs {
    windows: Mutex<Vec<Vec<HostTab>>>,
}

impl MemoryTabs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_windows(&self, windows: Vec<Vec<HostTab>>) -> Result<()> {
        let mut slot = self
            .windows
            .lock()
            .map_err(|_| SyncError::Host("tab state lock poisoned".into()))?;
        *slot = windows;
        Ok(())
    }
}

#[async_trait]
impl TabHost for MemoryTabs {
    async fn windows(&self) -> Result<Vec<Vec<HostTab>>> {
        let slot = self
            .windows
            .lock()
            .map_err(|_| SyncError::Host("tab state lock poisoned".into()))?;
        Ok(slot.clone())
    }
}
