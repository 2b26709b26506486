//! Name→upstream routing tables, one per entity kind.
//!
//! Tables are cleared at the start of each aggregate listing and rebuilt
//! from successful responses only, so a stale entry survives at most until
//! the next listing or the lookup-miss rebuild path. Duplicate names
//! across upstreams resolve last-writer-wins. Readers take a snapshot at
//! lookup time and must tolerate the table being repopulated mid-request.

use std::collections::HashMap;

use tokio::sync::RwLock;

/// Which routing table an entity name lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Tool,
    Prompt,
    /// Resources route by URI; templates share this table's semantics.
    Resource,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Tool => "tool",
            EntityKind::Prompt => "prompt",
            EntityKind::Resource => "resource",
        }
    }
}

/// The three name→upstream maps owned by the registry.
#[derive(Default)]
pub struct RoutingTables {
    tools: RwLock<HashMap<String, String>>,
    prompts: RwLock<HashMap<String, String>>,
    resources: RwLock<HashMap<String, String>>,
}

impl RoutingTables {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, kind: EntityKind) -> &RwLock<HashMap<String, String>> {
        match kind {
            EntityKind::Tool => &self.tools,
            EntityKind::Prompt => &self.prompts,
            EntityKind::Resource => &self.resources,
        }
    }

    /// Clear a table at the start of an aggregate listing.
    pub async fn clear(&self, kind: EntityKind) {
        self.table(kind).write().await.clear();
    }

    /// Populate entries from one upstream's successful listing.
    /// Later writers overwrite earlier ones for duplicate names.
    pub async fn insert_many<I>(&self, kind: EntityKind, upstream: &str, names: I)
    where
        I: IntoIterator<Item = String>,
    {
        let mut table = self.table(kind).write().await;
        for name in names {
            table.insert(name, upstream.to_string());
        }
    }

    /// Snapshot lookup of the upstream owning `name`.
    pub async fn lookup(&self, kind: EntityKind, name: &str) -> Option<String> {
        self.table(kind).read().await.get(name).cloned()
    }

    /// Evict a single stale entry (tool-not-found path).
    pub async fn remove(&self, kind: EntityKind, name: &str) -> bool {
        self.table(kind).write().await.remove(name).is_some()
    }

    /// Drop every entry owned by `upstream` across all tables.
    pub async fn remove_upstream(&self, upstream: &str) {
        for kind in [EntityKind::Tool, EntityKind::Prompt, EntityKind::Resource] {
            self.table(kind)
                .write()
                .await
                .retain(|_, owner| owner != upstream);
        }
    }

    /// Full contents of one table, for the observability API.
    pub async fn entries(&self, kind: EntityKind) -> Vec<(String, String)> {
        self.table(kind)
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub async fn len(&self, kind: EntityKind) -> usize {
        self.table(kind).read().await.len()
    }

    pub async fn is_empty(&self, kind: EntityKind) -> bool {
        self.len(kind).await == 0
    }
}
