// Copyright 2026. The meshctl Community
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met: see LICENSE.

//! C7 — Data Sync Registry.
//!
//! Keeps disk-persisted entities (tasks, groups, templates, ...) identical
//! across every node. Two delivery modes share one code path:
//!
//! * Incremental: a single change is versioned and broadcast as it happens.
//!   A receiver ignores it if its own copy is already at an equal or newer
//!   version (last-write-wins).
//! * Full sync: on reconnect the authoritative side (the cluster head)
//!   sends every entity with `always_force_apply = true`, which skips the
//!   version check entirely — the reconnecting node's local state is not
//!   trusted and is simply overwritten.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{self, GroupConfiguration, ServiceTask};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("no data sync handler registered for {0}")]
    UnknownHandler(String),
    #[error("handler for {handler_key} rejected item {item_key}: {reason}")]
    Rejected { handler_key: String, item_key: String, reason: String },
}

/// One kind of synchronized entity (e.g. service tasks, groups). Keyed by a
/// stable string so the registry can dispatch without generics leaking into
/// the wire format.
#[async_trait]
pub trait DataSyncHandler: Send + Sync {
    /// Stable identifier for this entity kind, e.g. `"service_task"`.
    fn key(&self) -> &'static str;

    /// Every currently-known item, keyed by its own identity, with the
    /// version it was last written at. Used to build a full-sync push.
    async fn snapshot(&self) -> Vec<(String, serde_json::Value, u64)>;

    /// Applies one incoming item. Returns `Ok(true)` if it changed local
    /// state, `Ok(false)` if it was a no-op (e.g. identical content).
    async fn apply(&self, item_key: &str, value: serde_json::Value, always_force_apply: bool) -> Result<bool, SyncError>;

    /// Removes a locally-known item in response to a remote deletion.
    async fn remove(&self, item_key: &str) -> Result<bool, SyncError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEnvelope {
    pub handler_key: String,
    pub item_key: String,
    pub version: u64,
    pub always_force_apply: bool,
    pub tombstone: bool,
    pub value: serde_json::Value,
}

impl SyncEnvelope {
    pub fn update(handler_key: impl Into<String>, item_key: impl Into<String>, version: u64, value: serde_json::Value) -> Self {
        Self { handler_key: handler_key.into(), item_key: item_key.into(), version, always_force_apply: false, tombstone: false, value }
    }

    pub fn deletion(handler_key: impl Into<String>, item_key: impl Into<String>, version: u64) -> Self {
        Self {
            handler_key: handler_key.into(),
            item_key: item_key.into(),
            version,
            always_force_apply: false,
            tombstone: true,
            value: serde_json::Value::Null,
        }
    }

    fn forced(mut self) -> Self {
        self.always_force_apply = true;
        self
    }
}

/// Dispatches [`SyncEnvelope`]s to the registered [`DataSyncHandler`] for
/// their `handler_key`, enforcing the version-gated last-write-wins rule.
pub struct DataSyncRegistry {
    handlers: RwLock<HashMap<&'static str, Arc<dyn DataSyncHandler>>>,
    versions: RwLock<HashMap<(String, String), u64>>,
}

impl Default for DataSyncRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DataSyncRegistry {
    pub fn new() -> Self {
        Self { handlers: RwLock::new(HashMap::new()), versions: RwLock::new(HashMap::new()) }
    }

    pub fn register(&self, handler: Arc<dyn DataSyncHandler>) {
        self.handlers.write().expect("sync registry lock poisoned").insert(handler.key(), handler);
    }

    /// Builds the full-sync push sent to a node that just became reachable.
    pub async fn full_snapshot(&self) -> Vec<SyncEnvelope> {
        let handlers: Vec<Arc<dyn DataSyncHandler>> =
            self.handlers.read().expect("sync registry lock poisoned").values().cloned().collect();
        let mut out = Vec::new();
        for handler in handlers {
            for (item_key, value, version) in handler.snapshot().await {
                out.push(SyncEnvelope::update(handler.key(), item_key, version, value).forced());
            }
        }
        out
    }

    /// Applies one incoming envelope, returning whether it changed local
    /// state. Stale incremental updates (version <= the locally recorded
    /// version) are silently dropped unless `always_force_apply` is set.
    pub async fn apply(&self, envelope: SyncEnvelope) -> Result<bool, SyncError> {
        let handler = self
            .handlers
            .read()
            .expect("sync registry lock poisoned")
            .get(envelope.handler_key.as_str())
            .cloned()
            .ok_or_else(|| SyncError::UnknownHandler(envelope.handler_key.clone()))?;

        let version_key = (envelope.handler_key.clone(), envelope.item_key.clone());
        if !envelope.always_force_apply {
            let versions = self.versions.read().expect("sync registry lock poisoned");
            if let Some(&current) = versions.get(&version_key) {
                if envelope.version <= current {
                    return Ok(false);
                }
            }
        }

        let applied = if envelope.tombstone {
            handler.remove(&envelope.item_key).await?
        } else {
            handler.apply(&envelope.item_key, envelope.value.clone(), envelope.always_force_apply).await?
        };

        if applied {
            self.versions.write().expect("sync registry lock poisoned").insert(version_key, envelope.version);
        }
        Ok(applied)
    }

    /// Applies a batch (a full-sync push), returning how many entries
    /// actually changed local state.
    pub async fn apply_batch(&self, envelopes: Vec<SyncEnvelope>) -> Result<usize, SyncError> {
        let mut applied = 0;
        for envelope in envelopes {
            if self.apply(envelope).await? {
                applied += 1;
            }
        }
        Ok(applied)
    }
}

/// Disk-backed [`DataSyncHandler`] for one entity kind, parameterized over
/// a `*.json`-per-item directory the way `config::load_entities_dir` /
/// `config::save_entity` already expect. `ServiceTask` and
/// `GroupConfiguration` are both plain data, so one generic impl covers
/// both (§4.4, Glossary).
pub struct EntityDirSyncHandler<T> {
    key: &'static str,
    dir: PathBuf,
    versions: RwLock<HashMap<String, u64>>,
    name_of: fn(&T) -> &str,
    _marker: std::marker::PhantomData<T>,
}

impl<T> EntityDirSyncHandler<T> {
    pub fn new(key: &'static str, dir: PathBuf, name_of: fn(&T) -> &str) -> Self {
        Self { key, dir, versions: RwLock::new(HashMap::new()), name_of, _marker: std::marker::PhantomData }
    }
}

#[async_trait]
impl<T> DataSyncHandler for EntityDirSyncHandler<T>
where
    T: Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static,
{
    fn key(&self) -> &'static str {
        self.key
    }

    async fn snapshot(&self) -> Vec<(String, serde_json::Value, u64)> {
        let items: Vec<T> = config::load_entities_dir(&self.dir, serde_json::from_value).await.unwrap_or_default();
        let versions = self.versions.read().expect("sync handler lock poisoned").clone();
        items
            .into_iter()
            .map(|item| {
                let name = (self.name_of)(&item).to_string();
                let version = *versions.get(&name).unwrap_or(&0);
                let value = serde_json::to_value(&item).expect("entity always serializes");
                (name, value, version)
            })
            .collect()
    }

    async fn apply(&self, item_key: &str, value: serde_json::Value, _always_force_apply: bool) -> Result<bool, SyncError> {
        let item: T = serde_json::from_value(value).map_err(|e| SyncError::Rejected {
            handler_key: self.key.to_string(),
            item_key: item_key.to_string(),
            reason: e.to_string(),
        })?;
        config::save_entity(&self.dir, item_key, &item).await.map_err(|e| SyncError::Rejected {
            handler_key: self.key.to_string(),
            item_key: item_key.to_string(),
            reason: e.to_string(),
        })?;
        let mut versions = self.versions.write().expect("sync handler lock poisoned");
        let next = versions.get(item_key).copied().unwrap_or(0) + 1;
        versions.insert(item_key.to_string(), next);
        Ok(true)
    }

    async fn remove(&self, item_key: &str) -> Result<bool, SyncError> {
        let path = self.dir.join(format!("{item_key}.json"));
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(SyncError::Rejected { handler_key: self.key.to_string(), item_key: item_key.to_string(), reason: e.to_string() }),
        }
    }
}

/// Builds the pair of handlers registered by every node at startup (§4.4,
/// Glossary: tasks and groups are the two disk-persisted entity kinds kept
/// identical across the cluster).
pub fn entity_handlers(tasks_dir: PathBuf, groups_dir: PathBuf) -> (Arc<dyn DataSyncHandler>, Arc<dyn DataSyncHandler>) {
    let tasks = Arc::new(EntityDirSyncHandler::<ServiceTask>::new("service_task", tasks_dir, |t| &t.name));
    let groups = Arc::new(EntityDirSyncHandler::<GroupConfiguration>::new("group_configuration", groups_dir, |g| &g.name));
    (tasks, groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex as AsyncMutex;

    struct InMemoryHandler {
        items: AsyncMutex<HashMap<String, (serde_json::Value, u64)>>,
    }

    #[async_trait]
    impl DataSyncHandler for InMemoryHandler {
        fn key(&self) -> &'static str {
            "widget"
        }

        async fn snapshot(&self) -> Vec<(String, serde_json::Value, u64)> {
            self.items.lock().await.iter().map(|(k, (v, ver))| (k.clone(), v.clone(), *ver)).collect()
        }

        async fn apply(&self, item_key: &str, value: serde_json::Value, _always_force_apply: bool) -> Result<bool, SyncError> {
            let mut items = self.items.lock().await;
            let version = items.get(item_key).map(|(_, v)| *v).unwrap_or(0) + 1;
            items.insert(item_key.to_string(), (value, version));
            Ok(true)
        }

        async fn remove(&self, item_key: &str) -> Result<bool, SyncError> {
            Ok(self.items.lock().await.remove(item_key).is_some())
        }
    }

    fn registry_with_handler() -> (DataSyncRegistry, Arc<InMemoryHandler>) {
        let handler = Arc::new(InMemoryHandler { items: AsyncMutex::new(HashMap::new()) });
        let registry = DataSyncRegistry::new();
        registry.register(handler.clone());
        (registry, handler)
    }

    #[tokio::test]
    async fn newer_incremental_update_is_applied() {
        let (registry, handler) = registry_with_handler();
        let applied = registry.apply(SyncEnvelope::update("widget", "a", 1, serde_json::json!("v1"))).await.unwrap();
        assert!(applied);
        assert_eq!(handler.items.lock().await.get("a").unwrap().0, serde_json::json!("v1"));
    }

    #[tokio::test]
    async fn stale_update_is_ignored() {
        let (registry, _handler) = registry_with_handler();
        registry.apply(SyncEnvelope::update("widget", "a", 5, serde_json::json!("v5"))).await.unwrap();
        let applied = registry.apply(SyncEnvelope::update("widget", "a", 2, serde_json::json!("v2-stale"))).await.unwrap();
        assert!(!applied);
    }

    #[tokio::test]
    async fn always_force_apply_bypasses_the_version_check() {
        let (registry, handler) = registry_with_handler();
        registry.apply(SyncEnvelope::update("widget", "a", 5, serde_json::json!("v5"))).await.unwrap();
        let applied = registry
            .apply(SyncEnvelope::update("widget", "a", 1, serde_json::json!("authoritative-reset")).forced())
            .await
            .unwrap();
        assert!(applied);
        assert_eq!(handler.items.lock().await.get("a").unwrap().0, serde_json::json!("authoritative-reset"));
    }

    #[tokio::test]
    async fn full_snapshot_round_trips_into_a_fresh_registry() {
        let (source, _handler) = registry_with_handler();
        source.apply(SyncEnvelope::update("widget", "a", 1, serde_json::json!("a1"))).await.unwrap();
        source.apply(SyncEnvelope::update("widget", "b", 1, serde_json::json!("b1"))).await.unwrap();
        let snapshot = source.full_snapshot().await;
        assert_eq!(snapshot.len(), 2);

        let (target, target_handler) = registry_with_handler();
        let applied = target.apply_batch(snapshot).await.unwrap();
        assert_eq!(applied, 2);
        assert_eq!(target_handler.items.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn tombstone_removes_the_item() {
        let (registry, handler) = registry_with_handler();
        registry.apply(SyncEnvelope::update("widget", "a", 1, serde_json::json!("a1"))).await.unwrap();
        let applied = registry.apply(SyncEnvelope::deletion("widget", "a", 2)).await.unwrap();
        assert!(applied);
        assert!(handler.items.lock().await.get("a").is_none());
    }

    #[tokio::test]
    async fn unknown_handler_key_is_reported() {
        let registry = DataSyncRegistry::new();
        let result = registry.apply(SyncEnvelope::update("no-such-handler", "a", 1, serde_json::json!(null))).await;
        assert!(matches!(result, Err(SyncError::UnknownHandler(_))));
    }

    fn sample_task(name: &str, group: &str) -> ServiceTask {
        ServiceTask {
            name: name.into(),
            groups: vec![group.into()],
            templates: vec![],
            inclusions: vec![],
            deployments: vec![],
            max_memory_mib: 512,
            start_port: 25565,
            min_service_count: 1,
            properties: serde_json::json!({}),
        }
    }

    // Scenario: node B restarts with an empty data dir and reconnects; the
    // head's full sync must reproduce the task and its group on disk.
    #[tokio::test]
    async fn a_restarted_node_receives_the_tasks_and_groups_it_was_missing() {
        let source_dir = tempfile::tempdir().unwrap();
        let (tasks_handler, groups_handler) = entity_handlers(source_dir.path().join("tasks"), source_dir.path().join("groups"));
        config::save_entity(&source_dir.path().join("tasks"), "lobby", &sample_task("lobby", "g1")).await.unwrap();
        config::save_entity(&source_dir.path().join("groups"), "g1", &GroupConfiguration { name: "g1".into(), tasks: vec!["lobby".into()], templates: vec![] })
            .await
            .unwrap();
        let source = DataSyncRegistry::new();
        source.register(tasks_handler);
        source.register(groups_handler);
        let snapshot = source.full_snapshot().await;
        assert_eq!(snapshot.len(), 2);

        let dest_dir = tempfile::tempdir().unwrap();
        let (tasks_handler, groups_handler) = entity_handlers(dest_dir.path().join("tasks"), dest_dir.path().join("groups"));
        let dest = DataSyncRegistry::new();
        dest.register(tasks_handler);
        dest.register(groups_handler);
        let applied = dest.apply_batch(snapshot).await.unwrap();
        assert_eq!(applied, 2);

        let tasks: Vec<ServiceTask> = config::load_entities_dir(&dest_dir.path().join("tasks"), serde_json::from_value).await.unwrap();
        assert_eq!(tasks, vec![sample_task("lobby", "g1")]);
    }
}
