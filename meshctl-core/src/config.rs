// Copyright 2026. The meshctl Community
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met: see LICENSE.

//! Persisted configuration (§3, §6, §7 `ConfigInvalid`).
//!
//! A single JSON file holds `ClusterConfig`; tasks and groups are persisted
//! one JSON file per entity under a `tasks/` and `groups/` subdirectory of
//! the data directory. All writes are atomic (write to a `.tmp` sibling,
//! then rename), so a crash mid-write can never leave a half-written file
//! behind for the next start to trip over.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::NodeIdentity;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("failed to write config file {path}: {source}")]
    Write { path: PathBuf, source: std::io::Error },
    #[error("malformed config at {path}: {source}")]
    Malformed { path: PathBuf, source: serde_json::Error },
}

/// Cluster-wide configuration, mutable and saved to disk on change (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub cluster_id: Uuid,
    pub local_node: NodeIdentity,
    pub remote_nodes: Vec<NodeIdentity>,
    pub ip_whitelist: HashSet<String>,
    pub ip_aliases: HashMap<String, String>,
    pub max_memory_mib: u64,
    pub java_command: String,
}

impl ClusterConfig {
    /// Loads the cluster config from `path`, failing fatally (per §7,
    /// `ConfigInvalid`) on malformed JSON.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        serde_json::from_slice(&bytes).map_err(|source| ConfigError::Malformed { path: path.to_path_buf(), source })
    }

    pub async fn save(&self, path: &Path) -> Result<(), ConfigError> {
        write_json_atomic(path, self).await
    }
}

/// A named, disk-persisted declarative definition a service is built from
/// (§3, §4.4 `ServiceTask`). Kept identical on every node by the data sync
/// registry (C7).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceTask {
    pub name: String,
    pub groups: Vec<String>,
    pub templates: Vec<String>,
    pub inclusions: Vec<ServiceRemoteInclusion>,
    pub deployments: Vec<ServiceDeployment>,
    pub max_memory_mib: u64,
    pub start_port: u16,
    pub min_service_count: u32,
    pub properties: serde_json::Value,
}

/// A named tag attached to tasks/services for bulk targeting (Glossary).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupConfiguration {
    pub name: String,
    pub tasks: Vec<String>,
    pub templates: Vec<String>,
}

/// A URL-fetched file to be materialized into a service's working directory
/// before start (§4.7 Staging, step 2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRemoteInclusion {
    pub url: String,
    pub dest_path: PathBuf,
}

/// A post-stop file push selected by include/exclude glob patterns (§4.7
/// Deployment).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDeployment {
    pub template_storage: String,
    pub template_path: String,
    pub includes: Vec<String>,
    pub excludes: Vec<String>,
    pub case_sensitive: bool,
}

async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), ConfigError> {
    let tmp_path = tmp_sibling(path);
    let body = serde_json::to_vec_pretty(value).expect("in-memory config values always serialize");
    tokio::fs::write(&tmp_path, &body)
        .await
        .map_err(|source| ConfigError::Write { path: tmp_path.clone(), source })?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|source| ConfigError::Write { path: path.to_path_buf(), source })?;
    Ok(())
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

/// Loads every `*.json` entity file under `dir` via `load_one`, skipping the
/// directory silently if it does not yet exist (fresh install).
pub async fn load_entities_dir<T, F>(dir: &Path, mut load_one: F) -> Result<Vec<T>, ConfigError>
where
    F: FnMut(serde_json::Value) -> Result<T, serde_json::Error>,
{
    let mut out = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(source) => return Err(ConfigError::Read { path: dir.to_path_buf(), source }),
    };
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|source| ConfigError::Read { path: dir.to_path_buf(), source })?
    {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|source| ConfigError::Read { path: path.clone(), source })?;
        let value: serde_json::Value = serde_json::from_slice(&bytes)
            .map_err(|source| ConfigError::Malformed { path: path.clone(), source })?;
        let item = load_one(value).map_err(|source| ConfigError::Malformed { path, source })?;
        out.push(item);
    }
    Ok(out)
}

pub async fn save_entity<T: Serialize>(dir: &Path, file_stem: &str, value: &T) -> Result<(), ConfigError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|source| ConfigError::Write { path: dir.to_path_buf(), source })?;
    let path = dir.join(format!("{file_stem}.json"));
    write_json_atomic(&path, value).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> ClusterConfig {
        ClusterConfig {
            cluster_id: Uuid::new_v4(),
            local_node: NodeIdentity::random(vec!["127.0.0.1:9000".parse().unwrap()]),
            remote_nodes: vec![],
            ip_whitelist: HashSet::from(["127.0.0.1".to_string()]),
            ip_aliases: HashMap::new(),
            max_memory_mib: 4096,
            java_command: "java".to_string(),
        }
    }

    #[tokio::test]
    async fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.json");
        let cfg = sample_config();
        cfg.save(&path).await.unwrap();
        let loaded = ClusterConfig::load(&path).await.unwrap();
        assert_eq!(loaded.cluster_id, cfg.cluster_id);
        assert_eq!(loaded.max_memory_mib, cfg.max_memory_mib);
    }

    #[tokio::test]
    async fn malformed_config_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.json");
        tokio::fs::write(&path, b"not json").await.unwrap();
        assert!(matches!(ClusterConfig::load(&path).await, Err(ConfigError::Malformed { .. })));
    }

    #[tokio::test]
    async fn entity_dir_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let task = ServiceTask {
            name: "lobby".into(),
            groups: vec!["g1".into()],
            templates: vec![],
            inclusions: vec![],
            deployments: vec![],
            max_memory_mib: 512,
            start_port: 25565,
            min_service_count: 1,
            properties: serde_json::json!({}),
        };
        save_entity(dir.path(), &task.name, &task).await.unwrap();
        let loaded: Vec<ServiceTask> = load_entities_dir(dir.path(), |v| serde_json::from_value(v)).await.unwrap();
        assert_eq!(loaded, vec![task]);
    }
}
