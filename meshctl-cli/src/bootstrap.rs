// Copyright 2026. The meshctl Community
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met: see LICENSE.

//! Turns a `--home` directory into a running [`meshctl_core::Runtime`]: load
//! (or lazily create) the persisted `ClusterConfig`, then wire the tick
//! loop, cluster membership, service manager, and data sync registry
//! together the way §9 "Global state" describes — one `Runtime` built at
//! the edge and handed to every command, with `Runtime::global()` reserved
//! for call sites this CLI never needs.

use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::Arc,
};

use anyhow::Context;
use meshctl_core::{
    config::{ClusterConfig, ConfigError},
    identity::NodeIdentity,
    Runtime,
};
use uuid::Uuid;

const CONFIG_FILE_NAME: &str = "cluster.json";

pub fn cluster_config_path(home: &Path) -> std::path::PathBuf {
    home.join(CONFIG_FILE_NAME)
}

/// Loads `cluster.json` under `home`, creating a fresh single-node config
/// on first run so `meshctl` works out of the box against an empty
/// directory.
pub async fn load_or_init_config(home: &Path) -> anyhow::Result<ClusterConfig> {
    let path = cluster_config_path(home);
    match ClusterConfig::load(&path).await {
        Ok(config) => Ok(config),
        // A malformed file is ConfigInvalid (§7): fatal, not silently replaced.
        Err(err @ ConfigError::Malformed { .. }) => Err(err).context("config is invalid"),
        Err(ConfigError::Read { .. } | ConfigError::Write { .. }) => {
            tokio::fs::create_dir_all(home).await.with_context(|| format!("creating home directory {}", home.display()))?;
            let config = ClusterConfig {
                cluster_id: Uuid::new_v4(),
                local_node: NodeIdentity::random(vec!["127.0.0.1:25566".parse().expect("valid default listen address")]),
                remote_nodes: vec![],
                ip_whitelist: HashSet::new(),
                ip_aliases: HashMap::new(),
                max_memory_mib: 4096,
                java_command: "java".to_string(),
            };
            config.save(&path).await.with_context(|| format!("writing fresh config to {}", path.display()))?;
            log::info!("no existing config at {}; created a new single-node cluster {}", path.display(), config.cluster_id);
            Ok(config)
        },
    }
}

/// Builds and installs the process-wide [`Runtime`] from the config at
/// `home`, binds the cluster listener on the local node's primary address,
/// and kicks off a best-effort reconnect loop to every configured peer
/// (§4.3): each dial is independent and backs off on its own, so one
/// unreachable peer never blocks bootstrap against the others.
pub async fn load_runtime(home: &Path) -> anyhow::Result<Arc<Runtime>> {
    let config = load_or_init_config(home).await?;
    let identity = config.local_node.clone();
    let self_name = std::env::var("MESHCTL_NODE_NAME").unwrap_or_else(|_| format!("node-{}", identity.unique_id));
    let (tick, _join) = meshctl_core::tick::spawn();
    let runtime = Runtime::new(home.to_path_buf(), config, self_name, identity, tick);
    if Runtime::try_global().is_none() {
        runtime.clone().install();
    }

    if let Some(listen_addr) = runtime.cluster.self_identity.primary_address() {
        let cluster = runtime.cluster.clone();
        tokio::spawn(async move {
            if let Err(e) = cluster.listen(listen_addr).await {
                log::error!("cluster listener on {} stopped: {}", listen_addr, e);
            }
        });
    }

    for peer in runtime.cluster.configured_peer_identities() {
        let Some(addr) = peer.primary_address() else {
            log::warn!("peer {} has no listen address configured, skipping reconnect loop", peer.unique_id);
            continue;
        };
        let cluster = runtime.cluster.clone();
        tokio::spawn(async move { cluster.reconnect_loop(addr, peer).await });
    }

    Ok(runtime)
}
