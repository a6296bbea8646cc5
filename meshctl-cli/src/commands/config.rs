// Copyright 2026. The meshctl Community
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met: see LICENSE.

//! `config reload` (§6, §7 `ConfigInvalid`).

use std::path::Path;

use meshctl_core::config::ClusterConfig;

use crate::{bootstrap, cli::ConfigAction};

pub async fn run(home: &Path, action: ConfigAction) -> anyhow::Result<()> {
    let ConfigAction::Reload = action;
    let path = bootstrap::cluster_config_path(home);
    let config: ClusterConfig = ClusterConfig::load(&path).await.map_err(|e| anyhow::anyhow!("config at {} is invalid: {e}", path.display()))?;
    println!("reloaded cluster {} ({} remote node(s), max {} MiB/service)", config.cluster_id, config.remote_nodes.len(), config.max_memory_mib);
    Ok(())
}
