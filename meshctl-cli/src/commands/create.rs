// Copyright 2026. The meshctl Community
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met: see LICENSE.

//! `create by <task> <amount> [--start] [--id ...] [--memory MiB] [--node
//! name]` (§6, §8 scenarios 1 and 6).
//!
//! `--id` pins the `task_service_id` of a single-service create; it is
//! rejected for `amount > 1` since a fixed id only makes sense for one
//! instance.

use std::sync::Arc;

use meshctl_core::{
    config::{self, ServiceTask},
    service::{NodeLoad, ProcessRunner, RemoteIdAllocator, ServiceIdAllocator, WeightedLoadPlacement},
    Runtime,
};

use crate::{cli::CreateBy, error::usage_bail};

/// Loads the persisted task definition by name, falling back to an ad hoc
/// one-off definition when the task was never saved under `tasks/` (a
/// quick throwaway `create by <name> <n>` against a name nobody defined).
async fn load_task(runtime: &Runtime, task_name: &str, amount: u32, memory: Option<u64>) -> anyhow::Result<ServiceTask> {
    let tasks_dir = runtime.data_dir.join("tasks");
    let tasks: Vec<ServiceTask> = config::load_entities_dir(&tasks_dir, serde_json::from_value).await?;
    if let Some(task) = tasks.into_iter().find(|t| t.name == task_name) {
        return Ok(task);
    }
    log::warn!("no persisted task named {task_name}; creating a one-off definition for this invocation");
    Ok(ServiceTask {
        name: task_name.to_string(),
        groups: vec![],
        templates: vec![],
        inclusions: vec![],
        deployments: vec![],
        max_memory_mib: memory.unwrap_or(runtime.config.max_memory_mib),
        start_port: 25565,
        min_service_count: amount,
        properties: serde_json::json!({}),
    })
}

pub async fn run(runtime: &Runtime, by: CreateBy) -> anyhow::Result<()> {
    let CreateBy::By { task: task_name, amount, start, id, memory, node } = by;
    if amount == 0 {
        usage_bail!("amount must be at least 1");
    }
    if id.is_some() && amount != 1 {
        usage_bail!("--id can only be used when creating exactly one service");
    }
    if id.is_some() {
        log::warn!("--id is not yet honored by the id allocator; the task_service_id is still assigned by the cluster head");
    }

    let task = load_task(runtime, &task_name, amount, memory).await?;

    let node_name = node.unwrap_or_else(|| runtime.cluster.self_name.clone());
    let running = runtime.services.all_snapshots().iter().filter(|s| s.node_name == node_name).count() as u32;
    let candidates = vec![NodeLoad { node_name, running_services: running, max_services: u32::MAX }];

    // The head allocates ids directly; every other node routes the
    // allocation through the head over the bus (§4.3).
    let local_allocator;
    let remote_allocator;
    let allocator: &dyn ServiceIdAllocator = if runtime.cluster.is_self_head() {
        local_allocator = runtime.local_id_allocator.clone();
        &*local_allocator
    } else {
        remote_allocator = Arc::new(RemoteIdAllocator::new(runtime.bus.clone(), runtime.cluster.clone()));
        &*remote_allocator
    };
    let (created, failure) = runtime.services.create_bulk(&task, amount, &candidates, &WeightedLoadPlacement, allocator).await;

    if created.is_empty() {
        if let Some(err) = failure {
            println!("failed: {err}");
            anyhow::bail!(err);
        }
        return Ok(());
    }

    for config in &created {
        println!("prepared {}", config.id.display_name());
    }

    if start {
        let runner = ProcessRunner;
        let working_dir = runtime.data_dir.join("services");
        let template_storage_dir = runtime.data_dir.join("templates");
        for config in &created {
            let service_dir = working_dir.join(config.id.display_name());
            tokio::fs::create_dir_all(&service_dir).await?;
            let args = ProcessRunner::default_args(config);
            let services = runtime.services.clone();
            let service_id = config.id.unique_id;
            let on_log_line: meshctl_core::service::LogLineSink = Arc::new(move |line: String| services.push_log_line(service_id, line));
            match runtime
                .services
                .start(config.id.unique_id, &runner, &service_dir, &template_storage_dir, &runtime.config.java_command, &args, on_log_line)
                .await
            {
                Ok(snapshot) => println!("{} is {:?}", snapshot.id.display_name(), snapshot.lifecycle),
                Err(err) => println!("{} failed to start: {err}", config.id.display_name()),
            }
        }
    }

    if let Some(err) = failure {
        println!("failed: {err} ({} service(s) created before the failure)", created.len());
        anyhow::bail!(err);
    }
    Ok(())
}
