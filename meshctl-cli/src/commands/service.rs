// Copyright 2026. The meshctl Community
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met: see LICENSE.

//! `service list` and `service <pattern> [start|stop|restart|delete|copy|
//! cmd|screen]` (§6).
//!
//! This process only knows about services it created itself: there is no
//! on-disk service-snapshot store in scope (C7 replicates
//! `ServiceInfoSnapshot` between *running* nodes, not across separate CLI
//! invocations), so `service list`/`service <pattern> ...` only see
//! services created earlier in the same invocation.

use std::sync::Arc;

use meshctl_core::{service::ProcessRunner, Runtime};

use crate::{cli::ServiceArgs, error::usage_bail};

pub async fn run(runtime: &Runtime, args: ServiceArgs) -> anyhow::Result<()> {
    if args.pattern == "list" {
        let snapshots = runtime.services.all_snapshots();
        if snapshots.is_empty() {
            println!("no services");
        }
        for snapshot in snapshots {
            println!("{}\t{:?}\t{}\t{}", snapshot.id.display_name(), snapshot.lifecycle, snapshot.node_name, snapshot.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into()));
        }
        return Ok(());
    }

    let Some(action) = args.action else {
        usage_bail!("expected an action after the service pattern: start|stop|restart|delete|copy|cmd|screen");
    };

    let matches = runtime.services.snapshots_matching(&args.pattern);
    if matches.is_empty() {
        println!("no services match '{}'", args.pattern);
        return Ok(());
    }

    let runner = ProcessRunner;
    let working_dir_root = runtime.data_dir.join("services");
    let template_storage_dir = runtime.data_dir.join("templates");
    let deployment_target_dir = runtime.data_dir.join("deployments");
    for snapshot in matches {
        let id = snapshot.id.unique_id;
        let name = snapshot.id.display_name();
        let Some(config) = runtime.services.config(id) else {
            println!("{name}: no configuration on record, skipping");
            continue;
        };
        let service_dir = working_dir_root.join(&name);
        let outcome = match action.as_str() {
            "start" => {
                tokio::fs::create_dir_all(&service_dir).await?;
                let service_args = ProcessRunner::default_args(&config);
                let services = runtime.services.clone();
                let on_log_line: meshctl_core::service::LogLineSink = Arc::new(move |line: String| services.push_log_line(id, line));
                runtime
                    .services
                    .start(id, &runner, &service_dir, &template_storage_dir, &runtime.config.java_command, &service_args, on_log_line)
                    .await
                    .map(|s| format!("{:?}", s.lifecycle))
            },
            "stop" => runtime.services.stop(id, &runner, &service_dir, &deployment_target_dir).await.map(|s| format!("{:?}", s.lifecycle)),
            "restart" => {
                if let Err(err) = runtime.services.stop(id, &runner, &service_dir, &deployment_target_dir).await {
                    println!("{name}: failed to stop: {err}");
                    continue;
                }
                tokio::fs::create_dir_all(&service_dir).await?;
                let service_args = ProcessRunner::default_args(&config);
                let services = runtime.services.clone();
                let on_log_line: meshctl_core::service::LogLineSink = Arc::new(move |line: String| services.push_log_line(id, line));
                runtime
                    .services
                    .start(id, &runner, &service_dir, &template_storage_dir, &runtime.config.java_command, &service_args, on_log_line)
                    .await
                    .map(|s| format!("{:?}", s.lifecycle))
            },
            "delete" => runtime.services.delete(id).map(|()| "DELETED".to_string()),
            "cmd" => {
                let line = args.args.join(" ");
                runtime.services.send_command(id, &runner, &line).await.map(|()| format!("sent '{line}'"))
            },
            "copy" => match runtime.services.deploy_now(id, &service_dir, &deployment_target_dir).await {
                Ok(deployed) => Ok(format!("deployed {} file(s)", deployed.len())),
                Err(err) => Err(err),
            },
            "screen" => match runtime.services.toggle_screen(id) {
                Ok((enabled, backlog)) => {
                    if enabled {
                        println!("{name}: screen forwarding on, last {} line(s):", backlog.len());
                        for line in backlog {
                            println!("{name}| {line}");
                        }
                    }
                    Ok(if enabled { "screen on".to_string() } else { "screen off".to_string() })
                },
                Err(err) => Err(err),
            },
            other => usage_bail!("unknown service action '{other}'"),
        };
        match outcome {
            Ok(message) => println!("{name}: {message}"),
            Err(err) => println!("{name}: failed: {err}"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bootstrap, cli::CreateBy};

    #[tokio::test]
    async fn listing_with_no_services_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = bootstrap::load_runtime(dir.path()).await.unwrap();
        run(&runtime, ServiceArgs { pattern: "list".into(), action: None, args: vec![] }).await.unwrap();
    }

    #[tokio::test]
    async fn an_action_without_a_pattern_match_is_reported_not_errored() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = bootstrap::load_runtime(dir.path()).await.unwrap();
        run(&runtime, ServiceArgs { pattern: "lobby-*".into(), action: Some("stop".into()), args: vec![] }).await.unwrap();
    }

    #[tokio::test]
    async fn an_unknown_action_is_a_usage_error() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = bootstrap::load_runtime(dir.path()).await.unwrap();
        crate::commands::create::run(&runtime, CreateBy::By { task: "lobby".into(), amount: 1, start: false, id: None, memory: None, node: None }).await.unwrap();
        let err = run(&runtime, ServiceArgs { pattern: "lobby-*".into(), action: Some("nonsense".into()), args: vec![] }).await.unwrap_err();
        assert!(err.downcast_ref::<crate::error::UsageError>().is_some());
    }
}
