// Copyright 2026. The meshctl Community
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met: see LICENSE.

//! C8b — pluggable process execution. [`ServiceRunner`] is the seam the
//! service registry (C1) exposes a default implementation for
//! ([`ProcessRunner`], a plain child process), so an embedder can swap in a
//! container- or sandbox-backed runner without touching the lifecycle code
//! in [`super::manager`].

use std::{process::Stdio, sync::Arc};

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, Command},
    sync::Mutex as AsyncMutex,
};

use super::{lifecycle::ServiceConfiguration, ServiceError};

/// Called with each line a running service writes to stdout/stderr, feeding
/// the screen-forwarding backlog (§4.7 "Screen").
pub type LogLineSink = Arc<dyn Fn(String) + Send + Sync>;

/// A handle to a started process. Cloning shares the same underlying
/// child, not a new one.
#[derive(Clone)]
pub struct RunningProcess {
    pub pid: u32,
    child: Arc<AsyncMutex<Child>>,
    stdin: Arc<AsyncMutex<Option<ChildStdin>>>,
}

#[async_trait]
pub trait ServiceRunner: Send + Sync {
    async fn start(
        &self,
        config: &ServiceConfiguration,
        working_dir: &std::path::Path,
        command: &str,
        args: &[String],
        on_log_line: LogLineSink,
    ) -> Result<RunningProcess, ServiceError>;
    async fn send_command(&self, process: &RunningProcess, command: &str) -> Result<(), ServiceError>;
    async fn stop(&self, process: &RunningProcess) -> Result<(), ServiceError>;
    /// `true` once the process has exited, without blocking to wait for it.
    async fn is_alive(&self, process: &RunningProcess) -> bool;
}

/// Default runner: launches the configured command as a plain OS process
/// with its own working directory, writing console commands to its stdin
/// (the same mechanism the CLI's `service <pattern> cmd` uses). The default
/// argument vector a real deployment passes is `-Xmx<memory>M -jar
/// server.jar`; it is the caller's responsibility to build it, so tests can
/// exercise the process lifecycle with something other than a JVM.
pub struct ProcessRunner;

impl ProcessRunner {
    /// The argument vector a real deployment would pass for `config`.
    pub fn default_args(config: &ServiceConfiguration) -> Vec<String> {
        vec![format!("-Xmx{}M", config.max_memory_mib), "-jar".into(), "server.jar".into()]
    }
}

#[async_trait]
impl ServiceRunner for ProcessRunner {
    async fn start(
        &self,
        _config: &ServiceConfiguration,
        working_dir: &std::path::Path,
        command: &str,
        args: &[String],
        on_log_line: LogLineSink,
    ) -> Result<RunningProcess, ServiceError> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .current_dir(working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd.spawn().map_err(ServiceError::Spawn)?;
        let pid = child
            .id()
            .ok_or_else(|| ServiceError::Spawn(std::io::Error::new(std::io::ErrorKind::Other, "process exited immediately")))?;
        let stdin = child.stdin.take();
        if let Some(stdout) = child.stdout.take() {
            let sink = on_log_line.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    sink(line);
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    on_log_line(line);
                }
            });
        }
        Ok(RunningProcess { pid, child: Arc::new(AsyncMutex::new(child)), stdin: Arc::new(AsyncMutex::new(stdin)) })
    }

    async fn send_command(&self, process: &RunningProcess, command: &str) -> Result<(), ServiceError> {
        let mut guard = process.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(ServiceError::NoStdin)?;
        stdin.write_all(command.as_bytes()).await.map_err(ServiceError::Spawn)?;
        stdin.write_all(b"\n").await.map_err(ServiceError::Spawn)?;
        stdin.flush().await.map_err(ServiceError::Spawn)?;
        Ok(())
    }

    async fn stop(&self, process: &RunningProcess) -> Result<(), ServiceError> {
        if self.send_command(process, "stop").await.is_err() {
            process.child.lock().await.start_kill().map_err(ServiceError::Spawn)?;
        }
        let wait = process.child.lock().await.wait();
        match tokio::time::timeout(std::time::Duration::from_secs(30), wait).await {
            Ok(_) => Ok(()),
            Err(_) => {
                process.child.lock().await.start_kill().map_err(ServiceError::Spawn)?;
                Ok(())
            },
        }
    }

    async fn is_alive(&self, process: &RunningProcess) -> bool {
        matches!(process.child.lock().await.try_wait(), Ok(None))
    }
}
