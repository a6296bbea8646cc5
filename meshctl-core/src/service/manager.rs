// Copyright 2026. The meshctl Community
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met: see LICENSE.

//! C8 — Cloud Service Manager.
//!
//! Owns the lifecycle bookkeeping for every service this node knows about:
//! allocation, the `PREPARED -> ... -> DELETED` state machine, and bulk
//! creation with fail-stop semantics (§4.3: "if any service in a bulk
//! create request fails, the services already created up to that point are
//! kept and the remainder are abandoned").

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use glob::Pattern;
use uuid::Uuid;

use super::{
    lifecycle::{ServiceConfiguration, ServiceId, ServiceInfoSnapshot, ServiceLifecycle},
    placement::{NodeLoad, PlacementStrategy},
    runner::{LogLineSink, RunningProcess, ServiceRunner},
    staging,
};
use crate::{
    bus::{BusTransport, ChannelMessage, MessageBus, Target},
    cluster::NodeServer,
    config::ServiceTask,
    transport::{channel_ids, Frame, TransportChannel, TransportError},
};

/// Lines of scrollback kept per service for `service <pattern> screen`
/// (§4.7 "Screen").
pub const SCREEN_BACKLOG_LINES: usize = 128;

/// Bus channel the cluster head answers id-allocation queries on (§4.3:
/// "the assignment must route through the head").
pub const ID_ALLOCATION_CHANNEL: &str = "service_id";
pub const ID_ALLOCATION_MESSAGE: &str = "allocate";

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("illegal lifecycle transition from {from:?} to {to:?}")]
    IllegalTransition { from: ServiceLifecycle, to: ServiceLifecycle },
    #[error("unknown service {0}")]
    UnknownService(Uuid),
    #[error("no node had capacity to host the service")]
    NoCapacity,
    #[error("service id allocation failed: {0}")]
    AllocationFailed(String),
    #[error("failed to spawn the service process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("the service process has no stdin pipe")]
    NoStdin,
    #[error("agent channel auth rejected: {0}")]
    AgentAuthRejected(String),
    #[error("staging failed: {0}")]
    Staging(#[from] staging::StagingError),
    #[error("no agent channel bound for service {0}")]
    NoAgentChannel(Uuid),
    #[error("agent channel send failed: {0}")]
    AgentSend(#[from] TransportError),
}

/// Allocates the next `task_service_id` for a task, delegated to the
/// cluster head so every node agrees on numbering (§4.3).
#[async_trait]
pub trait ServiceIdAllocator: Send + Sync {
    async fn allocate(&self, task_name: &str) -> Result<u32, ServiceError>;
}

/// Allocator used when this node *is* the cluster head: a simple
/// in-memory, per-task counter.
#[derive(Default)]
pub struct LocalIdAllocator {
    counters: RwLock<HashMap<String, u32>>,
}

impl LocalIdAllocator {
    /// Plain synchronous allocation. Used directly by the bus subscriber
    /// that answers `RemoteIdAllocator` queries on the head, since no lock
    /// here is ever held across an `.await`.
    pub fn allocate_sync(&self, task_name: &str) -> u32 {
        let mut counters = self.counters.write().expect("id allocator lock poisoned");
        let next = counters.entry(task_name.to_string()).or_insert(0);
        *next += 1;
        *next
    }
}

#[async_trait]
impl ServiceIdAllocator for LocalIdAllocator {
    async fn allocate(&self, task_name: &str) -> Result<u32, ServiceError> {
        Ok(self.allocate_sync(task_name))
    }
}

/// Allocator used when this node is *not* the cluster head: routes the
/// request to the head over the channel-message bus and awaits its reply
/// (§4.3).
pub struct RemoteIdAllocator<T: BusTransport> {
    bus: Arc<MessageBus<T>>,
    cluster: Arc<NodeServer>,
    sender: Uuid,
    timeout: Duration,
}

impl<T: BusTransport> RemoteIdAllocator<T> {
    pub fn new(bus: Arc<MessageBus<T>>, cluster: Arc<NodeServer>) -> Self {
        Self { bus, cluster, sender: Uuid::new_v4(), timeout: Duration::from_secs(10) }
    }
}

#[async_trait]
impl<T: BusTransport> ServiceIdAllocator for RemoteIdAllocator<T> {
    async fn allocate(&self, task_name: &str) -> Result<u32, ServiceError> {
        let head = self.cluster.head_name().ok_or_else(|| ServiceError::AllocationFailed("no cluster head known".into()))?;
        let query = ChannelMessage::new(self.sender, vec![Target::Node(head.clone())], ID_ALLOCATION_CHANNEL, ID_ALLOCATION_MESSAGE)
            .with_content(bytes::Bytes::copy_from_slice(task_name.as_bytes()))
            .as_query();
        let reply = self
            .bus
            .send_single_query(query, self.timeout)
            .await
            .map_err(|e| ServiceError::AllocationFailed(e.to_string()))?
            .ok_or_else(|| ServiceError::AllocationFailed(format!("head {head} did not answer the id allocation query")))?;
        let array: [u8; 4] = reply.content.as_ref().try_into().map_err(|_| ServiceError::AllocationFailed("malformed id allocation reply".into()))?;
        Ok(u32::from_be_bytes(array))
    }
}

struct Entry {
    config: ServiceConfiguration,
    snapshot: ServiceInfoSnapshot,
    process: Option<RunningProcess>,
    connection_key: String,
    agent_bound: bool,
    agent_channel: Option<TransportChannel>,
    screen_enabled: bool,
    log_backlog: VecDeque<String>,
}

pub struct ServiceManager {
    entries: RwLock<HashMap<Uuid, Entry>>,
}

impl Default for ServiceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceManager {
    pub fn new() -> Self {
        Self { entries: RwLock::new(HashMap::new()) }
    }

    /// Creates one new service for `task`, placing it on the
    /// least-loaded candidate node and allocating its id via `allocator`
    /// (local if this node is head, otherwise a remote-query
    /// implementation). Returns `PREPARED`.
    pub async fn create(
        &self,
        task: &ServiceTask,
        candidates: &[NodeLoad],
        placement: &dyn PlacementStrategy,
        allocator: &dyn ServiceIdAllocator,
    ) -> Result<ServiceConfiguration, ServiceError> {
        let node_name = placement.select(candidates).ok_or(ServiceError::NoCapacity)?;
        let task_service_id = allocator.allocate(&task.name).await?;
        let id = ServiceId { unique_id: Uuid::new_v4(), task_name: task.name.clone(), task_service_id };
        let config = ServiceConfiguration {
            id: id.clone(),
            groups: task.groups.clone(),
            max_memory_mib: task.max_memory_mib,
            port: task.start_port,
            properties: task.properties.clone(),
            node_name: node_name.clone(),
            templates: task.templates.clone(),
            inclusions: task.inclusions.clone(),
            deployments: task.deployments.clone(),
        };
        let snapshot = ServiceInfoSnapshot::new(id.clone(), node_name);
        let entry = Entry {
            config: config.clone(),
            snapshot,
            process: None,
            connection_key: Uuid::new_v4().to_string(),
            agent_bound: false,
            agent_channel: None,
            screen_enabled: false,
            log_backlog: VecDeque::new(),
        };
        self.entries.write().expect("service manager lock poisoned").insert(id.unique_id, entry);
        Ok(config)
    }

    /// Creates `count` services for `task`. Stops at the first failure and
    /// returns everything created so far alongside the error, rather than
    /// rolling the successes back.
    pub async fn create_bulk(
        &self,
        task: &ServiceTask,
        count: u32,
        candidates: &[NodeLoad],
        placement: &dyn PlacementStrategy,
        allocator: &dyn ServiceIdAllocator,
    ) -> (Vec<ServiceConfiguration>, Option<ServiceError>) {
        let mut created = Vec::new();
        for _ in 0..count {
            match self.create(task, candidates, placement, allocator).await {
                Ok(config) => created.push(config),
                Err(e) => return (created, Some(e)),
            }
        }
        (created, None)
    }

    fn transition(&self, id: Uuid, next: ServiceLifecycle) -> Result<ServiceInfoSnapshot, ServiceError> {
        let mut entries = self.entries.write().expect("service manager lock poisoned");
        let entry = entries.get_mut(&id).ok_or(ServiceError::UnknownService(id))?;
        if !entry.snapshot.lifecycle.can_transition_to(next) {
            return Err(ServiceError::IllegalTransition { from: entry.snapshot.lifecycle, to: next });
        }
        entry.snapshot.lifecycle = next;
        Ok(entry.snapshot.clone())
    }

    /// Stages the service's templates/inclusions (§4.7), then spawns it.
    /// Reaches `RUNNING` once the process is alive; the agent channel
    /// (`bind_agent_channel`) is a separate handshake layered on top and
    /// does not gate this transition, so a service with no agent plugin
    /// dialing back does not get stuck in `STARTING` forever.
    pub async fn start(
        &self,
        id: Uuid,
        runner: &dyn ServiceRunner,
        working_dir: &std::path::Path,
        template_storage_dir: &std::path::Path,
        command: &str,
        args: &[String],
        on_log_line: LogLineSink,
    ) -> Result<ServiceInfoSnapshot, ServiceError> {
        self.transition(id, ServiceLifecycle::Starting)?;
        let config = self.entries.read().expect("service manager lock poisoned").get(&id).map(|e| e.config.clone()).ok_or(ServiceError::UnknownService(id))?;

        if let Err(e) = staging::stage_service(&config.templates, &config.inclusions, template_storage_dir, working_dir).await {
            let mut entries = self.entries.write().expect("service manager lock poisoned");
            if let Some(entry) = entries.get_mut(&id) {
                entry.snapshot.lifecycle = ServiceLifecycle::Prepared;
                entry.snapshot.properties["staging_error"] = serde_json::json!(e.to_string());
            }
            return Err(ServiceError::from(e));
        }

        let process = match runner.start(&config, working_dir, command, args, on_log_line).await {
            Ok(process) => process,
            Err(e) => {
                // Roll the state back to PREPARED so a retry is legal.
                let mut entries = self.entries.write().expect("service manager lock poisoned");
                if let Some(entry) = entries.get_mut(&id) {
                    entry.snapshot.lifecycle = ServiceLifecycle::Prepared;
                }
                return Err(e);
            },
        };
        let mut entries = self.entries.write().expect("service manager lock poisoned");
        let entry = entries.get_mut(&id).ok_or(ServiceError::UnknownService(id))?;
        entry.snapshot.lifecycle = ServiceLifecycle::Running;
        entry.snapshot.pid = Some(process.pid);
        entry.process = Some(process);
        Ok(entry.snapshot.clone())
    }

    /// Writes `command` to the running service's stdin (§6 `service
    /// <pattern> cmd`), without touching its lifecycle state.
    pub async fn send_command(&self, id: Uuid, runner: &dyn ServiceRunner, command: &str) -> Result<(), ServiceError> {
        let process = self.entries.read().expect("service manager lock poisoned").get(&id).and_then(|e| e.process.clone()).ok_or(ServiceError::UnknownService(id))?;
        runner.send_command(&process, command).await
    }

    /// Stops the process, then pushes any configured deployments out to
    /// `deployment_target_dir` (§4.7 Deployment).
    pub async fn stop(&self, id: Uuid, runner: &dyn ServiceRunner, working_dir: &std::path::Path, deployment_target_dir: &std::path::Path) -> Result<ServiceInfoSnapshot, ServiceError> {
        let process = self.entries.read().expect("service manager lock poisoned").get(&id).and_then(|e| e.process.clone()).ok_or(ServiceError::UnknownService(id))?;
        runner.stop(&process).await?;
        let deployments = self.entries.read().expect("service manager lock poisoned").get(&id).map(|e| e.config.deployments.clone()).unwrap_or_default();
        for deployment in &deployments {
            if let Err(e) = staging::deploy_service(deployment, working_dir, deployment_target_dir).await {
                log::warn!("deployment {} failed for service {}: {}", deployment.template_path, id, e);
            }
        }
        let mut snapshot = self.transition(id, ServiceLifecycle::Stopped)?;
        let mut entries = self.entries.write().expect("service manager lock poisoned");
        if let Some(entry) = entries.get_mut(&id) {
            entry.process = None;
            entry.agent_bound = false;
            entry.agent_channel = None;
            entry.snapshot.pid = None;
            snapshot = entry.snapshot.clone();
        }
        Ok(snapshot)
    }

    pub fn delete(&self, id: Uuid) -> Result<(), ServiceError> {
        self.transition(id, ServiceLifecycle::Deleted)?;
        self.entries.write().expect("service manager lock poisoned").remove(&id);
        Ok(())
    }

    /// Administrative rewrite triggered by a peer's disconnect (§4.3): every
    /// service this node believed was owned by `node_name` is force-written
    /// to `DELETED`, bypassing the normal transition legality check, since
    /// the owning node is gone and there is no process left here to stop.
    pub fn mark_node_lost(&self, node_name: &str) -> Vec<ServiceInfoSnapshot> {
        let mut entries = self.entries.write().expect("service manager lock poisoned");
        let mut changed = Vec::new();
        for entry in entries.values_mut() {
            if entry.snapshot.node_name == node_name && entry.snapshot.lifecycle != ServiceLifecycle::Deleted {
                entry.snapshot.lifecycle = ServiceLifecycle::Deleted;
                entry.process = None;
                entry.agent_bound = false;
                entry.agent_channel = None;
                changed.push(entry.snapshot.clone());
            }
        }
        changed
    }

    pub fn snapshot(&self, id: Uuid) -> Option<ServiceInfoSnapshot> {
        self.entries.read().expect("service manager lock poisoned").get(&id).map(|e| e.snapshot.clone())
    }

    pub fn all_snapshots(&self) -> Vec<ServiceInfoSnapshot> {
        self.entries.read().expect("service manager lock poisoned").values().map(|e| e.snapshot.clone()).collect()
    }

    /// Every service's static configuration, used by the bus transport to
    /// resolve `Target::Task`/`Target::Group` membership.
    pub fn all_configs(&self) -> Vec<ServiceConfiguration> {
        self.entries.read().expect("service manager lock poisoned").values().map(|e| e.config.clone()).collect()
    }

    /// One service's static configuration, e.g. to restart it with the
    /// templates/inclusions/deployments it was created with rather than
    /// reconstructing a guess from its runtime snapshot.
    pub fn config(&self, id: Uuid) -> Option<ServiceConfiguration> {
        self.entries.read().expect("service manager lock poisoned").get(&id).map(|e| e.config.clone())
    }

    /// Services whose display name (`task-n`) matches a glob `pattern`
    /// (§6 `service <pattern> ...`).
    pub fn snapshots_matching(&self, pattern: &str) -> Vec<ServiceInfoSnapshot> {
        let Ok(glob) = Pattern::new(pattern) else { return Vec::new() };
        self.all_snapshots().into_iter().filter(|s| glob.matches(&s.id.display_name())).collect()
    }

    /// The connection key a service's agent handshake (`AUTH_SERVICE`)
    /// must present to bind its channel (§4.7 "Agent channel"). A real
    /// deployment passes this to the spawned process, e.g. as an
    /// environment variable.
    pub fn connection_key(&self, id: Uuid) -> Option<String> {
        self.entries.read().expect("service manager lock poisoned").get(&id).map(|e| e.connection_key.clone())
    }

    /// Validates an inbound `WRAPPER_TO_NODE` handshake and binds the
    /// agent channel for command/log routing.
    pub fn bind_agent_channel(&self, id: Uuid, connection_key: &str, channel: TransportChannel) -> Result<(), ServiceError> {
        let mut entries = self.entries.write().expect("service manager lock poisoned");
        let entry = entries.get_mut(&id).ok_or(ServiceError::UnknownService(id))?;
        if entry.connection_key != connection_key {
            return Err(ServiceError::AgentAuthRejected("connection key mismatch".into()));
        }
        entry.agent_bound = true;
        entry.agent_channel = Some(channel);
        Ok(())
    }

    pub fn is_agent_bound(&self, id: Uuid) -> bool {
        self.entries.read().expect("service manager lock poisoned").get(&id).map(|e| e.agent_bound).unwrap_or(false)
    }

    /// Forwards a bus-routed payload to the service's bound agent channel
    /// (§4.7 "Agent channel"), used when a `ChannelMessage` targets this
    /// service by name.
    pub async fn send_to_agent(&self, id: Uuid, payload: Bytes) -> Result<(), ServiceError> {
        let channel = self
            .entries
            .read()
            .expect("service manager lock poisoned")
            .get(&id)
            .and_then(|e| e.agent_channel.clone())
            .ok_or(ServiceError::NoAgentChannel(id))?;
        channel.send_frame_sync(Frame::new(channel_ids::CHANNEL_MESSAGE, payload)).await?;
        Ok(())
    }

    /// Appends one line to a service's scrollback, dropping the oldest
    /// line once the backlog exceeds [`SCREEN_BACKLOG_LINES`].
    pub fn push_log_line(&self, id: Uuid, line: String) {
        if let Some(entry) = self.entries.write().expect("service manager lock poisoned").get_mut(&id) {
            if entry.log_backlog.len() >= SCREEN_BACKLOG_LINES {
                entry.log_backlog.pop_front();
            }
            entry.log_backlog.push_back(line);
        }
    }

    /// Flips screen forwarding for one service (§6 `service <pattern>
    /// screen`), returning the new state plus the backlog to print
    /// immediately when turning it on.
    pub fn toggle_screen(&self, id: Uuid) -> Result<(bool, Vec<String>), ServiceError> {
        let mut entries = self.entries.write().expect("service manager lock poisoned");
        let entry = entries.get_mut(&id).ok_or(ServiceError::UnknownService(id))?;
        entry.screen_enabled = !entry.screen_enabled;
        let backlog = if entry.screen_enabled { entry.log_backlog.iter().cloned().collect() } else { Vec::new() };
        Ok((entry.screen_enabled, backlog))
    }

    /// Pushes the service's configured deployments out immediately,
    /// without stopping it first (§6 `service <pattern> copy`).
    pub async fn deploy_now(&self, id: Uuid, working_dir: &std::path::Path, deployment_target_dir: &std::path::Path) -> Result<Vec<std::path::PathBuf>, ServiceError> {
        let deployments = self.entries.read().expect("service manager lock poisoned").get(&id).map(|e| e.config.deployments.clone()).ok_or(ServiceError::UnknownService(id))?;
        let mut deployed = Vec::new();
        for deployment in &deployments {
            deployed.extend(staging::deploy_service(deployment, working_dir, deployment_target_dir).await?);
        }
        Ok(deployed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::placement::WeightedLoadPlacement;

    fn sample_task() -> ServiceTask {
        ServiceTask {
            name: "lobby".into(),
            groups: vec![],
            templates: vec![],
            inclusions: vec![],
            deployments: vec![],
            max_memory_mib: 512,
            start_port: 25565,
            min_service_count: 1,
            properties: serde_json::json!({}),
        }
    }

    fn one_candidate() -> Vec<NodeLoad> {
        vec![NodeLoad { node_name: "node-a".into(), running_services: 0, max_services: 10 }]
    }

    #[tokio::test]
    async fn created_services_start_in_prepared() {
        let manager = ServiceManager::new();
        let allocator = LocalIdAllocator::default();
        let config = manager.create(&sample_task(), &one_candidate(), &WeightedLoadPlacement, &allocator).await.unwrap();
        assert_eq!(manager.snapshot(config.id.unique_id).unwrap().lifecycle, ServiceLifecycle::Prepared);
    }

    #[tokio::test]
    async fn task_service_ids_increment_per_task() {
        let manager = ServiceManager::new();
        let allocator = LocalIdAllocator::default();
        let a = manager.create(&sample_task(), &one_candidate(), &WeightedLoadPlacement, &allocator).await.unwrap();
        let b = manager.create(&sample_task(), &one_candidate(), &WeightedLoadPlacement, &allocator).await.unwrap();
        assert_eq!(a.id.task_service_id, 1);
        assert_eq!(b.id.task_service_id, 2);
    }

    #[tokio::test]
    async fn bulk_create_stops_at_the_first_failure_and_keeps_prior_successes() {
        let manager = ServiceManager::new();
        let allocator = LocalIdAllocator::default();
        // Only one slot of capacity: the second create in the batch fails.
        let candidates = vec![NodeLoad { node_name: "node-a".into(), running_services: 9, max_services: 10 }];
        let (created, err) = manager.create_bulk(&sample_task(), 3, &candidates, &WeightedLoadPlacement, &allocator).await;
        assert_eq!(created.len(), 1);
        assert!(err.is_some());
        assert_eq!(manager.all_snapshots().len(), 1);
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected() {
        let manager = ServiceManager::new();
        let allocator = LocalIdAllocator::default();
        let config = manager.create(&sample_task(), &one_candidate(), &WeightedLoadPlacement, &allocator).await.unwrap();
        let result = manager.transition(config.id.unique_id, ServiceLifecycle::Running);
        assert!(matches!(result, Err(ServiceError::IllegalTransition { .. })));
    }

    #[tokio::test]
    async fn send_command_to_an_unstarted_service_is_unknown_service() {
        let manager = ServiceManager::new();
        let allocator = LocalIdAllocator::default();
        let config = manager.create(&sample_task(), &one_candidate(), &WeightedLoadPlacement, &allocator).await.unwrap();
        let runner = crate::service::ProcessRunner;
        let result = manager.send_command(config.id.unique_id, &runner, "say hi").await;
        assert!(matches!(result, Err(ServiceError::UnknownService(_))));
    }

    #[tokio::test]
    async fn snapshots_matching_filters_by_glob() {
        let manager = ServiceManager::new();
        let allocator = LocalIdAllocator::default();
        manager.create(&sample_task(), &one_candidate(), &WeightedLoadPlacement, &allocator).await.unwrap();
        assert_eq!(manager.snapshots_matching("lobby-*").len(), 1);
        assert_eq!(manager.snapshots_matching("arena-*").len(), 0);
    }
}
