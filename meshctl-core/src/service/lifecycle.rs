// Copyright 2026. The meshctl Community
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met: see LICENSE.

//! Service identity and the `PREPARED -> STARTING -> RUNNING -> STOPPED ->
//! DELETED` state machine (§4.1, §4.2).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{ServiceDeployment, ServiceRemoteInclusion};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceLifecycle {
    Prepared,
    Starting,
    Running,
    Stopped,
    Deleted,
}

impl ServiceLifecycle {
    /// Legal next states from this one. `Stopped -> Starting` is a restart;
    /// `Deleted` is terminal and cannot transition anywhere, including to
    /// itself.
    pub fn can_transition_to(self, next: ServiceLifecycle) -> bool {
        use ServiceLifecycle::*;
        matches!(
            (self, next),
            (Prepared, Starting) | (Prepared, Deleted) | (Starting, Running) | (Starting, Stopped) | (Running, Stopped) | (Stopped, Starting) | (Stopped, Deleted)
        )
    }
}

/// Identifies one service instance: a task name plus a per-task sequence
/// number allocated by the cluster head (§4.3), e.g. `Lobby-1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceId {
    pub unique_id: Uuid,
    pub task_name: String,
    pub task_service_id: u32,
}

impl ServiceId {
    pub fn display_name(&self) -> String {
        format!("{}-{}", self.task_name, self.task_service_id)
    }
}

/// The static definition of one service instance, derived from a
/// `ServiceTask` at creation time and thereafter immutable (§4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfiguration {
    pub id: ServiceId,
    pub groups: Vec<String>,
    pub max_memory_mib: u64,
    pub port: u16,
    pub properties: serde_json::Value,
    pub node_name: String,
    /// Carried over from the `ServiceTask` at creation time so staging
    /// (§4.7) can run from the configuration alone, without a second
    /// lookup of the task definition at start time.
    pub templates: Vec<String>,
    pub inclusions: Vec<ServiceRemoteInclusion>,
    pub deployments: Vec<ServiceDeployment>,
}

/// The mutable, replicated view of one service's current state (§4.3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfoSnapshot {
    pub id: ServiceId,
    pub lifecycle: ServiceLifecycle,
    pub node_name: String,
    pub pid: Option<u32>,
    pub properties: serde_json::Value,
}

impl ServiceInfoSnapshot {
    pub fn new(id: ServiceId, node_name: String) -> Self {
        Self { id, lifecycle: ServiceLifecycle::Prepared, node_name, pid: None, properties: serde_json::json!({}) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_happy_path_is_legal() {
        use ServiceLifecycle::*;
        assert!(Prepared.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopped));
        assert!(Stopped.can_transition_to(Deleted));
    }

    #[test]
    fn a_stopped_service_can_restart() {
        assert!(ServiceLifecycle::Stopped.can_transition_to(ServiceLifecycle::Starting));
    }

    #[test]
    fn deleted_is_terminal() {
        assert!(!ServiceLifecycle::Deleted.can_transition_to(ServiceLifecycle::Deleted));
        assert!(!ServiceLifecycle::Deleted.can_transition_to(ServiceLifecycle::Starting));
    }

    #[test]
    fn skipping_starting_is_illegal() {
        assert!(!ServiceLifecycle::Prepared.can_transition_to(ServiceLifecycle::Running));
    }
}
