// Copyright 2026. The meshctl Community
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met: see LICENSE.

//! Messages exchanged on `channel_ids::AUTH` before a connection is
//! admitted to the cluster roster (§4.3, §6). A node-to-node connection
//! carries a [`NodeToNode`](AuthFrame::NodeToNode) frame; a service's agent
//! channel binding carries [`WrapperToNode`](AuthFrame::WrapperToNode) —
//! both share the one reserved channel id, distinguished by this enum.

use uuid::Uuid;

use serde::{Deserialize, Serialize};

use crate::identity::NodeIdentity;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AuthFrame {
    NodeToNode(AuthRequest),
    WrapperToNode(AgentAuthRequest),
}

/// No shared-secret token: admission is decided from `cluster_id` plus
/// whether `identity.unique_id` is in the pre-configured roster (§4.3, §7
/// "unconfigured peers and cluster id mismatches are rejected").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequest {
    pub cluster_id: Uuid,
    pub identity: NodeIdentity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    pub accepted: bool,
    pub reason: Option<String>,
    /// Set when the peer was previously `DISCONNECTED`: the dialer must
    /// receive the chunked-transfer session named by `sync_session_id`,
    /// apply it to its own data sync registry, and answer with a
    /// `SERVICE_SYNC_ACK` frame before the connection is usable (§4.3, §8).
    pub reinit: bool,
    pub sync_session_id: Option<Uuid>,
}

/// `AUTH_SERVICE` handshake binding a spawned service's agent channel
/// (§4.7 "Agent channel").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentAuthRequest {
    pub connection_key: String,
    pub service_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentAuthResponse {
    pub accepted: bool,
    pub reason: Option<String>,
}
