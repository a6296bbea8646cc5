// Copyright 2026. The meshctl Community
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met: see LICENSE.

//! C6 — Node Server Provider.
//!
//! Cluster membership, connection auth handshake, and head election.
//! Election is deterministic rather than a voting protocol: the ready node
//! with the lowest [`NodeIdentity::unique_id`] is head. Losing the
//! connection to a peer marks it `DISCONNECTED` and immediately recomputes
//! the head, rather than waiting for an explicit leave message.
//!
//! Every peer a node can ever admit is named in [`crate::config::ClusterConfig::remote_nodes`]
//! up front; the roster never grows at runtime. A node reconnecting after
//! being `DISCONNECTED` gets pushed the full data sync snapshot exactly once
//! (§8), gated behind an intermediate `SYNCING` state until it acknowledges.

mod auth;

pub use auth::{AgentAuthRequest, AgentAuthResponse, AuthFrame, AuthRequest, AuthResponse};

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::{Arc, RwLock},
};

use bytes::Bytes;
use tokio::{net::TcpListener, sync::Notify};
use uuid::Uuid;

use crate::{
    backoff::Backoff,
    identity::NodeIdentity,
    service::ServiceManager,
    sync::DataSyncRegistry,
    transport::{channel_ids, dial, Frame, TransportChannel, TransportError},
};

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("peer {0} rejected authentication: {1}")]
    AuthRejected(String, String),
    #[error("unknown peer {0}")]
    UnknownPeer(String),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("malformed auth message: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("data sync error: {0}")]
    Sync(#[from] crate::sync::SyncError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Disconnected,
    Connecting,
    Syncing,
    Ready,
}

#[derive(Clone)]
pub struct PeerNode {
    pub identity: NodeIdentity,
    pub state: NodeState,
    pub channel: Option<TransportChannel>,
}

/// The display/addressing name for a peer, derived from its identity since
/// the roster carries no separately-configured human name (§4.3).
pub fn display_name(identity: &NodeIdentity) -> String {
    format!("node-{}", identity.unique_id)
}

type PeerReadyHook = Arc<dyn Fn(&str) + Send + Sync>;
type PeerLostHook = Arc<dyn Fn(&str) + Send + Sync>;
type HeadChangedHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Tracks cluster membership for one running node and decides who is head.
pub struct NodeServer {
    pub self_name: String,
    pub self_identity: NodeIdentity,
    cluster_id: Uuid,
    peers: RwLock<HashMap<Uuid, PeerNode>>,
    head: RwLock<Option<String>>,
    data_sync: Arc<DataSyncRegistry>,
    services: Arc<ServiceManager>,
    on_peer_ready: RwLock<Option<PeerReadyHook>>,
    on_peer_lost: RwLock<Option<PeerLostHook>>,
    on_head_changed: RwLock<Option<HeadChangedHook>>,
    shutdown: Arc<Notify>,
}

impl NodeServer {
    pub fn new(
        self_name: impl Into<String>,
        self_identity: NodeIdentity,
        cluster_id: Uuid,
        configured_peers: Vec<NodeIdentity>,
        data_sync: Arc<DataSyncRegistry>,
        services: Arc<ServiceManager>,
    ) -> Arc<Self> {
        let mut peers = HashMap::new();
        for identity in configured_peers {
            peers.insert(identity.unique_id, PeerNode { identity, state: NodeState::Disconnected, channel: None });
        }
        Arc::new(Self {
            self_name: self_name.into(),
            self_identity,
            cluster_id,
            peers: RwLock::new(peers),
            head: RwLock::new(None),
            data_sync,
            services,
            on_peer_ready: RwLock::new(None),
            on_peer_lost: RwLock::new(None),
            on_head_changed: RwLock::new(None),
            shutdown: Arc::new(Notify::new()),
        })
    }

    pub fn set_on_peer_ready(&self, hook: PeerReadyHook) {
        *self.on_peer_ready.write().expect("cluster lock poisoned") = Some(hook);
    }

    pub fn set_on_peer_lost(&self, hook: PeerLostHook) {
        *self.on_peer_lost.write().expect("cluster lock poisoned") = Some(hook);
    }

    pub fn set_on_head_changed(&self, hook: HeadChangedHook) {
        *self.on_head_changed.write().expect("cluster lock poisoned") = Some(hook);
    }

    pub fn request_shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    /// Binds `addr` and accepts inbound connections, authenticating each
    /// one before admitting it to the roster. Runs until
    /// [`NodeServer::request_shutdown`] is called.
    pub async fn listen(self: &Arc<Self>, addr: SocketAddr) -> Result<(), ClusterError> {
        let listener = TcpListener::bind(addr).await?;
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => return Ok(()),
                accepted = listener.accept() => {
                    let (stream, remote_addr) = accepted?;
                    let this = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.accept_one(stream, remote_addr).await {
                            log::warn!("inbound auth handshake from {} failed: {}", remote_addr, e);
                        }
                    });
                }
            }
        }
    }

    async fn accept_one(self: &Arc<Self>, stream: tokio::net::TcpStream, remote_addr: SocketAddr) -> Result<(), ClusterError> {
        let channel = TransportChannel::spawn(stream, remote_addr, || {});
        let mut listener = channel.register_listener(channel_ids::AUTH);
        let frame = listener.recv().await.ok_or(TransportError::ChannelClosed)?;
        let auth_frame: AuthFrame = serde_json::from_slice(&frame.payload)?;
        match auth_frame {
            AuthFrame::NodeToNode(request) => self.accept_node(request, channel).await,
            AuthFrame::WrapperToNode(request) => self.accept_agent(request, channel).await,
        }
    }

    async fn accept_node(self: &Arc<Self>, request: AuthRequest, channel: TransportChannel) -> Result<(), ClusterError> {
        if request.cluster_id != self.cluster_id {
            let response = AuthResponse { accepted: false, reason: Some("cluster id mismatch".into()), reinit: false, sync_session_id: None };
            channel.send_frame_sync(Frame::new(channel_ids::AUTH, serde_json::to_vec(&response)?)).await?;
            return Err(ClusterError::AuthRejected(request.identity.unique_id.to_string(), "cluster id mismatch".into()));
        }
        if !self.peers.read().expect("cluster lock poisoned").contains_key(&request.identity.unique_id) {
            let response = AuthResponse { accepted: false, reason: Some("peer not in configured roster".into()), reinit: false, sync_session_id: None };
            channel.send_frame_sync(Frame::new(channel_ids::AUTH, serde_json::to_vec(&response)?)).await?;
            return Err(ClusterError::AuthRejected(request.identity.unique_id.to_string(), "not configured".into()));
        }

        let was_disconnected = self
            .peers
            .read()
            .expect("cluster lock poisoned")
            .get(&request.identity.unique_id)
            .map(|p| p.state == NodeState::Disconnected)
            .unwrap_or(false);
        let session_id = was_disconnected.then(Uuid::new_v4);
        let response = AuthResponse { accepted: true, reason: None, reinit: was_disconnected, sync_session_id: session_id };
        channel.send_frame_sync(Frame::new(channel_ids::AUTH, serde_json::to_vec(&response)?)).await?;

        if let Some(session_id) = session_id {
            let snapshot = self.data_sync.full_snapshot().await;
            let body = serde_json::to_vec(&snapshot)?;
            send_chunked_payload(&channel, session_id, &body).await?;
        }

        let identity = request.identity.clone();
        let peer_id = identity.unique_id;
        if was_disconnected {
            self.mark_syncing(identity, channel.clone());
            let mut ack_listener = channel.register_listener(channel_ids::SERVICE_SYNC_ACK);
            let this = self.clone();
            tokio::spawn(async move {
                if ack_listener.recv().await.is_some() {
                    this.promote_to_ready(peer_id);
                }
            });
        } else {
            self.admit_ready_directly(identity, channel.clone());
        }

        let lost_server = self.clone();
        tokio::spawn(async move {
            channel.closed().await;
            lost_server.remove_peer(peer_id);
        });
        Ok(())
    }

    async fn accept_agent(&self, request: AgentAuthRequest, channel: TransportChannel) -> Result<(), ClusterError> {
        match self.services.bind_agent_channel(request.service_id, &request.connection_key, channel.clone()) {
            Ok(()) => {
                let response = AgentAuthResponse { accepted: true, reason: None };
                channel.send_frame_sync(Frame::new(channel_ids::AUTH, serde_json::to_vec(&response)?)).await?;
                Ok(())
            },
            Err(e) => {
                let response = AgentAuthResponse { accepted: false, reason: Some(e.to_string()) };
                channel.send_frame_sync(Frame::new(channel_ids::AUTH, serde_json::to_vec(&response)?)).await?;
                Err(ClusterError::AuthRejected(request.service_id.to_string(), e.to_string()))
            },
        }
    }

    /// Dials `addr`, performs the outbound side of the auth handshake, and
    /// admits the peer on success. `peer_identity` must be one of the
    /// identities this node was configured with (§4.3).
    pub async fn connect_to(self: &Arc<Self>, addr: SocketAddr, peer_identity: NodeIdentity) -> Result<(), ClusterError> {
        let channel = dial(addr, || {}).await?;
        let mut auth_listener = channel.register_listener(channel_ids::AUTH);
        let mut chunk_listener = channel.register_listener(channel_ids::CHUNKED_TRANSFER);

        let request = AuthFrame::NodeToNode(AuthRequest { cluster_id: self.cluster_id, identity: self.self_identity.clone() });
        channel.send_frame_sync(Frame::new(channel_ids::AUTH, serde_json::to_vec(&request)?)).await?;

        let frame = auth_listener.recv().await.ok_or(TransportError::ChannelClosed)?;
        let response: AuthResponse = serde_json::from_slice(&frame.payload)?;
        if !response.accepted {
            return Err(ClusterError::AuthRejected(peer_identity.unique_id.to_string(), response.reason.unwrap_or_default()));
        }

        if response.reinit {
            let session_id = response.sync_session_id.expect("reinit always carries a sync session id");
            let body = receive_chunked_payload(&mut chunk_listener, session_id).await?;
            let snapshot: Vec<crate::sync::SyncEnvelope> = serde_json::from_slice(&body)?;
            let applied = self.data_sync.apply_batch(snapshot).await?;
            log::info!("applied {} entries from {}'s full sync", applied, display_name(&peer_identity));
            channel.send_frame_sync(Frame::new(channel_ids::SERVICE_SYNC_ACK, Bytes::new())).await?;
        }

        let peer_id = peer_identity.unique_id;
        self.admit_ready_directly(peer_identity, channel.clone());
        let server = self.clone();
        tokio::spawn(async move {
            channel.closed().await;
            server.remove_peer(peer_id);
        });
        Ok(())
    }

    /// Connects to `addr`, retrying with [`Backoff::reconnect`] until
    /// successful or [`NodeServer::request_shutdown`] fires.
    pub async fn reconnect_loop(self: &Arc<Self>, addr: SocketAddr, peer_identity: NodeIdentity) {
        let mut backoff = Backoff::reconnect();
        loop {
            match self.connect_to(addr, peer_identity.clone()).await {
                Ok(()) => {
                    backoff.reset();
                    self.wait_until_peer_lost(peer_identity.unique_id).await;
                },
                Err(e) => {
                    log::warn!("reconnect to {} ({}) failed: {}", display_name(&peer_identity), addr, e);
                },
            }
            let delay = backoff.next_delay();
            tokio::select! {
                _ = self.shutdown.notified() => return,
                _ = tokio::time::sleep(delay) => {},
            }
        }
    }

    async fn wait_until_peer_lost(&self, peer_id: Uuid) {
        loop {
            let disconnected = self.peers.read().expect("cluster lock poisoned").get(&peer_id).map(|p| p.state == NodeState::Disconnected).unwrap_or(true);
            if disconnected {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }

    fn mark_syncing(&self, identity: NodeIdentity, channel: TransportChannel) {
        let mut peers = self.peers.write().expect("cluster lock poisoned");
        peers.insert(identity.unique_id, PeerNode { identity, state: NodeState::Syncing, channel: Some(channel) });
    }

    fn promote_to_ready(&self, peer_id: Uuid) {
        let name = {
            let mut peers = self.peers.write().expect("cluster lock poisoned");
            let Some(peer) = peers.get_mut(&peer_id) else { return };
            if peer.state != NodeState::Syncing {
                return;
            }
            peer.state = NodeState::Ready;
            display_name(&peer.identity)
        };
        self.recompute_head();
        if let Some(hook) = self.on_peer_ready.read().expect("cluster lock poisoned").clone() {
            hook(&name);
        }
    }

    fn admit_ready_directly(&self, identity: NodeIdentity, channel: TransportChannel) {
        let name = display_name(&identity);
        {
            let mut peers = self.peers.write().expect("cluster lock poisoned");
            peers.insert(identity.unique_id, PeerNode { identity, state: NodeState::Ready, channel: Some(channel) });
        }
        self.recompute_head();
        if let Some(hook) = self.on_peer_ready.read().expect("cluster lock poisoned").clone() {
            hook(&name);
        }
    }

    fn remove_peer(&self, peer_id: Uuid) {
        let name = {
            let mut peers = self.peers.write().expect("cluster lock poisoned");
            let Some(peer) = peers.get_mut(&peer_id) else { return };
            if peer.state == NodeState::Disconnected {
                return;
            }
            peer.state = NodeState::Disconnected;
            peer.channel = None;
            display_name(&peer.identity)
        };
        self.recompute_head();
        if let Some(hook) = self.on_peer_lost.read().expect("cluster lock poisoned").clone() {
            hook(&name);
        }
    }

    fn recompute_head(&self) {
        let (candidate_name, changed_to) = {
            let peers = self.peers.read().expect("cluster lock poisoned");
            let mut candidate_name = self.self_name.clone();
            let mut candidate_id = self.self_identity.unique_id;
            for peer in peers.values().filter(|p| p.state == NodeState::Ready) {
                if peer.identity.unique_id < candidate_id {
                    candidate_id = peer.identity.unique_id;
                    candidate_name = display_name(&peer.identity);
                }
            }
            let mut head = self.head.write().expect("cluster lock poisoned");
            if head.as_deref() != Some(candidate_name.as_str()) {
                log::info!("cluster head is now {}", candidate_name);
                *head = Some(candidate_name.clone());
                (candidate_name, true)
            } else {
                (candidate_name, false)
            }
        };
        if changed_to {
            if let Some(hook) = self.on_head_changed.read().expect("cluster lock poisoned").clone() {
                hook(&candidate_name);
            }
        }
    }

    pub fn head_name(&self) -> Option<String> {
        self.head.read().expect("cluster lock poisoned").clone()
    }

    pub fn is_self_head(&self) -> bool {
        self.head_name().as_deref() == Some(self.self_name.as_str())
    }

    pub fn ready_peer_names(&self) -> Vec<String> {
        self.peers
            .read()
            .expect("cluster lock poisoned")
            .values()
            .filter(|p| p.state == NodeState::Ready)
            .map(|p| display_name(&p.identity))
            .collect()
    }

    pub fn peer_channel(&self, name: &str) -> Option<TransportChannel> {
        self.peers.read().expect("cluster lock poisoned").values().find(|p| display_name(&p.identity) == name).and_then(|p| p.channel.clone())
    }

    /// Peers currently admitted (`SYNCING` or `READY`), not counting
    /// configured-but-never-seen or `DISCONNECTED` peers.
    pub fn peer_count(&self) -> usize {
        self.peers.read().expect("cluster lock poisoned").values().filter(|p| p.state != NodeState::Disconnected).count()
    }

    /// Every peer identity this node was configured with, regardless of
    /// current connection state. Used by the bootstrap dialer to know who
    /// to attempt outbound connections to.
    pub fn configured_peer_identities(&self) -> Vec<NodeIdentity> {
        self.peers.read().expect("cluster lock poisoned").values().map(|p| p.identity.clone()).collect()
    }
}

/// Splits `body` into `ChunkPacket`s under `session_id` and writes them to
/// `channel` in order (§4.3 full sync, §8: "pushed... exactly once"). The
/// auth response names `session_id` before any chunk is sent so the
/// receiver can open its staging session in time.
async fn send_chunked_payload(channel: &TransportChannel, session_id: Uuid, body: &[u8]) -> Result<(), ClusterError> {
    let mut offset = 0usize;
    let mut index = 0u32;
    loop {
        let end = (offset + crate::chunked::DEFAULT_CHUNK_SIZE).min(body.len());
        let is_last = end == body.len();
        let payload = Bytes::copy_from_slice(&body[offset..end]);
        let packet = crate::chunked::ChunkPacket { session_id, index, is_last, payload };
        channel.send_frame_sync(packet.into_frame()).await?;
        if is_last {
            return Ok(());
        }
        offset = end;
        index += 1;
    }
}

/// Reassembles a chunked-transfer session from `listener` into memory,
/// stopping at the packet flagged `is_last`.
async fn receive_chunked_payload(listener: &mut tokio::sync::mpsc::UnboundedReceiver<Frame>, session_id: Uuid) -> Result<Vec<u8>, ClusterError> {
    let mut body = Vec::new();
    let mut expected_index = 0u32;
    loop {
        let frame = listener.recv().await.ok_or(TransportError::ChannelClosed)?;
        let packet = crate::chunked::ChunkPacket::decode(frame.payload).map_err(|e| ClusterError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())))?;
        if packet.session_id != session_id || packet.index != expected_index {
            continue;
        }
        expected_index += 1;
        let is_last = packet.is_last;
        body.extend_from_slice(&packet.payload);
        if is_last {
            return Ok(body);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{service::ServiceManager, sync::DataSyncRegistry};

    fn make_server(port_hint: u16, configured_peers: Vec<NodeIdentity>) -> Arc<NodeServer> {
        let identity = NodeIdentity::random(vec![format!("127.0.0.1:{port_hint}").parse().unwrap()]);
        make_server_with_identity(port_hint, identity, configured_peers)
    }

    fn make_server_with_identity(port_hint: u16, identity: NodeIdentity, configured_peers: Vec<NodeIdentity>) -> Arc<NodeServer> {
        NodeServer::new(format!("node-{port_hint}"), identity, Uuid::nil(), configured_peers, Arc::new(DataSyncRegistry::new()), Arc::new(ServiceManager::new()))
    }

    fn test_channel() -> TransportChannel {
        TransportChannel::spawn(tokio::io::duplex(64).0, "127.0.0.1:1".parse().unwrap(), || {})
    }

    #[test]
    fn a_lone_node_is_its_own_head() {
        let server = make_server(1, vec![]);
        server.recompute_head();
        assert!(server.is_self_head());
    }

    #[tokio::test]
    async fn lowest_unique_id_among_ready_peers_is_elected_head() {
        let lower = NodeIdentity::new(Uuid::nil(), vec![]);
        let higher = NodeIdentity::new(Uuid::max(), vec![]);
        let server = make_server(2, vec![lower.clone(), higher.clone()]);
        server.admit_ready_directly(lower, test_channel());
        server.admit_ready_directly(higher, test_channel());
        assert_eq!(server.head_name().as_deref(), Some("node-00000000-0000-0000-0000-000000000000"));
        assert!(!server.is_self_head());
    }

    #[tokio::test]
    async fn losing_the_head_peer_triggers_reelection() {
        let lower = NodeIdentity::new(Uuid::nil(), vec![]);
        let server = make_server(3, vec![lower.clone()]);
        server.admit_ready_directly(lower.clone(), test_channel());
        assert_eq!(server.head_name(), Some(display_name(&lower)));
        server.remove_peer(lower.unique_id);
        assert!(server.is_self_head());
    }

    #[tokio::test]
    async fn full_handshake_over_real_sockets_admits_the_peer() {
        let dialer_server = make_server(4101, vec![]);
        let listener_server = make_server_with_identity(4100, NodeIdentity::random(vec![]), vec![dialer_server.self_identity.clone()]);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept_server = listener_server.clone();
        tokio::spawn(async move {
            let (stream, remote) = listener.accept().await.unwrap();
            accept_server.accept_one(stream, remote).await.unwrap();
        });

        dialer_server.connect_to(addr, listener_server.self_identity.clone()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(listener_server.peer_count(), 1);
        assert_eq!(dialer_server.peer_count(), 1);
    }

    #[tokio::test]
    async fn unconfigured_peer_is_rejected() {
        let accepting = make_server(4200, vec![]);
        let intruder = make_server(4201, vec![]);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept_server = accepting.clone();
        tokio::spawn(async move {
            let (stream, remote) = listener.accept().await.unwrap();
            let _ = accept_server.accept_one(stream, remote).await;
        });

        let result = intruder.connect_to(addr, accepting.self_identity.clone()).await;
        assert!(matches!(result, Err(ClusterError::AuthRejected(_, _))));
    }

    #[tokio::test]
    async fn wrong_cluster_id_is_rejected() {
        let accepting = make_server(4300, vec![]);
        let identity = NodeIdentity::random(vec![]);
        let wrong_cluster = NodeServer::new("intruder", identity, Uuid::new_v4(), vec![], Arc::new(DataSyncRegistry::new()), Arc::new(ServiceManager::new()));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept_server = accepting.clone();
        tokio::spawn(async move {
            let (stream, remote) = listener.accept().await.unwrap();
            let _ = accept_server.accept_one(stream, remote).await;
        });

        let result = wrong_cluster.connect_to(addr, accepting.self_identity.clone()).await;
        assert!(matches!(result, Err(ClusterError::AuthRejected(_, _))));
    }
}
