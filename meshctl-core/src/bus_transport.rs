// Copyright 2026. The meshctl Community
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met: see LICENSE.

//! Production [`BusTransport`] wiring the channel-message bus (C5) to
//! cluster membership (C6) for node routing and to the local service
//! registry (C8) for service-scoped targets (§3, §4.5).

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::{
    bus::{BusError, BusTransport, ChannelMessage, MessageBus},
    cluster::NodeServer,
    service::ServiceManager,
    transport::{channel_ids, Frame, TransportChannel},
};

pub struct ClusterBusTransport {
    cluster: Arc<NodeServer>,
    services: Arc<ServiceManager>,
}

impl ClusterBusTransport {
    pub fn new(cluster: Arc<NodeServer>, services: Arc<ServiceManager>) -> Self {
        Self { cluster, services }
    }
}

#[async_trait]
impl BusTransport for ClusterBusTransport {
    async fn ready_node_names(&self) -> Vec<String> {
        self.cluster.ready_peer_names()
    }

    async fn send_to_node(&self, node: &str, msg: ChannelMessage) -> Result<(), BusError> {
        let channel = self.cluster.peer_channel(node).ok_or_else(|| BusError::NoRouteToNode(node.to_string()))?;
        let body = serde_json::to_vec(&msg).map_err(|e| BusError::NoRouteToNode(format!("{node}: {e}")))?;
        channel.send_frame_sync(Frame::new(channel_ids::CHANNEL_MESSAGE, Bytes::from(body))).await?;
        Ok(())
    }

    async fn connected_service_names(&self) -> Vec<String> {
        self.services.all_snapshots().into_iter().filter(|s| self.services.is_agent_bound(s.id.unique_id)).map(|s| s.id.display_name()).collect()
    }

    async fn is_local_service(&self, service: &str) -> bool {
        self.services.all_snapshots().into_iter().any(|s| s.id.display_name() == service)
    }

    async fn deliver_to_local_service(&self, service: &str, msg: ChannelMessage) -> Result<(), BusError> {
        let id = self
            .services
            .all_snapshots()
            .into_iter()
            .find(|s| s.id.display_name() == service)
            .map(|s| s.id.unique_id)
            .ok_or_else(|| BusError::NoRouteToService(service.to_string()))?;
        let body = serde_json::to_vec(&msg).map_err(|_| BusError::NoRouteToService(service.to_string()))?;
        self.services.send_to_agent(id, Bytes::from(body)).await.map_err(|_| BusError::NoRouteToService(service.to_string()))
    }

    async fn owning_node_of_service(&self, service: &str) -> Option<String> {
        self.services.all_snapshots().into_iter().find(|s| s.id.display_name() == service).map(|s| s.node_name)
    }

    async fn services_in_task(&self, task: &str) -> Vec<String> {
        self.services.all_snapshots().into_iter().filter(|s| s.id.task_name == task).map(|s| s.id.display_name()).collect()
    }

    async fn services_in_group(&self, group: &str) -> Vec<String> {
        self.services.all_configs().into_iter().filter(|c| c.groups.iter().any(|g| g == group)).map(|c| c.id.display_name()).collect()
    }

    async fn services_in_environment(&self, _env: &str) -> Vec<String> {
        // Environments are not a separately modeled entity in this node's
        // on-disk config; every service's membership is task/group only.
        vec![]
    }
}

/// Feeds inbound `CHANNEL_MESSAGE` frames on `channel` into `bus`, replying
/// on the same channel when a subscriber produced an answer (§4.5 query
/// correlation, §6 wire format).
pub async fn pump_inbound_channel_messages<T: BusTransport + 'static>(channel: TransportChannel, bus: Arc<MessageBus<T>>) {
    let mut listener = channel.register_listener(channel_ids::CHANNEL_MESSAGE);
    while let Some(frame) = listener.recv().await {
        let msg: ChannelMessage = match serde_json::from_slice(&frame.payload) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("dropping malformed channel message: {}", e);
                continue;
            },
        };
        if let Some(reply_content) = bus.receive_inbound(msg.clone()) {
            let reply = msg.reply(uuid::Uuid::nil(), "reply", reply_content);
            if let Ok(body) = serde_json::to_vec(&reply) {
                let _ = channel.send_frame_sync(Frame::new(channel_ids::CHANNEL_MESSAGE, Bytes::from(body))).await;
            }
        }
    }
}
