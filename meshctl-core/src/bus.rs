// Copyright 2026. The meshctl Community
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met: see LICENSE.

//! C5 — Channel-Message Bus.
//!
//! Targeted/multicast/query messaging layered on top of C3. Routing
//! decisions (which nodes/services a [`Target`] resolves to, and how to
//! reach them) are delegated to a [`BusTransport`] implementation, which in
//! production is backed by the cluster provider (C6) and service manager
//! (C8); tests use a small in-process double, the same way the teacher's
//! `DhtActorMock`/`ConnectivityManagerMock` stand in for the real actors.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use uuid::Uuid;

pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("no route to node {0}")]
    NoRouteToNode(String),
    #[error("no route to service {0}")]
    NoRouteToService(String),
    #[error("transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),
}

/// One addressing mode for a [`ChannelMessage`] (§3).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Target {
    All,
    AllNodes,
    AllServices,
    Node(String),
    Service(String),
    Task(String),
    Group(String),
    Environment(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub sender: Uuid,
    pub targets: Vec<Target>,
    pub channel: String,
    pub message: String,
    pub content: Bytes,
    pub send_sync: bool,
    pub query_unique_id: Option<Uuid>,
}

impl ChannelMessage {
    pub fn new(sender: Uuid, targets: Vec<Target>, channel: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            sender,
            targets,
            channel: channel.into(),
            message: message.into(),
            content: Bytes::new(),
            send_sync: false,
            query_unique_id: None,
        }
    }

    pub fn with_content(mut self, content: impl Into<Bytes>) -> Self {
        self.content = content.into();
        self
    }

    pub fn as_query(mut self) -> Self {
        self.query_unique_id = Some(Uuid::new_v4());
        self
    }

    pub fn reply(&self, sender: Uuid, message: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Self {
            sender,
            targets: vec![Target::Node(String::new())], // caller overwrites with the real return path
            channel: self.channel.clone(),
            message: message.into(),
            content: content.into(),
            send_sync: false,
            query_unique_id: self.query_unique_id,
        }
    }
}

/// Routing collaborator the bus delegates delivery decisions to. The
/// production implementation is backed by C6 (node roster) and C8 (local
/// service lookup / task-group-environment expansion).
#[async_trait]
pub trait BusTransport: Send + Sync {
    async fn ready_node_names(&self) -> Vec<String>;
    async fn send_to_node(&self, node: &str, msg: ChannelMessage) -> Result<(), BusError>;

    async fn connected_service_names(&self) -> Vec<String>;
    async fn is_local_service(&self, service: &str) -> bool;
    async fn deliver_to_local_service(&self, service: &str, msg: ChannelMessage) -> Result<(), BusError>;
    async fn owning_node_of_service(&self, service: &str) -> Option<String>;

    async fn services_in_task(&self, task: &str) -> Vec<String>;
    async fn services_in_group(&self, group: &str) -> Vec<String>;
    async fn services_in_environment(&self, env: &str) -> Vec<String>;
}

pub type Handler = Arc<dyn Fn(&ChannelMessage) -> Option<Bytes> + Send + Sync>;

struct PendingQuery {
    expected: usize,
    replies: Mutex<Vec<ChannelMessage>>,
    notify: Notify,
}

#[derive(Debug, Clone)]
pub struct QueryResult {
    pub replies: Vec<ChannelMessage>,
    pub timed_out_waiting_for: usize,
}

pub struct MessageBus<T: BusTransport> {
    transport: Arc<T>,
    subscribers: RwLock<HashMap<(String, Option<String>), Vec<Handler>>>,
    pending: Mutex<HashMap<Uuid, Arc<PendingQuery>>>,
}

impl<T: BusTransport> MessageBus<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self { transport, subscribers: RwLock::new(HashMap::new()), pending: Mutex::new(HashMap::new()) }
    }

    /// Registers a handler for `(channel, message)`; `message = None`
    /// matches every message on that channel. Handlers run in registration
    /// order.
    pub fn subscribe(&self, channel: impl Into<String>, message: Option<String>, handler: Handler) {
        self.subscribers
            .write()
            .expect("bus subscriber lock poisoned")
            .entry((channel.into(), message))
            .or_default()
            .push(handler);
    }

    /// Resolves `msg.targets` into the concrete (node, service) delivery
    /// set and best-effort delivers to each, including local subscribers
    /// when a target includes this node. Returns the number of deliveries
    /// attempted (local dispatch excluded from the count, used by `query`
    /// to size its expected-reply wait).
    pub async fn publish(&self, msg: ChannelMessage) -> Result<usize, BusError> {
        let mut node_targets = Vec::new();
        let mut service_targets = Vec::new();

        for target in &msg.targets {
            match target {
                Target::All | Target::AllNodes => node_targets.extend(self.transport.ready_node_names().await),
                Target::Node(name) => node_targets.push(name.clone()),
                Target::Service(name) => service_targets.push(name.clone()),
                Target::Task(name) => service_targets.extend(self.transport.services_in_task(name).await),
                Target::Group(name) => service_targets.extend(self.transport.services_in_group(name).await),
                Target::Environment(name) => service_targets.extend(self.transport.services_in_environment(name).await),
                Target::AllServices => {},
            }
            if matches!(target, Target::All | Target::AllServices) {
                service_targets.extend(self.transport.connected_service_names().await);
            }
        }
        node_targets.sort();
        node_targets.dedup();
        service_targets.sort();
        service_targets.dedup();

        // Local dispatch happens once, regardless of how many remote
        // targets also match, mirroring "also deliver to local subscribers".
        if msg.targets.iter().any(|t| matches!(t, Target::All | Target::AllNodes)) {
            self.dispatch_local(&msg);
        }

        let mut attempted = 0usize;
        for node in &node_targets {
            attempted += 1;
            if let Err(e) = self.transport.send_to_node(node, msg.clone()).await {
                log::warn!("failed to deliver channel message to node {}: {}", node, e);
            }
        }
        for service in &service_targets {
            attempted += 1;
            let result = if self.transport.is_local_service(service).await {
                self.dispatch_local(&msg);
                self.transport.deliver_to_local_service(service, msg.clone()).await
            } else {
                match self.transport.owning_node_of_service(service).await {
                    Some(owner) => self.transport.send_to_node(&owner, msg.clone()).await,
                    None => Err(BusError::NoRouteToService(service.clone())),
                }
            };
            if let Err(e) = result {
                log::warn!("failed to deliver channel message to service {}: {}", service, e);
            }
        }

        Ok(node_targets.len() + service_targets.len())
    }

    /// Dispatches a message that arrived over the wire. If its
    /// `query_unique_id` correlates to a query we are waiting on, it is a
    /// reply and is routed there instead of through subscribers.
    pub fn receive_inbound(&self, msg: ChannelMessage) -> Option<Bytes> {
        if let Some(qid) = msg.query_unique_id {
            let pending = self.pending.lock().expect("pending query lock poisoned").get(&qid).cloned();
            if let Some(pending) = pending {
                pending.replies.lock().expect("pending query lock poisoned").push(msg);
                pending.notify.notify_waiters();
                return None;
            }
        }
        self.dispatch_local(&msg)
    }

    fn dispatch_local(&self, msg: &ChannelMessage) -> Option<Bytes> {
        let handlers: Vec<Handler> = {
            let guard = self.subscribers.read().expect("bus subscriber lock poisoned");
            let mut out = Vec::new();
            if let Some(exact) = guard.get(&(msg.channel.clone(), Some(msg.message.clone()))) {
                out.extend(exact.iter().cloned());
            }
            if let Some(wildcard) = guard.get(&(msg.channel.clone(), None)) {
                out.extend(wildcard.iter().cloned());
            }
            out
        };
        let mut reply = None;
        for handler in handlers {
            if let Some(r) = handler(msg) {
                if msg.query_unique_id.is_some() && reply.is_none() {
                    reply = Some(r);
                }
            }
        }
        reply
    }

    /// Sends a query and gathers all replies that arrive within `timeout`.
    /// `expected` is the number of resolved targets (how many replies would
    /// complete the wait early); pass `0` to always wait the full timeout.
    pub async fn query(&self, msg: ChannelMessage, timeout: Duration) -> Result<QueryResult, BusError> {
        let qid = msg.query_unique_id.expect("query() requires ChannelMessage::as_query()");
        let mut msg = msg;
        if msg.targets.is_empty() {
            msg.targets = vec![Target::All];
        }
        // Pre-resolve expected count without delivering twice.
        let expected = self.resolved_target_count(&msg).await;

        let pending = Arc::new(PendingQuery { expected, replies: Mutex::new(Vec::new()), notify: Notify::new() });
        self.pending.lock().expect("pending query lock poisoned").insert(qid, pending.clone());

        self.publish(msg).await?;

        let wait = async {
            loop {
                {
                    let replies = pending.replies.lock().expect("pending query lock poisoned");
                    if expected > 0 && replies.len() >= expected {
                        break;
                    }
                }
                pending.notify.notified().await;
            }
        };
        let _ = tokio::time::timeout(timeout, wait).await;

        self.pending.lock().expect("pending query lock poisoned").remove(&qid);
        let replies = pending.replies.lock().expect("pending query lock poisoned").clone();
        let timed_out_waiting_for = expected.saturating_sub(replies.len());
        Ok(QueryResult { replies, timed_out_waiting_for })
    }

    /// Returns the first reply received, or `None` on timeout / no replies.
    pub async fn send_single_query(&self, msg: ChannelMessage, timeout: Duration) -> Result<Option<ChannelMessage>, BusError> {
        let result = self.query(msg, timeout).await?;
        Ok(result.replies.into_iter().next())
    }

    /// Drops a query's correlation entry without waiting for more replies
    /// (cancellation, §5: "removes the correlation entry... does not
    /// attempt to abort the remote work").
    pub fn cancel_query(&self, query_unique_id: Uuid) {
        self.pending.lock().expect("pending query lock poisoned").remove(&query_unique_id);
    }

    async fn resolved_target_count(&self, msg: &ChannelMessage) -> usize {
        let mut count = 0;
        for target in &msg.targets {
            count += match target {
                Target::All | Target::AllNodes => self.transport.ready_node_names().await.len(),
                Target::AllServices => self.transport.connected_service_names().await.len(),
                Target::Node(_) | Target::Service(_) => 1,
                Target::Task(name) => self.transport.services_in_task(name).await.len(),
                Target::Group(name) => self.transport.services_in_group(name).await.len(),
                Target::Environment(name) => self.transport.services_in_environment(name).await.len(),
            };
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A transport double that loops every "send" straight back into the
    /// same bus's `receive_inbound`, so a query fans out to N logical nodes
    /// without needing real sockets.
    struct LoopbackTransport {
        ready_nodes: Vec<String>,
        unreachable_nodes: std::collections::HashSet<String>,
        bus: Mutex<Option<Arc<MessageBus<LoopbackTransport>>>>,
        responder: Box<dyn Fn(&str, &ChannelMessage) -> Option<Bytes> + Send + Sync>,
    }

    #[async_trait]
    impl BusTransport for LoopbackTransport {
        async fn ready_node_names(&self) -> Vec<String> {
            self.ready_nodes.clone()
        }

        async fn send_to_node(&self, node: &str, msg: ChannelMessage) -> Result<(), BusError> {
            if self.unreachable_nodes.contains(node) {
                return Ok(()); // simulates a timeout: message vanishes, no reply.
            }
            if let Some(reply_content) = (self.responder)(node, &msg) {
                let qid = msg.query_unique_id.unwrap();
                let reply = ChannelMessage {
                    sender: Uuid::new_v4(),
                    targets: vec![],
                    channel: msg.channel.clone(),
                    message: "reply".into(),
                    content: reply_content,
                    send_sync: false,
                    query_unique_id: Some(qid),
                };
                if let Some(bus) = self.bus.lock().unwrap().clone() {
                    bus.receive_inbound(reply);
                }
            }
            Ok(())
        }

        async fn connected_service_names(&self) -> Vec<String> {
            vec![]
        }

        async fn is_local_service(&self, _service: &str) -> bool {
            false
        }

        async fn deliver_to_local_service(&self, _service: &str, _msg: ChannelMessage) -> Result<(), BusError> {
            Ok(())
        }

        async fn owning_node_of_service(&self, _service: &str) -> Option<String> {
            None
        }

        async fn services_in_task(&self, _task: &str) -> Vec<String> {
            vec![]
        }

        async fn services_in_group(&self, _group: &str) -> Vec<String> {
            vec![]
        }

        async fn services_in_environment(&self, _env: &str) -> Vec<String> {
            vec![]
        }
    }

    fn make_bus(ready_nodes: Vec<&str>, unreachable: Vec<&str>) -> Arc<MessageBus<LoopbackTransport>> {
        let transport = Arc::new(LoopbackTransport {
            ready_nodes: ready_nodes.into_iter().map(String::from).collect(),
            unreachable_nodes: unreachable.into_iter().map(String::from).collect(),
            bus: Mutex::new(None),
            responder: Box::new(|node, _msg| Some(Bytes::from(format!("hello from {node}")))),
        });
        let bus = Arc::new(MessageBus::new(transport.clone()));
        *transport.bus.lock().unwrap() = Some(bus.clone());
        bus
    }

    #[tokio::test]
    async fn query_to_two_ready_nodes_returns_two_replies() {
        let bus = make_bus(vec!["A", "B"], vec![]);
        let msg = ChannelMessage::new(Uuid::new_v4(), vec![Target::Node("A".into()), Target::Node("B".into())], "ch", "ping")
            .as_query();
        let result = bus.query(msg, Duration::from_millis(500)).await.unwrap();
        assert_eq!(result.replies.len(), 2);
        assert_eq!(result.timed_out_waiting_for, 0);
    }

    #[tokio::test]
    async fn one_target_timing_out_still_returns_the_others_reply() {
        let bus = make_bus(vec!["A", "B"], vec!["B"]);
        let msg = ChannelMessage::new(Uuid::new_v4(), vec![Target::Node("A".into()), Target::Node("B".into())], "ch", "ping")
            .as_query();
        let result = bus.query(msg, Duration::from_millis(200)).await.unwrap();
        assert_eq!(result.replies.len(), 1);
        assert_eq!(result.timed_out_waiting_for, 1);
    }

    #[tokio::test]
    async fn query_to_missing_target_returns_empty_without_panicking() {
        let bus = make_bus(vec![], vec![]);
        let msg = ChannelMessage::new(Uuid::new_v4(), vec![Target::Service("missing".into())], "ch", "ping").as_query();
        let result = bus.query(msg, Duration::from_millis(500)).await.unwrap();
        assert!(result.replies.is_empty());
    }

    #[tokio::test]
    async fn subscribers_see_messages_in_registration_order() {
        let bus = make_bus(vec![], vec![]);
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            bus.subscribe(
                "ch",
                None,
                Arc::new(move |_msg| {
                    order.lock().unwrap().push(i);
                    None
                }),
            );
        }
        bus.receive_inbound(ChannelMessage::new(Uuid::new_v4(), vec![], "ch", "hi"));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn send_single_query_returns_first_reply() {
        let bus = make_bus(vec!["A"], vec![]);
        let msg = ChannelMessage::new(Uuid::new_v4(), vec![Target::Node("A".into())], "ch", "ping").as_query();
        let reply = bus.send_single_query(msg, Duration::from_millis(200)).await.unwrap();
        assert!(reply.is_some());
    }

    #[tokio::test]
    async fn cancel_query_stops_late_replies_from_being_collected() {
        let bus = make_bus(vec!["A"], vec![]);
        let qid = Uuid::new_v4();
        let msg = ChannelMessage { query_unique_id: Some(qid), ..ChannelMessage::new(Uuid::new_v4(), vec![], "ch", "ping") };
        bus.pending.lock().unwrap().insert(
            qid,
            Arc::new(PendingQuery { expected: 1, replies: Mutex::new(vec![]), notify: Notify::new() }),
        );
        bus.cancel_query(qid);
        assert!(bus.pending.lock().unwrap().get(&qid).is_none());
        let _ = msg;
        let _ = AtomicUsize::new(0);
    }
}
