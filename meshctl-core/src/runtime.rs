// Copyright 2026. The meshctl Community
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met: see LICENSE.

//! Wires every component together into one running node and exposes it
//! through a process-wide accessor (§9 "Global state": a small number of
//! call sites — signal handlers, the CLI's command dispatch — have no
//! natural path to a `Runtime` handle and need the `Runtime::global()`
//! escape hatch instead of threading it through everywhere).

use std::{path::PathBuf, sync::Arc};

use bytes::Bytes;
use once_cell::sync::OnceCell;

use crate::{
    bus::{ChannelMessage, MessageBus, Target},
    bus_transport::{pump_inbound_channel_messages, ClusterBusTransport},
    cluster::NodeServer,
    config::ClusterConfig,
    identity::NodeIdentity,
    registry::Registry,
    service::{LocalIdAllocator, ServiceManager, ServiceRunner, ID_ALLOCATION_CHANNEL, ID_ALLOCATION_MESSAGE},
    shutdown::ShutdownHandler,
    sync::{self, DataSyncRegistry},
    tick::TickLoopHandle,
};

static GLOBAL: OnceCell<Arc<Runtime>> = OnceCell::new();

/// One running node: the tick loop, cluster membership, service manager,
/// data sync registry, channel-message bus, and the pluggable-runner
/// registry, plus the persisted configuration and shutdown coordinator.
pub struct Runtime {
    pub data_dir: PathBuf,
    pub config: ClusterConfig,
    pub cluster: Arc<NodeServer>,
    pub services: Arc<ServiceManager>,
    pub data_sync: Arc<DataSyncRegistry>,
    pub bus: Arc<MessageBus<ClusterBusTransport>>,
    pub local_id_allocator: Arc<LocalIdAllocator>,
    pub runners: Registry<dyn ServiceRunner>,
    pub tick: TickLoopHandle,
    pub shutdown: Arc<ShutdownHandler>,
}

impl Runtime {
    /// Builds every collaborator and wires the cross-component hooks §4.3
    /// and §4.5 describe: a peer reaching `READY` gets its inbound channel
    /// messages pumped into the bus, a peer being lost rewrites its
    /// services to `DELETED` and publishes `service_lifecycle_update`, and
    /// a head change publishes `head_changed` cluster-wide.
    pub fn new(data_dir: PathBuf, config: ClusterConfig, self_name: impl Into<String>, identity: NodeIdentity, tick: TickLoopHandle) -> Arc<Self> {
        let self_name = self_name.into();
        let services = Arc::new(ServiceManager::new());
        let data_sync = Arc::new(DataSyncRegistry::new());
        let (tasks_handler, groups_handler) = sync::entity_handlers(data_dir.join("tasks"), data_dir.join("groups"));
        data_sync.register(tasks_handler);
        data_sync.register(groups_handler);

        let cluster = NodeServer::new(self_name.clone(), identity, config.cluster_id, config.remote_nodes.clone(), data_sync.clone(), services.clone());

        let transport = Arc::new(ClusterBusTransport::new(cluster.clone(), services.clone()));
        let bus = Arc::new(MessageBus::new(transport));

        let local_id_allocator = Arc::new(LocalIdAllocator::default());
        let allocator_for_subscriber = local_id_allocator.clone();
        let cluster_for_subscriber = cluster.clone();
        let bus_for_subscriber = bus.clone();
        bus.subscribe(
            ID_ALLOCATION_CHANNEL,
            Some(ID_ALLOCATION_MESSAGE.to_string()),
            Arc::new(move |msg: &ChannelMessage| {
                if !cluster_for_subscriber.is_self_head() {
                    return None;
                }
                let task_name = std::str::from_utf8(&msg.content).ok()?;
                let next = allocator_for_subscriber.allocate_sync(task_name);
                let _ = &bus_for_subscriber;
                Some(Bytes::copy_from_slice(&next.to_be_bytes()))
            }),
        );

        let services_for_lost = services.clone();
        let bus_for_lost = bus.clone();
        cluster.set_on_peer_lost(Arc::new(move |peer_name: &str| {
            let changed = services_for_lost.mark_node_lost(peer_name);
            if changed.is_empty() {
                return;
            }
            log::info!("peer {} lost, {} of its services rewritten to DELETED", peer_name, changed.len());
            let bus = bus_for_lost.clone();
            let payload = serde_json::to_vec(&changed).unwrap_or_default();
            tokio::spawn(async move {
                let msg = ChannelMessage::new(uuid::Uuid::nil(), vec![Target::All], "service_lifecycle_update", "deleted").with_content(Bytes::from(payload));
                let _ = bus.publish(msg).await;
            });
        }));

        let bus_for_ready = bus.clone();
        let cluster_for_ready = cluster.clone();
        cluster.set_on_peer_ready(Arc::new(move |peer_name: &str| {
            if let Some(channel) = cluster_for_ready.peer_channel(peer_name) {
                let bus = bus_for_ready.clone();
                tokio::spawn(pump_inbound_channel_messages(channel, bus));
            }
        }));

        let bus_for_head = bus.clone();
        let self_name_for_head = self_name.clone();
        cluster.set_on_head_changed(Arc::new(move |head_name: &str| {
            log::info!("{}: cluster head is now {}", self_name_for_head, head_name);
            let bus = bus_for_head.clone();
            let head_name = head_name.to_string();
            tokio::spawn(async move {
                let msg = ChannelMessage::new(uuid::Uuid::nil(), vec![Target::All], "head_changed", "elected").with_content(Bytes::from(head_name.into_bytes()));
                let _ = bus.publish(msg).await;
            });
        }));

        Arc::new(Self {
            data_dir,
            config,
            cluster,
            services,
            data_sync,
            bus,
            local_id_allocator,
            runners: Registry::new(),
            tick,
            shutdown: Arc::new(ShutdownHandler::new()),
        })
    }

    /// Installs `self` as the process-wide runtime. Panics if one is
    /// already installed; a process hosts exactly one `Runtime`.
    pub fn install(self: Arc<Self>) {
        GLOBAL.set(self).ok().expect("Runtime::install called more than once");
    }

    /// The process-wide runtime, for call sites with no direct handle
    /// (signal handlers, CLI dispatch). Panics if [`Runtime::install`] has
    /// not run yet.
    pub fn global() -> Arc<Runtime> {
        GLOBAL.get().expect("Runtime::global() called before Runtime::install()").clone()
    }

    pub fn try_global() -> Option<Arc<Runtime>> {
        GLOBAL.get().cloned()
    }
}
