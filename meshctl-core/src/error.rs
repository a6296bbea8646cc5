// Copyright 2026. The meshctl Community
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met:
//
// 1. Redistributions of source code must retain the above copyright notice, this list of conditions and the following
// disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright notice, this list of conditions and the
// following disclaimer in the documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES,
// INCLUDING, BUT NOT LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
// DISCLAIMED.

//! Top-level error type unifying every component's error enum. Library
//! functions that cross component boundaries return `meshctl_core::Error`;
//! functions internal to one component return that component's own error
//! type, matching the error kinds named in spec §7.

use crate::{
    bus::BusError, cluster::ClusterError, config::ConfigError, registry::RegistryError,
    service::ServiceError, service::StagingError, sync::SyncError, transport::TransportError,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),
    #[error("service error: {0}")]
    Service(#[from] ServiceError),
    #[error("staging error: {0}")]
    Staging(#[from] StagingError),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("data sync error: {0}")]
    Sync(#[from] SyncError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
