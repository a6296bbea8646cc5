// Copyright 2026. The meshctl Community
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met: see LICENSE.

//! C8 — Cloud Service Manager. See `lifecycle` for the state machine,
//! `placement` for node selection, `staging` for template/inclusion/
//! deployment handling, `runner` for the pluggable process backend
//! (C8b), and `manager` for the component that ties them together.

pub mod lifecycle;
pub mod manager;
pub mod placement;
pub mod runner;
pub mod staging;

pub use lifecycle::{ServiceConfiguration, ServiceId, ServiceInfoSnapshot, ServiceLifecycle};
pub use manager::{
    LocalIdAllocator, RemoteIdAllocator, ServiceError, ServiceIdAllocator, ServiceManager, ID_ALLOCATION_CHANNEL, ID_ALLOCATION_MESSAGE, SCREEN_BACKLOG_LINES,
};
pub use placement::{NodeLoad, PlacementStrategy, WeightedLoadPlacement};
pub use runner::{LogLineSink, ProcessRunner, RunningProcess, ServiceRunner};
pub use staging::StagingError;
