// Copyright 2026. The meshctl Community
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met: see LICENSE.

//! C9 — Shutdown Handler.
//!
//! Runs a fixed, ordered sequence of steps exactly once, using
//! `tokio_util::sync::CancellationToken` to fan the "shut down now" signal
//! out to every long-running task (the tick loop, the cluster listener,
//! reconnect loops, ...) started against it.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;

/// Ordered 8-step shutdown sequence (§5). Each step is a label only; the
/// actual work it names is registered by the component that owns it via
/// [`ShutdownHandler::on_step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShutdownStep {
    StopAcceptingNewServices,
    StopLocalServices,
    DisconnectFromPeers,
    FlushPendingSyncWrites,
    CancelInFlightQueries,
    StopTickLoop,
    CloseListenSockets,
    ReleaseDataDirectoryLock,
}

pub const STEPS: [ShutdownStep; 8] = [
    ShutdownStep::StopAcceptingNewServices,
    ShutdownStep::StopLocalServices,
    ShutdownStep::DisconnectFromPeers,
    ShutdownStep::FlushPendingSyncWrites,
    ShutdownStep::CancelInFlightQueries,
    ShutdownStep::StopTickLoop,
    ShutdownStep::CloseListenSockets,
    ShutdownStep::ReleaseDataDirectoryLock,
];

type StepAction = Box<dyn FnOnce() -> futures::future::BoxFuture<'static, ()> + Send>;

/// Coordinates an idempotent, ordered shutdown. Calling
/// [`ShutdownHandler::trigger`] more than once only runs the sequence the
/// first time; later callers just observe the same completion.
pub struct ShutdownHandler {
    token: CancellationToken,
    started: AtomicBool,
    actions: std::sync::Mutex<Vec<(ShutdownStep, StepAction)>>,
}

impl Default for ShutdownHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownHandler {
    pub fn new() -> Self {
        Self { token: CancellationToken::new(), started: AtomicBool::new(false), actions: std::sync::Mutex::new(Vec::new()) }
    }

    /// The cancellation token long-running components should select! on to
    /// notice shutdown has started.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Registers the action to run at `step`. Multiple registrations for
    /// the same step all run, in registration order, before the next step
    /// begins.
    pub fn on_step<F, Fut>(&self, step: ShutdownStep, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let boxed: StepAction = Box::new(move || Box::pin(action()));
        self.actions.lock().expect("shutdown handler lock poisoned").push((step, boxed));
    }

    /// Runs every registered action once, in step order, then cancels the
    /// token. Idempotent: a second call returns immediately.
    pub async fn trigger(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.token.cancel();
        let mut actions = std::mem::take(&mut *self.actions.lock().expect("shutdown handler lock poisoned"));
        actions.sort_by_key(|(step, _)| STEPS.iter().position(|s| s == step).unwrap_or(usize::MAX));
        for (step, action) in actions {
            log::info!("shutdown step: {:?}", step);
            action().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn steps_run_in_declared_order_regardless_of_registration_order() {
        let handler = ShutdownHandler::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        handler.on_step(ShutdownStep::StopTickLoop, move || {
            async move { o1.lock().unwrap().push(ShutdownStep::StopTickLoop) }
        });
        let o2 = order.clone();
        handler.on_step(ShutdownStep::StopAcceptingNewServices, move || {
            async move { o2.lock().unwrap().push(ShutdownStep::StopAcceptingNewServices) }
        });

        handler.trigger().await;
        let recorded = order.lock().unwrap().clone();
        assert_eq!(recorded, vec![ShutdownStep::StopAcceptingNewServices, ShutdownStep::StopTickLoop]);
    }

    #[tokio::test]
    async fn trigger_is_idempotent() {
        let handler = ShutdownHandler::new();
        let count = Arc::new(Mutex::new(0));
        let c = count.clone();
        handler.on_step(ShutdownStep::StopTickLoop, move || {
            async move { *c.lock().unwrap() += 1 }
        });
        handler.trigger().await;
        handler.trigger().await;
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn the_token_is_cancelled_after_trigger() {
        let handler = ShutdownHandler::new();
        let token = handler.token();
        assert!(!token.is_cancelled());
        handler.trigger().await;
        assert!(token.is_cancelled());
        assert!(handler.is_shutting_down());
    }
}
