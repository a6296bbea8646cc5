// Copyright 2026. The meshctl Community
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met: see LICENSE.

//! C2 — Tick Loop.
//!
//! A single cooperative ticker at a fixed cadence (20 ticks/second, i.e.
//! every 50ms) that drains a queue of short tasks in submission order. Tasks
//! enqueued while the loop is mid-tick are deferred to the next tick's
//! drain rather than executed inline, so a task can never observe its own
//! submission reentrantly.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::sync::mpsc;

pub const TICKS_PER_SECOND: u64 = 20;
pub const TICK_PERIOD: Duration = Duration::from_millis(1000 / TICKS_PER_SECOND);

type Task = Box<dyn FnOnce() + Send + 'static>;

enum Command {
    Run(Task),
    At(u64, Task),
}

/// Handle used to enqueue work and query the loop's state. Cheaply
/// cloneable; every clone shares the same underlying queue and flags.
#[derive(Clone)]
pub struct TickLoopHandle {
    sender: mpsc::UnboundedSender<Command>,
    running: Arc<AtomicBool>,
    tick_counter: Arc<AtomicU64>,
}

impl TickLoopHandle {
    /// Enqueues `task` to run on the next drain. Best-effort: if the loop
    /// has already shut down, the task is silently dropped, matching a
    /// tick loop that no longer has anywhere to run it.
    pub fn run_task<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let _ = self.sender.send(Command::Run(Box::new(task)));
    }

    /// Runs `task` at an exact future tick number.
    pub fn schedule_at<F>(&self, tick: u64, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let _ = self.sender.send(Command::At(tick, Box::new(task)));
    }

    /// Dispatches long-running work to the Tokio worker pool instead of the
    /// tick queue, per the rule that tick-loop tasks must never block.
    pub fn run_on_worker_pool<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(future);
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn current_tick(&self) -> u64 {
        self.tick_counter.load(Ordering::SeqCst)
    }

    /// Flips the running flag to false. Idempotent; the loop notices on its
    /// next iteration and stops draining further ticks.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Spawns the tick loop on the current Tokio runtime and returns a handle
/// to it plus the `JoinHandle` for the background task.
pub fn spawn() -> (TickLoopHandle, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let running = Arc::new(AtomicBool::new(true));
    let tick_counter = Arc::new(AtomicU64::new(0));
    let handle = TickLoopHandle {
        sender: tx,
        running: running.clone(),
        tick_counter: tick_counter.clone(),
    };
    let join = tokio::spawn(run_loop(rx, running, tick_counter));
    (handle, join)
}

async fn run_loop(mut rx: mpsc::UnboundedReceiver<Command>, running: Arc<AtomicBool>, tick_counter: Arc<AtomicU64>) {
    let mut interval = tokio::time::interval(TICK_PERIOD);
    let mut run_queue: Vec<Task> = Vec::new();
    let mut scheduled: BTreeMap<u64, Vec<Task>> = BTreeMap::new();

    while running.load(Ordering::SeqCst) {
        interval.tick().await;
        let tick = tick_counter.fetch_add(1, Ordering::SeqCst) + 1;

        while let Ok(cmd) = rx.try_recv() {
            match cmd {
                Command::Run(task) => run_queue.push(task),
                Command::At(at_tick, task) => scheduled.entry(at_tick).or_default().push(task),
            }
        }

        for task in run_queue.drain(..) {
            task();
        }

        if let Some(due) = scheduled.remove(&tick) {
            for task in due {
                task();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn tasks_run_in_submission_order() {
        let (handle, _join) = spawn();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            handle.run_task(move || order.lock().unwrap().push(i));
        }
        tokio::time::sleep(TICK_PERIOD * 3).await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        handle.stop();
    }

    #[tokio::test]
    async fn scheduled_task_runs_at_the_requested_tick() {
        let (handle, _join) = spawn();
        let fired = Arc::new(AtomicBool::new(false));
        let target = handle.current_tick() + 3;
        let fired2 = fired.clone();
        handle.schedule_at(target, move || fired2.store(true, Ordering::SeqCst));
        tokio::time::sleep(TICK_PERIOD * 6).await;
        assert!(fired.load(Ordering::SeqCst));
        handle.stop();
    }

    #[tokio::test]
    async fn resubmission_from_within_a_task_runs_next_tick_not_inline() {
        let (handle, _join) = spawn();
        let count = Arc::new(AtomicU32::new(0));
        let inner_handle = handle.clone();
        let inner_count = count.clone();
        handle.run_task(move || {
            inner_count.fetch_add(1, Ordering::SeqCst);
            let inner_count2 = inner_count.clone();
            inner_handle.run_task(move || {
                inner_count2.fetch_add(1, Ordering::SeqCst);
            });
            // If reentrant, count would already be 2 here.
            assert_eq!(inner_count.load(Ordering::SeqCst), 1);
        });
        tokio::time::sleep(TICK_PERIOD * 3).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        handle.stop();
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let (handle, join) = spawn();
        handle.stop();
        handle.stop();
        let _ = tokio::time::timeout(Duration::from_secs(1), join).await;
        assert!(!handle.running());
    }
}
