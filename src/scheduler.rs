// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Background Task Scheduling
//!
//! Recovery work (reconnections, consumer re-subscriptions) must never run on the
//! task that delivered the shutdown notice. Every handle receives the same
//! `TaskScheduler` and submits that work to it.

use std::future::Future;
use tokio::{runtime::Handle, task::JoinHandle};
use tracing::debug;

/// Runs background recovery tasks on a tokio runtime.
#[derive(Clone, Debug)]
pub struct TaskScheduler {
    handle: Handle,
}

impl TaskScheduler {
    /// Uses the runtime the caller is running on.
    ///
    /// # Panics
    /// When called outside of a tokio runtime.
    pub fn current() -> Self {
        TaskScheduler {
            handle: Handle::current(),
        }
    }

    pub fn from_handle(handle: Handle) -> Self {
        TaskScheduler { handle }
    }

    /// Submits a task, returning its join handle.
    pub fn spawn<F>(&self, name: &'static str, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        debug!(task = name, "scheduling background task");
        self.handle.spawn(task)
    }
}
