// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Gate
//!
//! A reentrant open/closed latch. Channels close their gate when their connection
//! goes away and the reconnection task opens it again once every channel of the
//! connection has a live target. Retry strategies park callers on the gate while
//! it is closed.
//!
//! The gate is built on a `tokio::sync::watch` channel: `wait_for` checks the
//! current state and registers for change notification under the same lock, so an
//! `open()` racing with a waiter can never be missed.

use std::{fmt, sync::Arc, time::Duration};
use tokio::sync::watch;

/// A binary open/closed synchronization primitive tasks can wait on.
///
/// Cloning a `Gate` yields another handle to the same gate.
#[derive(Clone)]
pub struct Gate {
    state: Arc<watch::Sender<bool>>,
}

impl Gate {
    /// Creates a new gate in the given state.
    pub fn new(open: bool) -> Self {
        let (state, _) = watch::channel(open);
        Gate {
            state: Arc::new(state),
        }
    }

    /// Closes the gate. Closing an already closed gate is a no-op.
    pub fn close(&self) {
        self.state.send_if_modified(|open| std::mem::replace(open, false));
    }

    /// Opens the gate and wakes every waiter. Opening an open gate is a no-op.
    pub fn open(&self) {
        self.state.send_if_modified(|open| !std::mem::replace(open, true));
    }

    /// For information purposes only, prefer `wait_until_open`.
    pub fn is_open(&self) -> bool {
        *self.state.borrow()
    }

    /// Opposite of [`Gate::is_open`], same caveat.
    pub fn is_closed(&self) -> bool {
        !self.is_open()
    }

    /// Waits for the gate to open.
    ///
    /// Returns immediately when the gate is already open. With a timeout, returns
    /// whether the gate is open once the wait ends; without one, only returns once
    /// the gate is open.
    pub async fn wait_until_open(&self, timeout: Option<Duration>) -> bool {
        let mut rx = self.state.subscribe();

        match timeout {
            None => {
                // the sender lives as long as self, so the wait cannot fail
                let _ = rx.wait_for(|open| *open).await;
            }
            Some(timeout) => {
                let opened = tokio::time::timeout(timeout, rx.wait_for(|open| *open))
                    .await
                    .is_ok();
                if !opened {
                    return self.is_open();
                }
            }
        }

        true
    }
}

impl Default for Gate {
    fn default() -> Self {
        Gate::new(true)
    }
}

impl fmt::Debug for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gate").field("open", &self.is_open()).finish()
    }
}

impl fmt::Display for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.is_open() { "open" } else { "closed" })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    const REPETITIONS: usize = 3;

    #[test]
    fn initial_state() {
        assert!(Gate::new(false).is_closed());
        assert!(Gate::new(true).is_open());
        assert!(Gate::default().is_open());
    }

    #[test]
    fn repeated_close_and_open_are_idempotent() {
        let gate = Gate::default();

        for _ in 0..REPETITIONS {
            gate.close();
            assert!(gate.is_closed());
        }

        for _ in 0..REPETITIONS {
            gate.open();
            assert!(gate.is_open());
        }
    }

    #[test]
    fn clones_share_state() {
        let gate = Gate::new(false);
        let other = gate.clone();

        other.open();
        assert!(gate.is_open());
        assert_eq!(gate.to_string(), "open");
    }

    #[tokio::test]
    async fn wait_on_open_gate_returns_right_away() {
        let gate = Gate::default();
        let start = Instant::now();

        assert!(gate.wait_until_open(None).await);
        assert!(gate.wait_until_open(Some(Duration::from_secs(1))).await);
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn timed_wait_on_closed_gate_reports_closed() {
        let gate = Gate::new(false);

        assert!(!gate.wait_until_open(Some(Duration::from_millis(20))).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn open_wakes_timed_waiter_before_timeout() {
        let gate = Gate::new(false);
        let waiter = gate.clone();

        let start = Instant::now();
        let handle =
            tokio::spawn(async move { waiter.wait_until_open(Some(Duration::from_secs(5))).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        gate.open();

        assert!(handle.await.unwrap());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn open_wakes_every_waiter() {
        let gate = Gate::default();

        for _ in 0..REPETITIONS {
            gate.close();

            let waiters: Vec<_> = (0..10)
                .map(|_| {
                    let gate = gate.clone();
                    tokio::spawn(async move { gate.wait_until_open(None).await })
                })
                .collect();

            tokio::time::sleep(Duration::from_millis(20)).await;
            for waiter in &waiters {
                assert!(!waiter.is_finished());
            }

            gate.open();

            for waiter in waiters {
                let opened = tokio::time::timeout(Duration::from_secs(1), waiter)
                    .await
                    .expect("waiter was left blocked on an open gate");
                assert!(opened.unwrap());
            }
        }
    }
}
