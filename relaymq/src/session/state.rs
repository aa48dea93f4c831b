// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Lifecycle gates for a per-connection processor task.

use std::fmt;
use std::sync::RwLock;

use tokio::sync::Notify;

/// Tracks which part of its lifecycle a processor task is in.
///
/// The supervisor uses the start gate ([`ProcessorState::condition_running`])
/// to learn its task is live, and the stop gate
/// ([`ProcessorState::condition_exited`]) to coordinate connection teardown.
pub struct ProcessorState {
    /// State information locked for concurrency protection
    state: RwLock<LifecycleStatus>,
    /// Notifier indicating a state change
    state_change: Notify,
}

impl ProcessorState {
    /// Return true if the processor is currently running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(*self.state.read().unwrap(), LifecycleStatus::Running)
    }

    /// Return true if the processor has exited.
    #[must_use]
    pub fn has_exited(&self) -> bool {
        matches!(*self.state.read().unwrap(), LifecycleStatus::Exited)
    }

    /// Wait until the processor is running.
    /// Returns immediately if it already is, or if it has already exited.
    pub async fn condition_running(&self) {
        loop {
            if !matches!(*self.state.read().unwrap(), LifecycleStatus::NotStarted) {
                break;
            }
            self.state_change.notified().await;
        }
    }

    /// Wait until the processor has exited.
    /// Returns immediately if it already has.
    pub async fn condition_exited(&self) {
        loop {
            if self.has_exited() {
                break;
            }
            self.state_change.notified().await;
        }
    }

    /// Update the state to reflect the processor is running.
    pub(crate) fn transition_running(&self) {
        let mut state = self.state.write().unwrap();
        *state = LifecycleStatus::Running;
        self.state_change.notify_waiters();
        log::debug!("processor started");
    }

    /// Update the state to reflect the processor has exited.
    pub(crate) fn transition_exited(&self) {
        let mut state = self.state.write().unwrap();
        *state = LifecycleStatus::Exited;
        self.state_change.notify_waiters();
        log::debug!("processor exited");
    }
}

impl Default for ProcessorState {
    fn default() -> Self {
        Self {
            state: RwLock::new(LifecycleStatus::NotStarted),
            state_change: Notify::new(),
        }
    }
}

impl fmt::Debug for ProcessorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorState")
            .field("lifecycle_status", &*self.state.read().unwrap())
            .finish()
    }
}

/// Enum indicating the part of the lifecycle the processor is currently in.
#[derive(Debug)]
enum LifecycleStatus {
    /// The processor has not yet started.
    NotStarted,
    /// The processor is currently running.
    Running,
    /// The processor has exited.
    Exited,
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn gates_open_in_lifecycle_order() {
        let state = Arc::new(ProcessorState::default());
        assert!(!state.is_running());
        assert!(!state.has_exited());

        let waiter = tokio::spawn({
            let state = Arc::clone(&state);
            async move {
                state.condition_running().await;
                state.condition_exited().await;
            }
        });

        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        state.transition_running();
        assert!(state.is_running());
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        state.transition_exited();
        assert!(state.has_exited());
        waiter.await.unwrap();
    }
}
