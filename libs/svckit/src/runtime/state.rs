use std::fmt;
use tokio::sync::watch;

/// Where a service is in its lifecycle. States only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LifecycleState {
    Created,
    DefinitionsValidated,
    FeaturesStarted,
    HandlerBound,
    ServersInitialized,
    Running,
    Stopping,
    Stopped,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Created => "created",
            LifecycleState::DefinitionsValidated => "definitions_validated",
            LifecycleState::FeaturesStarted => "features_started",
            LifecycleState::HandlerBound => "handler_bound",
            LifecycleState::ServersInitialized => "servers_initialized",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Publishes the lifecycle state to observers.
pub(crate) struct StateCell {
    tx: watch::Sender<LifecycleState>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(LifecycleState::Created);
        Self { tx }
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.tx.subscribe()
    }

    pub(crate) fn current(&self) -> LifecycleState {
        *self.tx.borrow()
    }

    /// Moves to `next` unless the service is already there or past it.
    pub(crate) fn advance(&self, next: LifecycleState) -> bool {
        let moved = self.tx.send_if_modified(|state| {
            if next > *state {
                *state = next;
                true
            } else {
                false
            }
        });
        if moved {
            tracing::debug!(state = %next, "lifecycle state changed");
        }
        moved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_only_move_forward() {
        let cell = StateCell::new();
        let rx = cell.subscribe();

        assert!(cell.advance(LifecycleState::FeaturesStarted));
        assert!(!cell.advance(LifecycleState::DefinitionsValidated));
        assert!(!cell.advance(LifecycleState::FeaturesStarted));
        assert_eq!(cell.current(), LifecycleState::FeaturesStarted);
        assert_eq!(*rx.borrow(), LifecycleState::FeaturesStarted);
    }

    #[tokio::test]
    async fn observers_see_changes() {
        let cell = StateCell::new();
        let mut rx = cell.subscribe();
        cell.advance(LifecycleState::Running);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), LifecycleState::Running);
        assert_eq!(LifecycleState::Running.to_string(), "running");
    }
}
