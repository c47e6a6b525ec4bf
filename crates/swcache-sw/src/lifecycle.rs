//! Worker lifecycle state machine.
//!
//! ```text
//! Installing --InstallCompleted--> Waiting
//! Installing --InstallFailed-----> Redundant
//! Waiting ----SkipWaiting--------> Activating
//! Waiting ----NoPriorController--> Activating
//! Activating -ActivateCompleted--> Activated
//! Waiting ----Superseded---------> Redundant
//! Activated --Superseded---------> Redundant
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

use crate::ServiceWorkerError;

/// Worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkerState {
    /// Install handler running.
    Installing,
    /// Installed, waiting for the previous version to let go.
    Waiting,
    /// Activate handler running.
    Activating,
    /// Active and controlling clients.
    Activated,
    /// Replaced by a newer version, or install failed.
    Redundant,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Installing => "installing",
            WorkerState::Waiting => "installed",
            WorkerState::Activating => "activating",
            WorkerState::Activated => "activated",
            WorkerState::Redundant => "redundant",
        };
        f.write_str(s)
    }
}

/// Events that drive the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    InstallCompleted,
    InstallFailed,
    /// SkipWaiting was requested.
    SkipWaiting,
    /// No older worker controls any client.
    NoPriorController,
    ActivateCompleted,
    /// A newer version took over.
    Superseded,
}

/// The transition table. `None` means the event is not valid in `state`.
pub fn next_state(state: WorkerState, event: LifecycleEvent) -> Option<WorkerState> {
    use LifecycleEvent as E;
    use WorkerState as S;

    match (state, event) {
        (S::Installing, E::InstallCompleted) => Some(S::Waiting),
        (S::Installing, E::InstallFailed) => Some(S::Redundant),
        (S::Waiting, E::SkipWaiting | E::NoPriorController) => Some(S::Activating),
        (S::Activating, E::ActivateCompleted) => Some(S::Activated),
        (S::Waiting | S::Activated, E::Superseded) => Some(S::Redundant),
        _ => None,
    }
}

/// Observable lifecycle of one worker.
#[derive(Debug)]
pub struct Lifecycle {
    state: watch::Sender<WorkerState>,
}

impl Lifecycle {
    pub fn new() -> Self {
        let (state, _) = watch::channel(WorkerState::Installing);
        Self { state }
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Observe state changes.
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Apply `event` atomically. Invalid events leave the state unchanged.
    pub fn apply(&self, event: LifecycleEvent) -> Result<WorkerState, ServiceWorkerError> {
        let mut outcome = Err(ServiceWorkerError::InvalidTransition {
            from: self.state(),
            event,
        });

        self.state.send_if_modified(|state| match next_state(*state, event) {
            Some(next) => {
                info!(from = %*state, to = %next, ?event, "Worker state change");
                *state = next;
                outcome = Ok(next);
                true
            }
            None => {
                outcome = Err(ServiceWorkerError::InvalidTransition {
                    from: *state,
                    event,
                });
                false
            }
        });

        outcome
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), WorkerState::Installing);

        assert_eq!(
            lifecycle.apply(LifecycleEvent::InstallCompleted).unwrap(),
            WorkerState::Waiting
        );
        assert_eq!(
            lifecycle.apply(LifecycleEvent::SkipWaiting).unwrap(),
            WorkerState::Activating
        );
        assert_eq!(
            lifecycle.apply(LifecycleEvent::ActivateCompleted).unwrap(),
            WorkerState::Activated
        );
        assert_eq!(
            lifecycle.apply(LifecycleEvent::Superseded).unwrap(),
            WorkerState::Redundant
        );
    }

    #[test]
    fn test_invalid_transition_leaves_state() {
        let lifecycle = Lifecycle::new();
        let err = lifecycle.apply(LifecycleEvent::SkipWaiting).unwrap_err();
        assert!(matches!(
            err,
            ServiceWorkerError::InvalidTransition {
                from: WorkerState::Installing,
                event: LifecycleEvent::SkipWaiting
            }
        ));
        assert_eq!(lifecycle.state(), WorkerState::Installing);
    }

    #[test]
    fn test_redundant_is_terminal() {
        let lifecycle = Lifecycle::new();
        lifecycle.apply(LifecycleEvent::InstallFailed).unwrap();
        for event in [
            LifecycleEvent::InstallCompleted,
            LifecycleEvent::SkipWaiting,
            LifecycleEvent::NoPriorController,
            LifecycleEvent::ActivateCompleted,
            LifecycleEvent::Superseded,
        ] {
            assert!(lifecycle.apply(event).is_err());
        }
        assert_eq!(lifecycle.state(), WorkerState::Redundant);
    }

    #[test]
    fn test_no_prior_controller_only_from_waiting() {
        assert_eq!(
            next_state(WorkerState::Waiting, LifecycleEvent::NoPriorController),
            Some(WorkerState::Activating)
        );
        assert_eq!(
            next_state(WorkerState::Activated, LifecycleEvent::NoPriorController),
            None
        );
        assert_eq!(
            next_state(WorkerState::Activating, LifecycleEvent::Superseded),
            None
        );
    }

    #[tokio::test]
    async fn test_subscribers_observe_transitions() {
        let lifecycle = Lifecycle::new();
        let mut rx = lifecycle.subscribe();

        lifecycle.apply(LifecycleEvent::InstallCompleted).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), WorkerState::Waiting);

        // Rejected events do not notify.
        let _ = lifecycle.apply(LifecycleEvent::ActivateCompleted);
        assert!(!rx.has_changed().unwrap());
    }
}
