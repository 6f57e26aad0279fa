//! Sync lifecycle state machine and the manager that drives the engine
//! from it.
//!
//! Transitions:
//! - `disabled --enable--> enabling`
//! - `enabling --success--> enabled`, `enabling --error--> errored`
//! - `enabled --sync--> syncing`, `enabled --disable--> disabled`
//! - `syncing --success--> enabled`, `syncing --error--> errored`
//! - `errored --disable--> disabled`, `errored --enable--> enabled`

use crate::adapters::ReconciliationAdapter;
use crate::sync::engine::CollectionEngine;
use crate::sync::error::SyncFailure;
use crate::sync::models::SyncReport;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Disabled,
    Enabling,
    Enabled,
    Syncing,
    Errored,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Enabling => "enabling",
            Self::Enabled => "enabled",
            Self::Syncing => "syncing",
            Self::Errored => "errored",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncEvent {
    Enable,
    Disable,
    Sync,
    Success,
    Error,
}

impl SyncEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enable => "enable",
            Self::Disable => "disable",
            Self::Sync => "sync",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for SyncEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broadcast for every accepted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub transition: SyncEvent,
    pub from: SyncState,
    pub to: SyncState,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("Event {event} invalid for the current state")]
    InvalidEvent { event: SyncEvent, state: SyncState },
}

/// The lifecycle state machine. Rejected events leave the state unchanged.
pub struct SyncStateMachine {
    state: SyncState,
    events: broadcast::Sender<TransitionEvent>,
}

impl Default for SyncStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncStateMachine {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: SyncState::Disabled,
            events,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransitionEvent> {
        self.events.subscribe()
    }

    /// Target state of `event` from `state`, if the event is allowed there.
    pub fn next_state(state: SyncState, event: SyncEvent) -> Option<SyncState> {
        use SyncEvent as E;
        use SyncState as S;

        match (state, event) {
            (S::Disabled, E::Enable) => Some(S::Enabling),
            (S::Enabling, E::Success) => Some(S::Enabled),
            (S::Enabling, E::Error) => Some(S::Errored),
            (S::Enabled, E::Sync) => Some(S::Syncing),
            (S::Enabled, E::Disable) => Some(S::Disabled),
            (S::Syncing, E::Success) => Some(S::Enabled),
            (S::Syncing, E::Error) => Some(S::Errored),
            (S::Errored, E::Disable) => Some(S::Disabled),
            (S::Errored, E::Enable) => Some(S::Enabled),
            _ => None,
        }
    }

    /// Apply `event`, returning the new state.
    pub fn fire(&mut self, event: SyncEvent) -> Result<SyncState, StateError> {
        let from = self.state;
        let to = Self::next_state(from, event).ok_or(StateError::InvalidEvent {
            event,
            state: from,
        })?;
        self.state = to;
        // Nobody listening is fine.
        let _ = self.events.send(TransitionEvent {
            transition: event,
            from,
            to,
        });
        Ok(to)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManagerError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Sync(#[from] SyncFailure),
}

struct ManagerStatus {
    machine: SyncStateMachine,
    last_failure: Option<SyncFailure>,
}

/// Runs the engine as the state machine allows, one operation at a time.
///
/// Lock order is `engine` then `status`. The status lock is never held
/// across an engine call, so the state stays observable and a second
/// `sync` is rejected while the first one runs.
pub struct SyncManager {
    status: Mutex<ManagerStatus>,
    engine: Mutex<CollectionEngine>,
    events: broadcast::Sender<TransitionEvent>,
}

impl SyncManager {
    pub fn new(engine: CollectionEngine) -> Self {
        let machine = SyncStateMachine::new();
        let events = machine.events.clone();
        Self {
            status: Mutex::new(ManagerStatus {
                machine,
                last_failure: None,
            }),
            engine: Mutex::new(engine),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransitionEvent> {
        self.events.subscribe()
    }

    pub async fn state(&self) -> SyncState {
        self.status.lock().await.machine.state()
    }

    pub async fn last_failure(&self) -> Option<SyncFailure> {
        self.status.lock().await.last_failure.clone()
    }

    /// Fire the event that ends an operation and record its failure.
    async fn finish(
        &self,
        event: SyncEvent,
        failure: Option<SyncFailure>,
    ) -> Result<(), ManagerError> {
        let mut status = self.status.lock().await;
        status.machine.fire(event)?;
        status.last_failure = failure;
        Ok(())
    }

    /// Connect the engine.
    ///
    /// From `disabled` this goes through `enabling`. From `errored` the
    /// engine reconnects first and `enable` is only fired once that
    /// succeeded; a failed reconnect stays `errored`.
    pub async fn enable(&self) -> Result<(), ManagerError> {
        let mut engine = self.engine.lock().await;

        let reconnecting = {
            let mut status = self.status.lock().await;
            if status.machine.state() == SyncState::Errored {
                true
            } else {
                status.machine.fire(SyncEvent::Enable)?;
                false
            }
        };

        let outcome = engine.connect().await;
        drop(engine);

        match (outcome, reconnecting) {
            (Ok(()), true) => {
                self.finish(SyncEvent::Enable, None).await?;
                info!("Sync re-enabled");
                Ok(())
            }
            (Ok(()), false) => {
                self.finish(SyncEvent::Success, None).await?;
                info!("Sync enabled");
                Ok(())
            }
            (Err(failure), true) => {
                warn!("Re-enable failed: {}", failure);
                self.status.lock().await.last_failure = Some(failure.clone());
                Err(failure.into())
            }
            (Err(failure), false) => {
                self.finish(SyncEvent::Error, Some(failure.clone())).await?;
                Err(failure.into())
            }
        }
    }

    /// Run one sync cycle. The report is returned even when some
    /// collections failed; the state then moves to `errored`.
    pub async fn sync(&self) -> Result<SyncReport, ManagerError> {
        self.status.lock().await.machine.fire(SyncEvent::Sync)?;

        let outcome = self.engine.lock().await.sync_now().await;

        match outcome {
            Ok(report) => {
                match report.first_failure().cloned() {
                    None => self.finish(SyncEvent::Success, None).await?,
                    Some(failure) => self.finish(SyncEvent::Error, Some(failure)).await?,
                }
                Ok(report)
            }
            Err(failure) => {
                self.finish(SyncEvent::Error, Some(failure.clone())).await?;
                Err(failure.into())
            }
        }
    }

    pub async fn disable(&self) -> Result<(), ManagerError> {
        let mut engine = self.engine.lock().await;
        self.status.lock().await.machine.fire(SyncEvent::Disable)?;
        engine.disconnect();
        info!("Sync disabled");
        Ok(())
    }

    /// Register an adapter on the underlying engine.
    pub async fn register_adapter(
        &self,
        name: &str,
        adapter: Arc<dyn ReconciliationAdapter>,
    ) -> crate::Result<()> {
        self.engine.lock().await.register_adapter(name, adapter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_EVENTS: [SyncEvent; 5] = [
        SyncEvent::Enable,
        SyncEvent::Disable,
        SyncEvent::Sync,
        SyncEvent::Success,
        SyncEvent::Error,
    ];

    fn machine_in(path: &[SyncEvent]) -> SyncStateMachine {
        let mut machine = SyncStateMachine::new();
        for event in path {
            machine.fire(*event).unwrap();
        }
        machine
    }

    #[test]
    fn starts_disabled() {
        assert_eq!(SyncStateMachine::new().state(), SyncState::Disabled);
    }

    #[test]
    fn full_lifecycle() {
        let mut machine = SyncStateMachine::new();
        assert_eq!(machine.fire(SyncEvent::Enable).unwrap(), SyncState::Enabling);
        assert_eq!(machine.fire(SyncEvent::Error).unwrap(), SyncState::Errored);
        assert_eq!(machine.fire(SyncEvent::Disable).unwrap(), SyncState::Disabled);
        assert_eq!(machine.fire(SyncEvent::Enable).unwrap(), SyncState::Enabling);
        assert_eq!(machine.fire(SyncEvent::Success).unwrap(), SyncState::Enabled);
        assert_eq!(machine.fire(SyncEvent::Sync).unwrap(), SyncState::Syncing);
        assert_eq!(machine.fire(SyncEvent::Success).unwrap(), SyncState::Enabled);
        assert_eq!(machine.fire(SyncEvent::Sync).unwrap(), SyncState::Syncing);
        assert_eq!(machine.fire(SyncEvent::Error).unwrap(), SyncState::Errored);
        assert_eq!(machine.fire(SyncEvent::Enable).unwrap(), SyncState::Enabled);
        assert_eq!(machine.fire(SyncEvent::Disable).unwrap(), SyncState::Disabled);
    }

    #[test]
    fn invalid_events_leave_state_unchanged() {
        let cases: [(&[SyncEvent], &[SyncEvent]); 5] = [
            (&[], &[SyncEvent::Disable, SyncEvent::Sync, SyncEvent::Error, SyncEvent::Success]),
            (&[SyncEvent::Enable], &[SyncEvent::Enable, SyncEvent::Disable, SyncEvent::Sync]),
            (
                &[SyncEvent::Enable, SyncEvent::Success],
                &[SyncEvent::Enable, SyncEvent::Success, SyncEvent::Error],
            ),
            (
                &[SyncEvent::Enable, SyncEvent::Success, SyncEvent::Sync],
                &[SyncEvent::Enable, SyncEvent::Disable, SyncEvent::Sync],
            ),
            (
                &[SyncEvent::Enable, SyncEvent::Error],
                &[SyncEvent::Sync, SyncEvent::Success, SyncEvent::Error],
            ),
        ];

        for (path, invalid) in cases {
            let mut machine = machine_in(path);
            let before = machine.state();
            for event in invalid {
                let err = machine.fire(*event).unwrap_err();
                assert_eq!(
                    err.to_string(),
                    format!("Event {} invalid for the current state", event)
                );
                assert_eq!(machine.state(), before);
            }
        }
    }

    #[test]
    fn transition_table_is_exhaustive() {
        let states = [
            SyncState::Disabled,
            SyncState::Enabling,
            SyncState::Enabled,
            SyncState::Syncing,
            SyncState::Errored,
        ];
        let allowed: usize = states
            .iter()
            .map(|s| {
                ALL_EVENTS
                    .iter()
                    .filter(|e| SyncStateMachine::next_state(*s, **e).is_some())
                    .count()
            })
            .sum();
        assert_eq!(allowed, 9);
    }

    #[test]
    fn syncing_rejects_enable() {
        let mut machine = machine_in(&[SyncEvent::Enable, SyncEvent::Success]);
        assert_eq!(machine.fire(SyncEvent::Sync).unwrap(), SyncState::Syncing);
        assert!(machine.fire(SyncEvent::Enable).is_err());
        assert_eq!(machine.state(), SyncState::Syncing);
    }

    #[tokio::test]
    async fn transitions_are_broadcast() {
        let mut machine = SyncStateMachine::new();
        let mut events = machine.subscribe();

        machine.fire(SyncEvent::Enable).unwrap();
        machine.fire(SyncEvent::Success).unwrap();
        assert!(machine.fire(SyncEvent::Success).is_err());

        assert_eq!(
            events.recv().await.unwrap(),
            TransitionEvent {
                transition: SyncEvent::Enable,
                from: SyncState::Disabled,
                to: SyncState::Enabling,
            }
        );
        let second = events.recv().await.unwrap();
        assert_eq!(second.from, SyncState::Enabling);
        assert_eq!(second.to, SyncState::Enabled);
        assert!(events.try_recv().is_err());
    }
}
