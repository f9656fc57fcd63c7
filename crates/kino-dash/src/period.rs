//! Period lifecycle
//!
//! Handles:
//! - The period state machine (setup, active, switch, teardown)
//! - The switch status read by the player without locking
//! - Implicit advance once every selected group drained its last segment
//!
//! The manager only tracks where the session is; the session performs the
//! setup and teardown work between transitions.

use crate::{
    group::GroupShared,
    types::{PeriodState, PeriodSwitchStatus},
    Error, Result,
};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// A period switch waiting to be carried out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingSwitch {
    /// Period to set up next
    pub target: usize,
    /// Start position inside the target period
    pub start: Duration,
}

/// Period state machine of a session
#[derive(Debug)]
pub struct PeriodManager {
    state: PeriodState,
    state_tx: watch::Sender<PeriodState>,
    /// Period whose groups are (or are about to be) set up
    current: usize,
    /// Start position used for the next setup
    start: Duration,
    pending: Option<PendingSwitch>,
    status: Arc<AtomicU8>,
}

impl PeriodManager {
    /// `status` is shared with the player facing API
    pub fn new(status: Arc<AtomicU8>) -> Self {
        let (state_tx, _) = watch::channel(PeriodState::Idle);
        status.store(PeriodSwitchStatus::None.code(), Ordering::Release);
        Self {
            state: PeriodState::Idle,
            state_tx,
            current: 0,
            start: Duration::ZERO,
            pending: None,
            status,
        }
    }

    pub fn state(&self) -> PeriodState {
        self.state
    }

    /// Subscribe to state changes
    pub fn subscribe(&self) -> watch::Receiver<PeriodState> {
        self.state_tx.subscribe()
    }

    pub fn current(&self) -> usize {
        self.current
    }

    /// Start position of the period being set up
    pub fn start_position(&self) -> Duration {
        self.start
    }

    pub fn pending(&self) -> Option<PendingSwitch> {
        self.pending
    }

    pub fn switch_status(&self) -> PeriodSwitchStatus {
        PeriodSwitchStatus::from_code(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: PeriodSwitchStatus) {
        self.status.store(status.code(), Ordering::Release);
    }

    fn transition(&mut self, to: PeriodState) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        info!(from = %self.state, to = %to, period = self.current, "Period state transition");
        self.state = to;
        self.state_tx.send_replace(to);
        Ok(())
    }

    /// A manifest is loaded, set up `period` starting at `start`
    pub fn load(&mut self, period: usize, start: Duration) -> Result<()> {
        self.transition(PeriodState::SetupPending)?;
        self.current = period;
        self.start = start;
        Ok(())
    }

    /// Group construction begins
    pub fn begin_setup(&mut self) -> Result<()> {
        self.transition(PeriodState::SettingUp)
    }

    /// Groups are running
    pub fn activate(&mut self) -> Result<()> {
        self.transition(PeriodState::Active)?;
        self.set_status(PeriodSwitchStatus::None);
        Ok(())
    }

    /// Ask for a switch to `target`
    ///
    /// With `immediate`, players must stop consuming right away (status 2);
    /// otherwise the switch is only flagged (status 1) until the next tick.
    pub fn request_switch(&mut self, target: usize, start: Duration, immediate: bool) -> Result<()> {
        match self.state {
            PeriodState::Active | PeriodState::SwitchRequested => {}
            state => {
                return Err(Error::InvalidStateTransition {
                    from: state.to_string(),
                    to: PeriodState::SwitchRequested.to_string(),
                })
            }
        }
        self.pending = Some(PendingSwitch { target, start });
        if immediate {
            self.set_status(PeriodSwitchStatus::InProgress);
        } else if self.switch_status() == PeriodSwitchStatus::None {
            self.set_status(PeriodSwitchStatus::Requested);
        }
        if self.state == PeriodState::Active {
            self.transition(PeriodState::SwitchRequested)?;
        }
        debug!(target, start_ms = start.as_millis() as u64, immediate, "Period switch requested");
        Ok(())
    }

    /// Teardown of the current groups begins
    pub fn begin_switch(&mut self) -> Result<()> {
        self.transition(PeriodState::Switching)?;
        self.set_status(PeriodSwitchStatus::InProgress);
        Ok(())
    }

    /// Teardown done, move to the pending period
    ///
    /// Returns the period to set up. The status stays in progress until the
    /// new groups are active.
    pub fn finish_switch(&mut self) -> Result<usize> {
        let pending = self
            .pending
            .take()
            .ok_or_else(|| Error::Internal("no pending period switch".into()))?;
        self.transition(PeriodState::SetupPending)?;
        self.current = pending.target;
        self.start = pending.start;
        Ok(pending.target)
    }

    /// The session stops: setup failure or close
    pub fn terminate(&mut self) {
        if self.state != PeriodState::Terminated && self.state.can_transition_to(PeriodState::Terminated) {
            self.state = PeriodState::Terminated;
            self.state_tx.send_replace(PeriodState::Terminated);
            info!(period = self.current, "Period manager terminated");
        }
        self.pending = None;
        self.set_status(PeriodSwitchStatus::None);
    }

    pub fn is_terminated(&self) -> bool {
        self.state == PeriodState::Terminated
    }

    /// Groups are being built
    pub fn in_setup(&self) -> bool {
        matches!(self.state, PeriodState::SetupPending | PeriodState::SettingUp)
    }
}

/// Have all selected groups reached their end with nothing left to play
///
/// False when no group is selected.
pub fn period_drained(groups: &[Arc<GroupShared>]) -> bool {
    let mut any = false;
    for group in groups.iter().filter(|g| g.is_selected()) {
        any = true;
        if !group.with_buffer(|b| b.is_done() && b.is_empty()) {
            return false;
        }
    }
    any
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> PeriodManager {
        PeriodManager::new(Arc::new(AtomicU8::new(0)))
    }

    #[test]
    fn test_setup_sequence() {
        let mut periods = manager();
        let mut rx = periods.subscribe();
        periods.load(1, Duration::from_secs(3)).unwrap();
        assert!(periods.in_setup());
        periods.begin_setup().unwrap();
        periods.activate().unwrap();

        assert_eq!(periods.state(), PeriodState::Active);
        assert_eq!(periods.current(), 1);
        assert_eq!(periods.start_position(), Duration::from_secs(3));
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), PeriodState::Active);
    }

    #[test]
    fn test_switch_status() {
        let status = Arc::new(AtomicU8::new(0));
        let mut periods = PeriodManager::new(status.clone());
        periods.load(0, Duration::ZERO).unwrap();
        periods.begin_setup().unwrap();
        periods.activate().unwrap();

        periods.request_switch(1, Duration::ZERO, false).unwrap();
        assert_eq!(periods.switch_status(), PeriodSwitchStatus::Requested);
        assert_eq!(status.load(Ordering::Acquire), 1);

        periods.begin_switch().unwrap();
        assert_eq!(periods.switch_status(), PeriodSwitchStatus::InProgress);
        assert_eq!(periods.finish_switch().unwrap(), 1);
        assert_eq!(periods.switch_status(), PeriodSwitchStatus::InProgress);

        periods.begin_setup().unwrap();
        periods.activate().unwrap();
        assert_eq!(periods.switch_status(), PeriodSwitchStatus::None);
        assert_eq!(periods.current(), 1);
    }

    #[test]
    fn test_immediate_switch() {
        let mut periods = manager();
        periods.load(0, Duration::ZERO).unwrap();
        periods.begin_setup().unwrap();
        periods.activate().unwrap();

        periods.request_switch(2, Duration::from_secs(5), true).unwrap();
        assert_eq!(periods.switch_status(), PeriodSwitchStatus::InProgress);
        assert_eq!(
            periods.pending(),
            Some(PendingSwitch { target: 2, start: Duration::from_secs(5) })
        );
    }

    #[test]
    fn test_invalid_transitions() {
        let mut periods = manager();
        assert!(periods.begin_setup().is_err());
        assert!(periods.request_switch(1, Duration::ZERO, false).is_err());
        assert!(periods.finish_switch().is_err());

        periods.load(0, Duration::ZERO).unwrap();
        periods.terminate();
        assert!(periods.is_terminated());
        assert_eq!(periods.switch_status(), PeriodSwitchStatus::None);
    }
}
