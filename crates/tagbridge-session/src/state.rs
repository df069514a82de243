//! Scan session state machine.
//!
//! # States
//!
//! - `Idle`: no scan; reads are discarded
//! - `Scanning`: a scan window is open until its deadline
//! - `CardPresent`: a tag was just read (transient)
//! - `TimedOut`: the deadline elapsed without a read (transient)
//!
//! # Valid Transitions
//!
//! - Idle → Scanning (`start`)
//! - Scanning → CardPresent → Idle (single-shot) or → Scanning (continuous)
//! - Scanning → TimedOut → Idle (deadline only)
//! - any → Idle (`stop`)
//!
//! The transient states are entered and left within one call, so an observer
//! only ever sees `Idle` or `Scanning`. They still show up in the history.
//!
//! # Examples
//!
//! ```
//! use tagbridge_session::{ScanConfig, ScanSession, ScanState, TagOutcome};
//! use tokio::time::Instant;
//!
//! let mut session = ScanSession::new(ScanConfig::default());
//! session.start(Instant::now()).unwrap();
//! assert!(session.start(Instant::now()).is_err());
//!
//! assert_eq!(session.on_tag(), Some(TagOutcome::Completed));
//! assert_eq!(session.state(), ScanState::Idle);
//! ```

use crate::config::{ScanConfig, ScanMode};
use crate::error::{ControlError, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use tokio::time::Instant;
use tracing::debug;

/// Transitions kept for inspection.
const MAX_HISTORY_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScanState {
    Idle,
    Scanning,
    CardPresent,
    TimedOut,
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScanState::Idle => "Idle",
            ScanState::Scanning => "Scanning",
            ScanState::CardPresent => "CardPresent",
            ScanState::TimedOut => "TimedOut",
        };
        f.write_str(name)
    }
}

impl ScanState {
    /// Check if the automatic transition to `target` is allowed.
    ///
    /// `stop` bypasses this table; it is valid from every state.
    ///
    /// ```
    /// use tagbridge_session::ScanState;
    ///
    /// assert!(ScanState::Idle.can_transition_to(ScanState::Scanning));
    /// assert!(!ScanState::Idle.can_transition_to(ScanState::CardPresent));
    /// ```
    pub fn can_transition_to(self, target: ScanState) -> bool {
        matches!(
            (self, target),
            (ScanState::Idle, ScanState::Scanning)
                | (ScanState::Scanning, ScanState::CardPresent | ScanState::TimedOut)
                | (ScanState::CardPresent, ScanState::Idle | ScanState::Scanning)
                | (ScanState::TimedOut, ScanState::Idle)
        )
    }
}

/// One recorded transition.
#[derive(Debug, Clone)]
pub struct StateTransition {
    pub from: ScanState,
    pub to: ScanState,
    pub at: Instant,
}

/// What a tag read did to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagOutcome {
    /// Single-shot scan finished; the session is idle again.
    Completed,
    /// Continuous scan goes on.
    Continuing,
}

/// State of the one scan the service may run at a time.
#[derive(Debug)]
pub struct ScanSession {
    config: ScanConfig,
    state: ScanState,
    started_at: Option<Instant>,
    deadline: Option<Instant>,
    history: VecDeque<StateTransition>,
}

impl ScanSession {
    pub fn new(config: ScanConfig) -> Self {
        Self {
            config,
            state: ScanState::Idle,
            started_at: None,
            deadline: None,
            history: VecDeque::with_capacity(MAX_HISTORY_SIZE),
        }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    pub fn is_scanning(&self) -> bool {
        self.state == ScanState::Scanning
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    /// Deadline of the open scan window, `None` while idle.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn history(&self) -> &VecDeque<StateTransition> {
        &self.history
    }

    /// Open a scan window starting at `now`.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyScanning` unless the session is idle; the state is left
    /// unchanged.
    pub fn start(&mut self, now: Instant) -> Result<Instant> {
        if self.state != ScanState::Idle {
            return Err(ControlError::AlreadyScanning);
        }

        let deadline = now + self.config.timeout();
        self.transition(ScanState::Scanning, now);
        self.started_at = Some(now);
        self.deadline = Some(deadline);
        Ok(deadline)
    }

    /// Return to idle from any state, cancelling the deadline.
    ///
    /// Returns `true` if a scan was open.
    pub fn stop(&mut self) -> bool {
        let was_scanning = self.state != ScanState::Idle;
        if was_scanning {
            self.record(self.state, ScanState::Idle, Instant::now());
            self.state = ScanState::Idle;
        }
        self.started_at = None;
        self.deadline = None;
        was_scanning
    }

    /// A decoded tag arrived.
    ///
    /// Returns `None` if no scan is open; the read must then be discarded.
    pub fn on_tag(&mut self) -> Option<TagOutcome> {
        if !self.is_scanning() {
            return None;
        }

        let now = Instant::now();
        self.transition(ScanState::CardPresent, now);
        match self.config.mode {
            ScanMode::SingleShot => {
                self.transition(ScanState::Idle, now);
                self.started_at = None;
                self.deadline = None;
                Some(TagOutcome::Completed)
            }
            ScanMode::Continuous => {
                self.transition(ScanState::Scanning, now);
                Some(TagOutcome::Continuing)
            }
        }
    }

    /// Apply the deadline if it has passed at `now`.
    ///
    /// Returns `true` if the scan timed out.
    pub fn on_deadline(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if self.is_scanning() && now >= deadline => {
                self.transition(ScanState::TimedOut, now);
                self.transition(ScanState::Idle, now);
                self.started_at = None;
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    fn transition(&mut self, to: ScanState, at: Instant) {
        debug_assert!(self.state.can_transition_to(to), "{} -> {}", self.state, to);
        self.record(self.state, to, at);
        self.state = to;
    }

    fn record(&mut self, from: ScanState, to: ScanState, at: Instant) {
        debug!(%from, %to, "Scan session transition");
        if self.history.len() == MAX_HISTORY_SIZE {
            self.history.pop_front();
        }
        self.history.push_back(StateTransition { from, to, at });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::time::Duration;

    fn session(mode: ScanMode) -> ScanSession {
        ScanSession::new(ScanConfig {
            timeout_ms: 1_000,
            mode,
            debounce_ms: 100,
        })
    }

    #[test]
    fn test_second_start_fails_and_keeps_scanning() {
        let mut session = session(ScanMode::SingleShot);
        let now = Instant::now();
        let deadline = session.start(now).unwrap();
        assert_eq!(deadline, now + Duration::from_secs(1));

        assert!(matches!(
            session.start(now),
            Err(ControlError::AlreadyScanning)
        ));
        assert_eq!(session.state(), ScanState::Scanning);
        assert_eq!(session.deadline(), Some(deadline));
    }

    #[rstest]
    #[case(ScanMode::SingleShot, TagOutcome::Completed, ScanState::Idle)]
    #[case(ScanMode::Continuous, TagOutcome::Continuing, ScanState::Scanning)]
    fn test_tag_outcome_by_mode(
        #[case] mode: ScanMode,
        #[case] outcome: TagOutcome,
        #[case] state: ScanState,
    ) {
        let mut session = session(mode);
        session.start(Instant::now()).unwrap();

        assert_eq!(session.on_tag(), Some(outcome));
        assert_eq!(session.state(), state);

        let path: Vec<ScanState> = session.history().iter().map(|t| t.to).collect();
        assert_eq!(path, vec![ScanState::Scanning, ScanState::CardPresent, state]);
    }

    #[test]
    fn test_tag_while_idle_is_discarded() {
        let mut session = session(ScanMode::SingleShot);
        assert_eq!(session.on_tag(), None);
        assert!(session.history().is_empty());
    }

    #[test]
    fn test_stop_from_any_state() {
        let mut session = session(ScanMode::SingleShot);
        assert!(!session.stop());

        session.start(Instant::now()).unwrap();
        assert!(session.stop());
        assert_eq!(session.state(), ScanState::Idle);
        assert_eq!(session.deadline(), None);
        assert_eq!(session.on_tag(), None);
    }

    #[test]
    fn test_deadline_only_fires_when_due() {
        let mut session = session(ScanMode::Continuous);
        let now = Instant::now();
        session.start(now).unwrap();

        assert!(!session.on_deadline(now + Duration::from_millis(999)));
        assert!(session.is_scanning());

        assert!(session.on_deadline(now + Duration::from_secs(1)));
        assert_eq!(session.state(), ScanState::Idle);
        assert!(!session.on_deadline(now + Duration::from_secs(2)));

        let last: Vec<ScanState> = session.history().iter().rev().take(2).map(|t| t.to).collect();
        assert_eq!(last, vec![ScanState::Idle, ScanState::TimedOut]);
    }

    #[test]
    fn test_restart_after_completion() {
        let mut session = session(ScanMode::SingleShot);
        session.start(Instant::now()).unwrap();
        session.on_tag();
        assert!(session.start(Instant::now()).is_ok());
    }

    #[test]
    fn test_history_is_bounded() {
        let mut session = session(ScanMode::SingleShot);
        for _ in 0..MAX_HISTORY_SIZE {
            session.start(Instant::now()).unwrap();
            session.stop();
        }
        assert_eq!(session.history().len(), MAX_HISTORY_SIZE);
    }
}
