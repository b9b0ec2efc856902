//! Focus session state and its transition table.
//!
//! `next_state` is the single source of truth for which events move a session
//! between states; everything else (timers, resources, notices) is driven by
//! the controller from the transitions it returns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};
use uuid::Uuid;

use crate::focus::overrides::OverrideReason;
use crate::focus::schedule::Denial;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum SessionState {
    Idle,
    Requesting,
    Active,
    Violated,
    Paused,
    Terminated,
}

impl SessionState {
    /// Active, Violated or Paused: resources held and heartbeats running
    pub fn is_live(self) -> bool {
        matches!(self, SessionState::Active | SessionState::Violated | SessionState::Paused)
    }

    /// Whether the student's single session slot is taken
    pub fn holds_slot(self) -> bool {
        matches!(
            self,
            SessionState::Requesting | SessionState::Active | SessionState::Violated | SessionState::Paused
        )
    }

    /// Whether heartbeats from this state count toward usage
    pub fn accrues_usage(self) -> bool {
        matches!(self, SessionState::Active | SessionState::Violated)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Kind of escape attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    VisibilityHidden,
    FocusLost,
    DisplayModeExited,
}

/// How a guardian resolved a pause
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum Resolution {
    Resume,
    Exit,
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "cause", content = "detail", rename_all = "snake_case")]
pub enum TerminationCause {
    Completed,
    Stopped,
    GuardianExit,
    Unmounted,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StartRequested,
    Admitted,
    Denied(Denial),
    ViolationDetected(ViolationKind),
    Returned,
    GraceExpired,
    LimitReached,
    GuardianPause,
    OverrideResolved(Resolution),
    Completed,
    Stopped(TerminationCause),
}

/// The transition table. `None` means the event does not apply in `state`.
pub fn next_state(state: SessionState, event: &SessionEvent) -> Option<SessionState> {
    use SessionEvent as E;
    use SessionState as S;

    match (state, event) {
        (S::Terminated, _) => None,

        (S::Idle, E::StartRequested) => Some(S::Requesting),
        (S::Requesting, E::Admitted) => Some(S::Active),
        (S::Requesting, E::Denied(_)) => Some(S::Idle),

        (S::Active, E::ViolationDetected(_)) => Some(S::Violated),
        (S::Violated, E::Returned) => Some(S::Active),
        (S::Violated, E::GraceExpired) => Some(S::Paused),

        (S::Active | S::Violated, E::LimitReached | E::GuardianPause) => Some(S::Paused),

        (S::Paused, E::OverrideResolved(Resolution::Resume)) => Some(S::Active),
        (S::Paused, E::OverrideResolved(Resolution::Exit)) => Some(S::Terminated),

        (S::Active, E::Completed) => Some(S::Terminated),

        (S::Requesting | S::Active | S::Violated | S::Paused, E::Stopped(_)) => Some(S::Terminated),

        _ => None,
    }
}

/// Whether exclusive display mode and the sleep lock were obtained
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Protection {
    pub display: bool,
    pub sleep_lock: bool,
}

impl Protection {
    pub fn is_unprotected(&self) -> bool {
        !(self.display && self.sleep_lock)
    }
}

/// A recorded state change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: SessionState,
    pub to: SessionState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FocusSession {
    pub id: Uuid,
    pub student_id: String,
    pub course_id: Option<String>,
    pub state: SessionState,
    pub started_at: Option<DateTime<Utc>>,
    pub violation_count: u32,
    pub last_transition_at: DateTime<Utc>,
    pub protection: Protection,
    pub pause_reason: Option<OverrideReason>,
    pub termination: Option<TerminationCause>,
    /// Active time counted by the ledger for this session
    pub active_seconds: i64,
}

impl FocusSession {
    pub fn new(student_id: impl Into<String>, course_id: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            student_id: student_id.into(),
            course_id,
            state: SessionState::Idle,
            started_at: None,
            violation_count: 0,
            last_transition_at: now,
            protection: Protection::default(),
            pause_reason: None,
            termination: None,
            active_seconds: 0,
        }
    }

    /// Apply an event. Events that do not apply leave the session untouched.
    pub fn apply(&mut self, event: SessionEvent, at: DateTime<Utc>) -> Option<Transition> {
        let Some(to) = next_state(self.state, &event) else {
            debug!("Session {} ignored {:?} in state {}", self.id, event, self.state);
            return None;
        };
        let from = self.state;

        match &event {
            SessionEvent::Admitted => self.started_at = Some(at),
            SessionEvent::ViolationDetected(_) => self.violation_count += 1,
            SessionEvent::GraceExpired => self.pause_reason = Some(OverrideReason::Violation),
            SessionEvent::LimitReached => self.pause_reason = Some(OverrideReason::TimeExhausted),
            SessionEvent::GuardianPause => self.pause_reason = Some(OverrideReason::GuardianPause),
            SessionEvent::OverrideResolved(Resolution::Resume) => self.pause_reason = None,
            SessionEvent::OverrideResolved(Resolution::Exit) => self.termination = Some(TerminationCause::GuardianExit),
            SessionEvent::Completed => self.termination = Some(TerminationCause::Completed),
            SessionEvent::Stopped(cause) => self.termination = Some(cause.clone()),
            _ => {}
        }

        self.state = to;
        self.last_transition_at = at;
        info!("Session {} for {}: {} -> {}", self.id, self.student_id, from, to);

        Some(Transition { from, to, at })
    }
}
