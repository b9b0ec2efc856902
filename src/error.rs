//! Error taxonomy for the focus engine.
//!
//! Library code returns [`FocusError`]; the CLI wraps it in `anyhow` with context.
//! A violation is an expected operating condition and is not represented here.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::focus::schedule::Denial;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FocusError {
    /// Admission refused by the policy engine
    #[error("Focus session denied: {0}")]
    PolicyDenied(Denial),

    /// Display mode or sleep lock could not be acquired; the session continues unprotected
    #[error("Resource '{resource}' unavailable: {reason}")]
    ResourceUnavailable { resource: String, reason: String },

    /// Heartbeat could not reach the accounting service; it stays buffered for retry
    #[error("Heartbeat delivery failed: {0}")]
    HeartbeatDelivery(String),

    /// Heartbeat the accounting service will never accept as sent
    #[error("Invalid heartbeat: {0}")]
    InvalidHeartbeat(String),

    #[error("PIN rejected ({attempts_remaining} attempt(s) remaining before lockout)")]
    PinRejected { attempts_remaining: u32 },

    #[error("PIN entry locked until {until}")]
    PinLockedOut { until: DateTime<Utc> },

    #[error("Guardian PIN required")]
    PinRequired,

    #[error("No guardian PIN has been set for '{0}'")]
    PinNotSet(String),

    /// Malformed guardian configuration, rejected before anything is applied
    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    #[error("Student '{0}' already has a focus session in progress")]
    SessionAlreadyActive(String),

    #[error("No guardian override is pending")]
    NoOverridePending,

    #[error("Cannot {action} while session is {state}")]
    InvalidState { action: &'static str, state: String },

    #[error("Unknown student: {0}")]
    UnknownStudent(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

pub type Result<T, E = FocusError> = std::result::Result<T, E>;

impl FocusError {
    /// Whether the caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FocusError::HeartbeatDelivery(_) | FocusError::Storage(_) | FocusError::PinLockedOut { .. }
        )
    }
}
