use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{FocusError, Result};
use crate::focus::auth::{Pin, PinVerdict};
use crate::focus::backend::FocusBackend;
use crate::focus::service::PinVerifyRequest;

/// Why guardian authority is being asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideReason {
    Violation,
    TimeExhausted,
    GuardianPause,
}

/// What the guardian wants to happen once the PIN checks out.
///
/// Verification never implies a transition on its own; the caller applies the intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "intent", rename_all = "snake_case")]
pub enum OverrideIntent {
    Resume,
    ExitFocus,
    /// Grant extra time today, then resume
    ExtendTime { seconds: i64 },
}

/// An override waiting on the guardian
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverrideRequest {
    pub reason: OverrideReason,
    pub requested_at: DateTime<Utc>,
    /// False once the guardian dismissed the PIN prompt
    pub prompt_open: bool,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideOutcome {
    Resolved(OverrideIntent),
    Rejected { attempts_remaining: u32 },
    LockedOut { until: DateTime<Utc> },
}

impl OverrideOutcome {
    pub fn into_result(self) -> Result<OverrideIntent> {
        match self {
            OverrideOutcome::Resolved(intent) => Ok(intent),
            OverrideOutcome::Rejected { attempts_remaining } => Err(FocusError::PinRejected { attempts_remaining }),
            OverrideOutcome::LockedOut { until } => Err(FocusError::PinLockedOut { until }),
        }
    }
}

/// Per-session override state: at most one request pending at a time
#[derive(Debug, Default)]
pub struct OverrideProtocol {
    pending: Option<OverrideRequest>,
}

impl OverrideProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an override request. An already pending request keeps its original reason.
    pub fn request(&mut self, reason: OverrideReason, at: DateTime<Utc>) -> &OverrideRequest {
        match &self.pending {
            Some(existing) if existing.reason != reason => info!(
                "Override already pending ({:?}); keeping it over {:?}",
                existing.reason, reason
            ),
            Some(_) => {}
            None => info!("Guardian override requested: {:?}", reason),
        }

        let request = self.pending.get_or_insert_with(|| OverrideRequest {
            reason,
            requested_at: at,
            prompt_open: true,
            attempts: 0,
        });
        request.prompt_open = true;
        request
    }

    pub fn pending(&self) -> Option<&OverrideRequest> {
        self.pending.as_ref()
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// The guardian closed the PIN prompt. The request stays pending.
    pub fn cancel(&mut self) -> Result<()> {
        let request = self.pending.as_mut().ok_or(FocusError::NoOverridePending)?;
        request.prompt_open = false;
        info!("Guardian override prompt dismissed; request remains pending");
        Ok(())
    }

    /// Drop any pending request (session ended)
    pub fn clear(&mut self) {
        self.pending = None;
    }

    /// Verify the guardian PIN against the pending request.
    ///
    /// On acceptance the request is resolved and the intent handed back; otherwise
    /// the request stays pending.
    pub fn verify(
        &mut self,
        backend: &dyn FocusBackend,
        student_id: &str,
        pin: &Pin,
        intent: OverrideIntent,
        now: DateTime<Utc>,
    ) -> Result<OverrideOutcome> {
        let request = self.pending.as_mut().ok_or(FocusError::NoOverridePending)?;
        request.attempts += 1;

        let outcome = authorize(backend, student_id, pin, intent, now)?;
        if let OverrideOutcome::Resolved(intent) = outcome {
            info!("Override for {:?} resolved with {:?}", request.reason, intent);
            self.pending = None;
        }
        Ok(outcome)
    }
}

/// Verify the guardian PIN for an intent without a pending request
pub fn authorize(
    backend: &dyn FocusBackend,
    student_id: &str,
    pin: &Pin,
    intent: OverrideIntent,
    now: DateTime<Utc>,
) -> Result<OverrideOutcome> {
    let request = PinVerifyRequest {
        student_id: student_id.to_string(),
        pin: pin.clone(),
        intent,
    };

    let outcome = match backend.verify_pin(&request, now)? {
        PinVerdict::Accepted => OverrideOutcome::Resolved(intent),
        PinVerdict::Rejected { attempts_remaining } => OverrideOutcome::Rejected { attempts_remaining },
        PinVerdict::LockedOut { until } => {
            warn!("Guardian PIN entry locked until {}", until);
            OverrideOutcome::LockedOut { until }
        }
    };
    Ok(outcome)
}
