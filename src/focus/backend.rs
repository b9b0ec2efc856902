use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{FocusError, Result};
use crate::focus::auth::PinVerdict;
use crate::focus::ledger::{Heartbeat, HeartbeatReceipt, UsageSummary};
use crate::focus::policy::GuardianPolicy;
use crate::focus::service::{FocusService, PinVerifyRequest};

/// What a session controller needs from the accounting service.
///
/// A remote transport implements this over the HTTP endpoints; [`LocalBackend`]
/// calls an in-process [`FocusService`].
pub trait FocusBackend: Send + Sync {
    fn policy(&self, student_id: &str) -> Result<GuardianPolicy>;

    fn usage(&self, student_id: &str, at: DateTime<Utc>) -> Result<UsageSummary>;

    fn heartbeat(&self, heartbeat: &Heartbeat) -> Result<HeartbeatReceipt>;

    fn verify_pin(&self, request: &PinVerifyRequest, at: DateTime<Utc>) -> Result<PinVerdict>;
}

/// In-process backend sharing one service between callers
#[derive(Clone)]
pub struct LocalBackend {
    service: Arc<Mutex<FocusService>>,
}

impl LocalBackend {
    pub fn new(service: FocusService) -> Self {
        Self {
            service: Arc::new(Mutex::new(service)),
        }
    }

    /// Lock the underlying service
    pub fn lock(&self) -> Result<MutexGuard<'_, FocusService>> {
        self.service
            .lock()
            .map_err(|_| FocusError::Storage("service lock poisoned".to_string()))
    }
}

impl FocusBackend for LocalBackend {
    fn policy(&self, student_id: &str) -> Result<GuardianPolicy> {
        self.lock()?.get_policy(student_id).cloned()
    }

    fn usage(&self, student_id: &str, at: DateTime<Utc>) -> Result<UsageSummary> {
        self.lock()?.usage(student_id, at)
    }

    fn heartbeat(&self, heartbeat: &Heartbeat) -> Result<HeartbeatReceipt> {
        self.lock()?.heartbeat(heartbeat).map_err(|e| match e {
            FocusError::Storage(reason) => FocusError::HeartbeatDelivery(reason),
            other => other,
        })
    }

    fn verify_pin(&self, request: &PinVerifyRequest, at: DateTime<Utc>) -> Result<PinVerdict> {
        self.lock()?.verify_pin(request, at)
    }
}
