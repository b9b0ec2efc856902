//! Server-side facade over the policy store, usage ledger and PIN credentials.
//!
//! Each method corresponds to one endpoint of the accounting service:
//!
//! | Endpoint                          | Method           |
//! |-----------------------------------|------------------|
//! | `POST /session/heartbeat`         | [`FocusService::heartbeat`] |
//! | `POST /session/reset`             | [`FocusService::reset`] |
//! | `GET /session/usage/{studentId}`  | [`FocusService::usage`] |
//! | `GET /policy/{studentId}`         | [`FocusService::get_policy`] |
//! | `PUT /policy/{studentId}`         | [`FocusService::put_policy`] |
//! | `POST /pin/verify`                | [`FocusService::verify_pin`] |
//!
//! Every mutation is written through to `state.json` when the service is backed by a file.

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{FocusError, Result};
use crate::focus::auth::{Pin, PinCredential, PinVerdict};
use crate::focus::config::EngineSettings;
use crate::focus::ledger::{AuditRecord, Heartbeat, HeartbeatReceipt, UsageLedger, UsageLedgerEntry, UsageSummary};
use crate::focus::overrides::OverrideIntent;
use crate::focus::policy::GuardianPolicy;
use crate::platform::common::{atomic_write, ensure_private_directory, set_file_permissions};

const STATE_VERSION: &str = "1.0";

/// File name of the persisted service state inside the data directory
pub const STATE_FILE: &str = "state.json";

/// Recorded as `authorized_by` for extensions granted through a PIN-verified override
pub const PIN_AUTHORITY: &str = "guardian-pin";

/// `POST /session/reset` body
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ResetRequest {
    pub student_id: String,
    pub authorized_by: String,
}

/// `POST /pin/verify` body
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PinVerifyRequest {
    pub student_id: String,
    pub pin: Pin,
    pub intent: OverrideIntent,
}

/// Everything the service persists
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ServiceState {
    pub version: String,
    #[serde(default)]
    pub policies: BTreeMap<String, GuardianPolicy>,
    #[serde(default)]
    pub ledger: UsageLedger,
    #[serde(default)]
    pub pins: BTreeMap<String, PinCredential>,
}

impl ServiceState {
    pub fn new() -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            policies: BTreeMap::new(),
            ledger: UsageLedger::new(),
            pins: BTreeMap::new(),
        }
    }
}

impl Default for ServiceState {
    fn default() -> Self {
        Self::new()
    }
}

/// Load persisted state. Missing files and version mismatches yield `None`.
pub fn load_state(path: &Path) -> anyhow::Result<Option<ServiceState>> {
    if !path.exists() {
        return Ok(None);
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read state file: {}", path.display()))?;

    let state: ServiceState = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse state file: {}", path.display()))?;

    if state.version != STATE_VERSION {
        warn!(
            "State file version mismatch (expected {}, got {}). Starting with fresh state.",
            STATE_VERSION, state.version
        );
        return Ok(None);
    }

    Ok(Some(state))
}

/// Save state atomically, readable by the owner only (it holds PIN hashes)
pub fn save_state(path: &Path, state: &ServiceState) -> anyhow::Result<()> {
    let content = serde_json::to_string_pretty(state).context("Failed to serialize state")?;

    atomic_write(path, content.as_bytes())
        .with_context(|| format!("Failed to write state file: {}", path.display()))?;

    set_file_permissions(path, 0o600)?;

    Ok(())
}

pub struct FocusService {
    state: ServiceState,
    settings: EngineSettings,
    store: Option<PathBuf>,
}

impl FocusService {
    /// A service that keeps everything in memory
    pub fn in_memory(settings: EngineSettings) -> Self {
        Self {
            state: ServiceState::new(),
            settings,
            store: None,
        }
    }

    /// Open the service backed by `state.json` in `data_dir`
    pub fn open(data_dir: &Path, settings: EngineSettings) -> anyhow::Result<Self> {
        ensure_private_directory(data_dir)?;
        let path = data_dir.join(STATE_FILE);
        let state = load_state(&path)?.unwrap_or_default();
        debug!(
            "Opened state at {} ({} student(s) with policies)",
            path.display(),
            state.policies.len()
        );

        Ok(Self {
            state,
            settings,
            store: Some(path),
        })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn state(&self) -> &ServiceState {
        &self.state
    }

    /// Apply `change` to a copy of the state and swap the copy in once it is stored.
    ///
    /// A failed change or a failed write leaves the live state untouched.
    fn commit<T>(&mut self, change: impl FnOnce(&mut ServiceState) -> Result<T>) -> Result<T> {
        let mut draft = self.state.clone();
        let value = change(&mut draft)?;
        self.store(&draft)?;
        self.state = draft;
        Ok(value)
    }

    fn store(&self, state: &ServiceState) -> Result<()> {
        match &self.store {
            Some(path) => save_state(path, state).map_err(|e| FocusError::Storage(format!("{:#}", e))),
            None => Ok(()),
        }
    }

    /// `GET /policy/{studentId}`
    pub fn get_policy(&self, student_id: &str) -> Result<&GuardianPolicy> {
        self.state
            .policies
            .get(student_id)
            .ok_or_else(|| FocusError::UnknownStudent(student_id.to_string()))
    }

    /// `PUT /policy/{studentId}`: validated as a whole before anything is stored
    pub fn put_policy(&mut self, student_id: &str, policy: GuardianPolicy) -> Result<()> {
        let policy = policy.prepare()?;
        self.commit(|state| {
            state.policies.insert(student_id.to_string(), policy);
            Ok(())
        })?;
        info!("Stored policy for {}", student_id);
        Ok(())
    }

    /// `POST /session/heartbeat`
    pub fn heartbeat(&mut self, heartbeat: &Heartbeat) -> Result<HeartbeatReceipt> {
        let policy = self.get_policy(&heartbeat.student_id)?.clone();
        let min_spacing = self.settings.heartbeat.min_spacing_seconds;

        let mut draft = self.state.clone();
        let receipt = draft.ledger.heartbeat(heartbeat, &policy, min_spacing)?;

        // Uncounted heartbeats change nothing worth writing
        if receipt.counted {
            self.store(&draft)?;
            self.state = draft;
        }

        if receipt.limit_reached {
            info!(
                "Daily limit reached for {} ({}s used)",
                heartbeat.student_id, receipt.used_seconds_today
            );
        }
        Ok(receipt)
    }

    /// `GET /session/usage/{studentId}`
    pub fn usage(&self, student_id: &str, at: DateTime<Utc>) -> Result<UsageSummary> {
        let policy = self.get_policy(student_id)?;
        Ok(self.state.ledger.summary(student_id, at, policy))
    }

    /// `POST /session/reset`
    pub fn reset(&mut self, request: &ResetRequest, at: DateTime<Utc>) -> Result<AuditRecord> {
        let policy = self.get_policy(&request.student_id)?.clone();
        self.commit(|state| {
            state
                .ledger
                .reset_today(&request.student_id, &request.authorized_by, at, &policy)
        })
    }

    /// Grant extra time for today
    pub fn grant_extension(
        &mut self,
        student_id: &str,
        seconds: i64,
        authorized_by: &str,
        at: DateTime<Utc>,
    ) -> Result<UsageSummary> {
        let policy = self.get_policy(student_id)?.clone();
        self.commit(|state| {
            state
                .ledger
                .grant_extension(student_id, seconds, authorized_by, at, &policy)?;
            Ok(state.ledger.summary(student_id, at, &policy))
        })
    }

    /// Daily usage, most recent first
    pub fn history(&self, student_id: &str, days: usize) -> Result<Vec<UsageLedgerEntry>> {
        self.get_policy(student_id)?;
        Ok(self
            .state
            .ledger
            .history(student_id, days)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Guardian actions recorded for a student
    pub fn audit(&self, student_id: &str) -> Vec<AuditRecord> {
        self.state.ledger.audit_for(student_id).into_iter().cloned().collect()
    }

    /// Set or change the guardian PIN; clears attempts and lockout
    pub fn set_pin(&mut self, student_id: &str, pin: &Pin, at: DateTime<Utc>) -> Result<()> {
        let created = self.commit(|state| match state.pins.get_mut(student_id) {
            Some(credential) => credential.change(pin, at).map(|_| false),
            None => {
                state.pins.insert(student_id.to_string(), PinCredential::new(pin, at)?);
                Ok(true)
            }
        })?;
        if created {
            info!("Guardian PIN set for {}", student_id);
        }
        Ok(())
    }

    /// Check the guardian PIN without acting on it.
    ///
    /// The verdict is only returned once the updated attempt count is stored.
    pub fn authenticate(&mut self, student_id: &str, pin: &Pin, at: DateTime<Utc>) -> Result<PinVerdict> {
        let pin_settings = self.settings.pin.clone();
        self.commit(|state| {
            state
                .pins
                .get_mut(student_id)
                .ok_or_else(|| FocusError::PinNotSet(student_id.to_string()))?
                .verify(pin, at, &pin_settings)
        })
    }

    /// Whether a guardian PIN exists for the student
    pub fn has_pin(&self, student_id: &str) -> bool {
        self.state.pins.contains_key(student_id)
    }

    /// `POST /pin/verify`.
    ///
    /// An accepted `ExtendTime` intent grants the extension before answering.
    /// Attempt counts are persisted whatever the verdict.
    pub fn verify_pin(&mut self, request: &PinVerifyRequest, at: DateTime<Utc>) -> Result<PinVerdict> {
        let verdict = self.authenticate(&request.student_id, &request.pin, at)?;

        if let (PinVerdict::Accepted, OverrideIntent::ExtendTime { seconds }) = (verdict, request.intent) {
            self.grant_extension(&request.student_id, seconds, PIN_AUTHORITY, at)?;
        }

        Ok(verdict)
    }
}
