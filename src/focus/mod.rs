//! Focus session and screen-time enforcement
//!
//! This module provides functionality to:
//! - Describe a guardian's policy (daily budget, access windows, route rules)
//! - Decide whether a focus session may start and which routes may render
//! - Account daily usage from client heartbeats, idempotently
//! - Supervise a running session and react to escape attempts
//! - Gate overrides behind a guardian PIN with lockout

pub mod auth;
pub mod backend;
pub mod config;
pub mod controller;
pub mod devices;
pub mod heartbeat;
pub mod ledger;
pub mod overrides;
pub mod policy;
pub mod routes;
pub mod schedule;
pub mod service;
pub mod session;

pub use auth::{Pin, PinCredential, PinVerdict};
pub use backend::{FocusBackend, LocalBackend};
pub use config::EngineSettings;
pub use controller::{FocusController, HostSignal, SessionNotice, SessionRegistry, SignalSender};
pub use devices::{FocusResource, ResourceSet};
pub use ledger::{Heartbeat, HeartbeatReceipt, UsageLedger, UsageSummary};
pub use overrides::{OverrideIntent, OverrideProtocol, OverrideReason};
pub use policy::{AllowedWindow, GuardianPolicy};
pub use routes::RouteDecision;
pub use schedule::{Admission, Denial, ScheduleCalculator};
pub use service::FocusService;
pub use session::{FocusSession, SessionState};
