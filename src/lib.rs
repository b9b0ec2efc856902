//! Focus-session and screen-time enforcement.
//!
//! Guardians set a per-student policy (daily budget, access windows, route
//! rules); the accounting service keeps the usage ledger; the session
//! controller supervises a running focus session and gates every way out of it
//! behind the guardian PIN.

pub mod error;
pub mod focus;
pub mod platform;

pub use error::{FocusError, Result};
