use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{info, warn};

use crate::error::{FocusError, Result};
use crate::focus::config::PinSettings;

const PIN_MIN_DIGITS: usize = 4;
const PIN_MAX_DIGITS: usize = 12;

/// A guardian PIN in plaintext. Never printed, never persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct Pin(String);

impl Pin {
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        let digits = value.chars().count();
        if !(PIN_MIN_DIGITS..=PIN_MAX_DIGITS).contains(&digits) || !value.chars().all(|c| c.is_ascii_digit()) {
            return Err(FocusError::InvalidPolicy(format!(
                "PIN must be {}-{} digits",
                PIN_MIN_DIGITS, PIN_MAX_DIGITS
            )));
        }
        Ok(Self(value))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Pin(****)")
    }
}

impl FromStr for Pin {
    type Err = FocusError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s.trim())
    }
}

impl<'de> Deserialize<'de> for Pin {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Pin::new(raw).map_err(serde::de::Error::custom)
    }
}

/// Hash a PIN with Argon2id and a random salt (PHC string)
pub fn hash_pin(pin: &Pin) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);

    Argon2::default()
        .hash_password(pin.expose().as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| FocusError::Storage(format!("Failed to hash PIN: {}", e)))
}

/// Check a PIN against a stored hash
pub fn pin_matches(pin: &Pin, hash: &str) -> Result<bool> {
    let parsed_hash =
        PasswordHash::new(hash).map_err(|e| FocusError::Storage(format!("Failed to parse PIN hash: {}", e)))?;

    Ok(Argon2::default()
        .verify_password(pin.expose().as_bytes(), &parsed_hash)
        .is_ok())
}

/// Outcome of a PIN check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum PinVerdict {
    Accepted,
    Rejected { attempts_remaining: u32 },
    LockedOut { until: DateTime<Utc> },
}

impl PinVerdict {
    /// Map non-accepted verdicts to their error
    pub fn into_result(self) -> Result<()> {
        match self {
            PinVerdict::Accepted => Ok(()),
            PinVerdict::Rejected { attempts_remaining } => Err(FocusError::PinRejected { attempts_remaining }),
            PinVerdict::LockedOut { until } => Err(FocusError::PinLockedOut { until }),
        }
    }
}

/// Stored guardian credential with attempt counting
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PinCredential {
    pub hash: String,
    pub failed_attempts: u32,
    pub locked_until: Option<DateTime<Utc>>,
    pub changed_at: DateTime<Utc>,
}

impl PinCredential {
    pub fn new(pin: &Pin, now: DateTime<Utc>) -> Result<Self> {
        Ok(Self {
            hash: hash_pin(pin)?,
            failed_attempts: 0,
            locked_until: None,
            changed_at: now,
        })
    }

    /// Replace the PIN; clears attempts and any lockout
    pub fn change(&mut self, pin: &Pin, now: DateTime<Utc>) -> Result<()> {
        *self = Self::new(pin, now)?;
        info!("Guardian PIN changed");
        Ok(())
    }

    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.is_some_and(|until| now < until)
    }

    /// Verify a PIN attempt.
    ///
    /// While locked, every attempt returns `LockedOut` without the PIN being
    /// checked. An expired lockout starts a fresh attempt count.
    pub fn verify(&mut self, pin: &Pin, now: DateTime<Utc>, settings: &PinSettings) -> Result<PinVerdict> {
        if let Some(until) = self.locked_until {
            if now < until {
                warn!("PIN attempt during lockout (until {})", until);
                return Ok(PinVerdict::LockedOut { until });
            }
            self.locked_until = None;
            self.failed_attempts = 0;
        }

        if pin_matches(pin, &self.hash)? {
            self.failed_attempts = 0;
            info!("Guardian PIN accepted");
            return Ok(PinVerdict::Accepted);
        }

        self.failed_attempts += 1;
        let attempts_remaining = settings.max_attempts.saturating_sub(self.failed_attempts);

        if attempts_remaining == 0 {
            let until = now + settings.lockout();
            self.locked_until = Some(until);
            warn!(
                "Guardian PIN rejected {} times, locked until {}",
                self.failed_attempts, until
            );
        } else {
            warn!("Guardian PIN rejected ({} attempt(s) remaining)", attempts_remaining);
        }

        Ok(PinVerdict::Rejected { attempts_remaining })
    }
}

/// Name of the OS user acting as guardian, for audit records
pub fn guardian_identity() -> anyhow::Result<String> {
    use anyhow::Context;

    #[cfg(target_os = "windows")]
    {
        std::env::var("USERNAME").context("Failed to get USERNAME environment variable")
    }

    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("USER").context("Failed to get USER environment variable")
    }
}
