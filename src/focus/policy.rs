use anyhow::{Context, Result as AnyResult};
use chrono::{DateTime, FixedOffset, Offset, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{FocusError, Result};
use crate::focus::ledger::SECONDS_PER_DAY;
use crate::focus::routes::{self, RoutePattern};

/// Minutes in a day; window ends are exclusive and may equal this
pub const MINUTES_PER_DAY: u16 = 24 * 60;

/// Largest UTC offset accepted for a student's timezone (18 hours)
const MAX_UTC_OFFSET_MINUTES: i32 = 18 * 60;

/// Guardian-authored policy for one student
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct GuardianPolicy {
    /// Daily usage budget in seconds
    pub daily_limit_seconds: i64,

    /// Windows in which sessions may start (empty = no restriction)
    #[serde(default)]
    pub allowed_windows: Vec<AllowedWindow>,

    /// Routes that never render
    #[serde(default)]
    pub blocked_routes: Vec<String>,

    /// Routes that may render during a focus session (empty = all)
    #[serde(default)]
    pub allowed_routes_during_focus: Vec<String>,

    /// Length of a focus session once admitted
    #[serde(default = "default_session_seconds")]
    pub default_session_seconds: i64,

    /// Whether escape attempts are supervised
    #[serde(default = "default_true")]
    pub focus_enabled: bool,

    /// Student's timezone as a fixed offset from UTC
    #[serde(default)]
    pub utc_offset_minutes: i32,

    /// Where the route guard sends a student during focus
    #[serde(default = "default_focus_home_route")]
    pub focus_home_route: String,
}

fn default_session_seconds() -> i64 {
    25 * 60
}

fn default_true() -> bool {
    true
}

fn default_focus_home_route() -> String {
    "/focus".to_string()
}

/// A weekly time window, `[start, end)` in minutes of the student's local day
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct AllowedWindow {
    pub weekday: Weekday,

    #[serde(rename = "start", with = "clock_minutes")]
    pub start_minute: u16,

    #[serde(rename = "end", with = "clock_minutes")]
    pub end_minute: u16,
}

impl AllowedWindow {
    pub fn new(weekday: Weekday, start_minute: u16, end_minute: u16) -> Self {
        Self {
            weekday,
            start_minute,
            end_minute,
        }
    }

    /// Whether a local minute-of-day on `weekday` falls inside the window
    pub fn contains(&self, weekday: Weekday, minute_of_day: u16) -> bool {
        self.weekday == weekday && self.start_minute <= minute_of_day && minute_of_day < self.end_minute
    }

    fn sort_key(&self) -> (u32, u16, u16) {
        (self.weekday.num_days_from_monday(), self.start_minute, self.end_minute)
    }
}

impl GuardianPolicy {
    /// A policy with the given budget and everything else at defaults
    pub fn with_daily_limit(daily_limit_seconds: i64) -> Self {
        Self {
            daily_limit_seconds,
            allowed_windows: Vec::new(),
            blocked_routes: Vec::new(),
            allowed_routes_during_focus: Vec::new(),
            default_session_seconds: default_session_seconds(),
            focus_enabled: true,
            utc_offset_minutes: 0,
            focus_home_route: default_focus_home_route(),
        }
    }

    /// Validate and normalise a policy at the write boundary.
    ///
    /// Nothing is applied unless the whole policy is valid. Overlapping or
    /// touching windows on the same weekday are merged and route sets deduplicated.
    pub fn prepare(mut self) -> Result<Self> {
        validate_policy(&self)?;
        self.allowed_windows = merge_windows(&self.allowed_windows);
        dedup_routes(&mut self.blocked_routes);
        dedup_routes(&mut self.allowed_routes_during_focus);
        Ok(self)
    }

    /// The student's timezone
    pub fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix())
    }

    /// Convert an instant to the student's local time
    pub fn local_time(&self, at: DateTime<Utc>) -> DateTime<FixedOffset> {
        at.with_timezone(&self.offset())
    }
}

/// Validate a guardian policy
pub fn validate_policy(policy: &GuardianPolicy) -> Result<()> {
    if !(0..=SECONDS_PER_DAY).contains(&policy.daily_limit_seconds) {
        return Err(invalid(format!(
            "daily_limit_seconds must be between 0 and {} (got {})",
            SECONDS_PER_DAY, policy.daily_limit_seconds
        )));
    }

    if policy.default_session_seconds <= 0 {
        return Err(invalid(format!(
            "default_session_seconds must be positive (got {})",
            policy.default_session_seconds
        )));
    }

    if policy.utc_offset_minutes.abs() > MAX_UTC_OFFSET_MINUTES {
        return Err(invalid(format!(
            "utc_offset_minutes out of range: {}",
            policy.utc_offset_minutes
        )));
    }

    for window in &policy.allowed_windows {
        if window.start_minute >= window.end_minute {
            return Err(invalid(format!(
                "window on {} must start before it ends ({} >= {})",
                window.weekday,
                clock_minutes::format(window.start_minute),
                clock_minutes::format(window.end_minute)
            )));
        }
        if window.end_minute > MINUTES_PER_DAY {
            return Err(invalid(format!(
                "window on {} ends after midnight ({})",
                window.weekday, window.end_minute
            )));
        }
    }

    for raw in policy.blocked_routes.iter().chain(&policy.allowed_routes_during_focus) {
        RoutePattern::parse(raw)?;
    }

    if !policy.focus_home_route.starts_with('/') {
        return Err(invalid(format!(
            "focus_home_route must be an absolute route (got '{}')",
            policy.focus_home_route
        )));
    }

    if routes::is_route_blocked(policy, &policy.focus_home_route) {
        return Err(invalid(format!(
            "focus_home_route '{}' is itself blocked",
            policy.focus_home_route
        )));
    }

    Ok(())
}

fn invalid(message: String) -> FocusError {
    FocusError::InvalidPolicy(message)
}

/// Merge overlapping or adjacent windows per weekday, sorted Monday first
pub fn merge_windows(windows: &[AllowedWindow]) -> Vec<AllowedWindow> {
    let mut sorted = windows.to_vec();
    sorted.sort_by_key(AllowedWindow::sort_key);

    let mut merged: Vec<AllowedWindow> = Vec::with_capacity(sorted.len());
    for window in sorted {
        match merged.last_mut() {
            Some(last) if last.weekday == window.weekday && window.start_minute <= last.end_minute => {
                last.end_minute = last.end_minute.max(window.end_minute);
            }
            _ => merged.push(window),
        }
    }
    merged
}

fn dedup_routes(patterns: &mut Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    patterns.retain(|p| seen.insert(p.trim().to_string()));
    for pattern in patterns.iter_mut() {
        *pattern = pattern.trim().to_string();
    }
}

/// Load a policy from a YAML file
pub fn load_policy_file(path: &Path) -> AnyResult<GuardianPolicy> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read policy file: {}", path.display()))?;

    let policy: GuardianPolicy = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse YAML policy file: {}", path.display()))?;

    policy
        .prepare()
        .with_context(|| format!("Invalid policy file: {}", path.display()))
}

/// Example policy file content
pub const EXAMPLE_POLICY: &str = include_str!("../../example-policy.yaml");

/// Serde adapter: windows are written as "HH:MM" and read from either
/// "HH:MM" strings or integer minutes of the day.
pub mod clock_minutes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn format(minute: u16) -> String {
        format!("{:02}:{:02}", minute / 60, minute % 60)
    }

    pub fn parse(value: &str) -> Result<u16, String> {
        let (hours, minutes) = value
            .trim()
            .split_once(':')
            .ok_or_else(|| format!("expected HH:MM, got '{}'", value))?;

        let hours: u16 = hours
            .parse()
            .map_err(|_| format!("invalid hour in '{}'", value))?;
        let minutes: u16 = minutes
            .parse()
            .map_err(|_| format!("invalid minute in '{}'", value))?;

        if minutes >= 60 || hours > 24 || (hours == 24 && minutes != 0) {
            return Err(format!("time of day out of range: '{}'", value));
        }

        Ok(hours * 60 + minutes)
    }

    pub fn serialize<S: Serializer>(minute: &u16, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(*minute))
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Minutes(u16),
        Clock(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Minutes(minute) => Ok(minute),
            Repr::Clock(text) => parse(&text).map_err(serde::de::Error::custom),
        }
    }
}
