use chrono::{DateTime, Datelike, Days, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::focus::policy::GuardianPolicy;

/// Result of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Admission {
    Admitted,
    DeniedOutsideWindow,
    DeniedLimitExhausted,
}

impl Admission {
    pub fn denial(self) -> Option<Denial> {
        match self {
            Admission::Admitted => None,
            Admission::DeniedOutsideWindow => Some(Denial::OutsideWindow),
            Admission::DeniedLimitExhausted => Some(Denial::LimitExhausted),
        }
    }
}

/// Why a session was not admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Denial {
    OutsideWindow,
    LimitExhausted,
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Denial::OutsideWindow => write!(f, "outside the allowed time windows"),
            Denial::LimitExhausted => write!(f, "daily limit exhausted"),
        }
    }
}

/// Pure admission and budget calculations over a policy snapshot
pub struct ScheduleCalculator;

impl ScheduleCalculator {
    /// Decide whether a new focus session may start at `now`.
    ///
    /// The window check runs first, so a request that fails both reports
    /// `DeniedOutsideWindow`.
    pub fn can_start_session(
        policy: &GuardianPolicy,
        now: DateTime<Utc>,
        used_seconds_today: i64,
        bonus_seconds_today: i64,
    ) -> Admission {
        if !Self::is_within_window(policy, now) {
            return Admission::DeniedOutsideWindow;
        }

        if Self::remaining_seconds(policy, used_seconds_today, bonus_seconds_today) <= 0 {
            return Admission::DeniedLimitExhausted;
        }

        Admission::Admitted
    }

    /// Whether `now` falls inside an allowed window (always true without windows)
    pub fn is_within_window(policy: &GuardianPolicy, now: DateTime<Utc>) -> bool {
        if policy.allowed_windows.is_empty() {
            return true;
        }

        let local = policy.local_time(now);
        let minute_of_day = (local.hour() * 60 + local.minute()) as u16;

        policy
            .allowed_windows
            .iter()
            .any(|window| window.contains(local.weekday(), minute_of_day))
    }

    /// Seconds left today; never negative
    pub fn remaining_seconds(policy: &GuardianPolicy, used_seconds: i64, bonus_seconds: i64) -> i64 {
        Self::budget(policy, bonus_seconds).saturating_sub(used_seconds).max(0)
    }

    /// Whether today's budget is spent
    pub fn is_limit_reached(policy: &GuardianPolicy, used_seconds: i64, bonus_seconds: i64) -> bool {
        used_seconds >= Self::budget(policy, bonus_seconds)
    }

    fn budget(policy: &GuardianPolicy, bonus_seconds: i64) -> i64 {
        policy.daily_limit_seconds.saturating_add(bonus_seconds)
    }

    /// Next instant at or after `now` at which a window opens, looking one week ahead.
    ///
    /// Returns `now` if a window is already open and `None` if no windows are configured.
    pub fn next_window_start(policy: &GuardianPolicy, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if policy.allowed_windows.is_empty() {
            return None;
        }
        if Self::is_within_window(policy, now) {
            return Some(now);
        }

        let offset = policy.offset();
        let today = policy.local_time(now).date_naive();

        (0..=7u64)
            .filter_map(|ahead| today.checked_add_days(Days::new(ahead)))
            .flat_map(|date| {
                policy
                    .allowed_windows
                    .iter()
                    .filter(move |window| window.weekday == date.weekday())
                    .filter_map(move |window| {
                        date.and_hms_opt(
                            u32::from(window.start_minute / 60),
                            u32::from(window.start_minute % 60),
                            0,
                        )
                    })
            })
            .filter_map(|naive| naive.and_local_timezone(offset).single())
            .map(|local| local.with_timezone(&Utc))
            .filter(|start| *start > now)
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::focus::policy::AllowedWindow;
    use chrono::Weekday;

    fn at(text: &str) -> DateTime<Utc> {
        text.parse().unwrap()
    }

    fn monday_morning_policy() -> GuardianPolicy {
        let mut policy = GuardianPolicy::with_daily_limit(1800);
        // 09:00 - 10:20
        policy.allowed_windows = vec![AllowedWindow::new(Weekday::Mon, 9 * 60, 10 * 60 + 20)];
        policy
    }

    #[test]
    fn test_denied_just_before_window() {
        let policy = monday_morning_policy();
        // 2025-11-17 is a Monday
        let admission = ScheduleCalculator::can_start_session(&policy, at("2025-11-17T08:59:00Z"), 0, 0);
        assert_eq!(admission, Admission::DeniedOutsideWindow);
    }

    #[test]
    fn test_admitted_inside_window() {
        let policy = monday_morning_policy();
        let admission = ScheduleCalculator::can_start_session(&policy, at("2025-11-17T09:01:00Z"), 0, 0);
        assert_eq!(admission, Admission::Admitted);
    }

    #[test]
    fn test_window_end_is_exclusive() {
        let policy = monday_morning_policy();
        assert!(ScheduleCalculator::is_within_window(&policy, at("2025-11-17T10:19:59Z")));
        assert!(!ScheduleCalculator::is_within_window(&policy, at("2025-11-17T10:20:00Z")));
    }

    #[test]
    fn test_window_is_weekday_specific() {
        let policy = monday_morning_policy();
        // Tuesday, same clock time
        let admission = ScheduleCalculator::can_start_session(&policy, at("2025-11-18T09:30:00Z"), 0, 0);
        assert_eq!(admission, Admission::DeniedOutsideWindow);
    }

    #[test]
    fn test_denied_when_limit_exhausted() {
        let policy = monday_morning_policy();
        let admission = ScheduleCalculator::can_start_session(&policy, at("2025-11-17T09:30:00Z"), 1800, 0);
        assert_eq!(admission, Admission::DeniedLimitExhausted);
    }

    #[test]
    fn test_bonus_reopens_budget() {
        let policy = monday_morning_policy();
        let admission = ScheduleCalculator::can_start_session(&policy, at("2025-11-17T09:30:00Z"), 1800, 600);
        assert_eq!(admission, Admission::Admitted);
    }

    #[test]
    fn test_outside_window_reported_before_limit() {
        let policy = monday_morning_policy();
        let admission = ScheduleCalculator::can_start_session(&policy, at("2025-11-17T20:00:00Z"), 1800, 0);
        assert_eq!(admission.denial(), Some(Denial::OutsideWindow));
    }

    #[test]
    fn test_no_windows_means_any_time() {
        let policy = GuardianPolicy::with_daily_limit(60);
        let admission = ScheduleCalculator::can_start_session(&policy, at("2025-11-16T03:00:00Z"), 0, 0);
        assert_eq!(admission, Admission::Admitted);
    }

    #[test]
    fn test_zero_limit_denies() {
        let policy = GuardianPolicy::with_daily_limit(0);
        let admission = ScheduleCalculator::can_start_session(&policy, at("2025-11-16T03:00:00Z"), 0, 0);
        assert_eq!(admission, Admission::DeniedLimitExhausted);
    }

    #[test]
    fn test_windows_use_student_timezone() {
        let mut policy = monday_morning_policy();
        policy.utc_offset_minutes = 120;
        // 07:30 UTC is 09:30 at UTC+2
        assert!(ScheduleCalculator::is_within_window(&policy, at("2025-11-17T07:30:00Z")));
        assert!(!ScheduleCalculator::is_within_window(&policy, at("2025-11-17T09:30:00Z")));
    }

    #[test]
    fn test_remaining_never_negative() {
        let policy = GuardianPolicy::with_daily_limit(1800);
        assert_eq!(ScheduleCalculator::remaining_seconds(&policy, 1750, 0), 50);
        assert_eq!(ScheduleCalculator::remaining_seconds(&policy, 1810, 0), 0);
        assert!(!ScheduleCalculator::is_limit_reached(&policy, 1750, 0));
        assert!(ScheduleCalculator::is_limit_reached(&policy, 1810, 0));
    }

    #[test]
    fn test_budget_math_saturates() {
        let policy = GuardianPolicy::with_daily_limit(i64::MAX);
        assert_eq!(ScheduleCalculator::remaining_seconds(&policy, 0, i64::MAX), i64::MAX);
        assert!(!ScheduleCalculator::is_limit_reached(&policy, i64::MAX - 1, 1));
    }

    #[test]
    fn test_integer_windows_are_minutes_of_day() {
        let policy: GuardianPolicy = serde_json::from_str(
            r#"{"daily_limit_seconds": 1800, "allowed_windows": [{"weekday": "Mon", "start": 900, "end": 1020}]}"#,
        )
        .unwrap();
        let policy = policy.prepare().unwrap();

        // 900 and 1020 minutes are 15:00 and 17:00
        assert_eq!(policy.allowed_windows[0].start_minute, 15 * 60);
        assert_eq!(
            ScheduleCalculator::can_start_session(&policy, at("2025-11-17T09:01:00Z"), 0, 0),
            Admission::DeniedOutsideWindow
        );
        assert_eq!(
            ScheduleCalculator::can_start_session(&policy, at("2025-11-17T15:01:00Z"), 0, 0),
            Admission::Admitted
        );
        assert!(!ScheduleCalculator::is_within_window(&policy, at("2025-11-17T17:00:00Z")));
    }

    #[test]
    fn test_next_window_start() {
        let policy = monday_morning_policy();

        let next = ScheduleCalculator::next_window_start(&policy, at("2025-11-17T08:00:00Z"));
        assert_eq!(next, Some(at("2025-11-17T09:00:00Z")));

        // After today's window closes, the next one is a week later
        let next = ScheduleCalculator::next_window_start(&policy, at("2025-11-17T11:00:00Z"));
        assert_eq!(next, Some(at("2025-11-24T09:00:00Z")));

        let now = at("2025-11-17T09:10:00Z");
        assert_eq!(ScheduleCalculator::next_window_start(&policy, now), Some(now));
    }
}
