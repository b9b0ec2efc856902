use chrono::{DateTime, FixedOffset, NaiveDate, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::error::{FocusError, Result};
use crate::focus::policy::GuardianPolicy;
use crate::focus::schedule::ScheduleCalculator;

/// Days of usage kept per student
pub const HISTORY_RETENTION_DAYS: usize = 90;

/// Upper bound for a heartbeat interval and for a single extension
pub const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

/// Client report of elapsed active time (`POST /session/heartbeat`)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Heartbeat {
    pub student_id: String,
    pub observed_at: DateTime<Utc>,
    pub interval_seconds: i64,
}

/// Accounting answer to a heartbeat
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct HeartbeatReceipt {
    pub used_seconds_today: i64,
    pub remaining_seconds: i64,
    pub limit_reached: bool,
    /// False when the heartbeat was acknowledged but not counted
    #[serde(default = "default_true")]
    pub counted: bool,
}

fn default_true() -> bool {
    true
}

/// One student's usage for one local calendar day
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct UsageLedgerEntry {
    pub student_id: String,
    pub date: NaiveDate,
    pub used_seconds: i64,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// Guardian-granted extra time for this day
    #[serde(default)]
    pub bonus_seconds: i64,
}

/// Usage answer for a student on a given day
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct UsageSummary {
    pub student_id: String,
    pub date: NaiveDate,
    pub used_seconds: i64,
    pub bonus_seconds: i64,
    pub limit_seconds: i64,
    pub remaining_seconds: i64,
    pub limit_reached: bool,
}

impl From<&UsageSummary> for HeartbeatReceipt {
    fn from(summary: &UsageSummary) -> Self {
        Self {
            used_seconds_today: summary.used_seconds,
            remaining_seconds: summary.remaining_seconds,
            limit_reached: summary.limit_reached,
            counted: true,
        }
    }
}

/// Guardian action recorded against the ledger
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AuditRecord {
    pub student_id: String,
    #[serde(rename = "type")]
    pub kind: AuditKind,
    pub date: NaiveDate,
    pub used_seconds_before: i64,
    /// Seconds granted (extensions only)
    pub seconds: Option<i64>,
    pub authorized_by: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditKind {
    Reset,
    Extension,
}

/// Per-student ledger: the last accepted heartbeat and daily entries, oldest first
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct StudentLedger {
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub days: Vec<UsageLedgerEntry>,
}

impl StudentLedger {
    fn entry(&self, date: NaiveDate) -> Option<&UsageLedgerEntry> {
        self.days.iter().find(|e| e.date == date)
    }

    fn entry_mut(&mut self, student_id: &str, date: NaiveDate) -> &mut UsageLedgerEntry {
        let pos = match self.days.iter().position(|e| e.date == date) {
            Some(pos) => pos,
            None => {
                let pos = self.days.partition_point(|e| e.date < date);
                self.days.insert(
                    pos,
                    UsageLedgerEntry {
                        student_id: student_id.to_string(),
                        date,
                        used_seconds: 0,
                        last_heartbeat_at: None,
                        bonus_seconds: 0,
                    },
                );
                pos
            }
        };
        &mut self.days[pos]
    }

    fn prune(&mut self) {
        if self.days.len() > HISTORY_RETENTION_DAYS {
            let excess = self.days.len() - HISTORY_RETENTION_DAYS;
            self.days.drain(..excess);
        }
    }
}

/// Per-student, per-day cumulative usage ledger.
///
/// Heartbeats are deduplicated by spacing rather than by locking: a heartbeat
/// counts only if it is strictly newer than the last accepted one and at least
/// the minimum spacing after it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct UsageLedger {
    pub students: BTreeMap<String, StudentLedger>,
    #[serde(default)]
    pub audit: Vec<AuditRecord>,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a heartbeat and report today's standing.
    ///
    /// The interval `[observed_at - interval_seconds, observed_at)` is split at
    /// local midnights so each calendar day receives only its own share.
    ///
    /// Intervals outside `0..=SECONDS_PER_DAY` are rejected before anything is recorded.
    pub fn heartbeat(
        &mut self,
        heartbeat: &Heartbeat,
        policy: &GuardianPolicy,
        min_spacing_seconds: i64,
    ) -> Result<HeartbeatReceipt> {
        let offset = policy.offset();
        let student_id = heartbeat.student_id.as_str();
        let observed_at = heartbeat.observed_at;
        let interval = heartbeat.interval_seconds;

        let window_start = (0..=SECONDS_PER_DAY)
            .contains(&interval)
            .then(|| TimeDelta::try_seconds(interval))
            .flatten()
            .and_then(|span| observed_at.checked_sub_signed(span))
            .ok_or_else(|| {
                FocusError::InvalidHeartbeat(format!(
                    "interval_seconds must be between 0 and {} (got {})",
                    SECONDS_PER_DAY, interval
                ))
            })?;

        let ledger = self.students.entry(student_id.to_string()).or_default();

        let accepted = match ledger.last_heartbeat_at {
            None => true,
            Some(last) => observed_at > last && (observed_at - last).num_seconds() >= min_spacing_seconds,
        };

        if accepted {
            let mut cursor = window_start;

            while cursor < observed_at {
                let date = cursor.with_timezone(&offset).date_naive();
                let segment_end = next_local_midnight(cursor, offset)
                    .map(|midnight| midnight.min(observed_at))
                    .unwrap_or(observed_at);

                let entry = ledger.entry_mut(student_id, date);
                entry.used_seconds += (segment_end - cursor).num_seconds();
                entry.last_heartbeat_at = Some(observed_at);
                cursor = segment_end;
            }

            // A new day's entry exists from its first heartbeat, even one that adds nothing
            let today = observed_at.with_timezone(&offset).date_naive();
            ledger.entry_mut(student_id, today).last_heartbeat_at = Some(observed_at);
            ledger.last_heartbeat_at = Some(observed_at);
            ledger.prune();

            debug!(
                "Counted {}s heartbeat for {} at {}",
                interval, student_id, observed_at
            );
        } else {
            debug!(
                "Acknowledged heartbeat for {} at {} without counting (last accepted {:?})",
                student_id, observed_at, ledger.last_heartbeat_at
            );
        }

        let summary = self.summary(student_id, observed_at, policy);
        Ok(HeartbeatReceipt {
            counted: accepted,
            ..HeartbeatReceipt::from(&summary)
        })
    }

    /// Usage for the local day containing `at`.
    ///
    /// `limit_reached` is derived from the policy passed in, so a lowered limit
    /// applies to the next query without touching stored entries.
    pub fn summary(&self, student_id: &str, at: DateTime<Utc>, policy: &GuardianPolicy) -> UsageSummary {
        let date = policy.local_time(at).date_naive();
        let (used_seconds, bonus_seconds) = self
            .students
            .get(student_id)
            .and_then(|ledger| ledger.entry(date))
            .map(|entry| (entry.used_seconds, entry.bonus_seconds))
            .unwrap_or((0, 0));

        UsageSummary {
            student_id: student_id.to_string(),
            date,
            used_seconds,
            bonus_seconds,
            limit_seconds: policy.daily_limit_seconds,
            remaining_seconds: ScheduleCalculator::remaining_seconds(policy, used_seconds, bonus_seconds),
            limit_reached: ScheduleCalculator::is_limit_reached(policy, used_seconds, bonus_seconds),
        }
    }

    /// Zero today's usage. Requires a guardian identity verified upstream.
    ///
    /// Earlier days are untouched and the reset itself is kept in the audit log.
    pub fn reset_today(
        &mut self,
        student_id: &str,
        authorized_by: &str,
        at: DateTime<Utc>,
        policy: &GuardianPolicy,
    ) -> Result<AuditRecord> {
        require_authority(authorized_by)?;

        let date = policy.local_time(at).date_naive();
        let entry = self
            .students
            .entry(student_id.to_string())
            .or_default()
            .entry_mut(student_id, date);

        let record = AuditRecord {
            student_id: student_id.to_string(),
            kind: AuditKind::Reset,
            date,
            used_seconds_before: entry.used_seconds,
            seconds: None,
            authorized_by: authorized_by.to_string(),
            at,
        };
        entry.used_seconds = 0;

        info!(
            "Reset usage for {} on {} ({}s cleared) by {}",
            student_id, date, record.used_seconds_before, authorized_by
        );
        self.audit.push(record.clone());
        Ok(record)
    }

    /// Grant extra time for today
    pub fn grant_extension(
        &mut self,
        student_id: &str,
        seconds: i64,
        authorized_by: &str,
        at: DateTime<Utc>,
        policy: &GuardianPolicy,
    ) -> Result<AuditRecord> {
        require_authority(authorized_by)?;
        if !(1..=SECONDS_PER_DAY).contains(&seconds) {
            return Err(FocusError::InvalidState {
                action: "grant an extension",
                state: format!("{}s requested, allowed 1..={}", seconds, SECONDS_PER_DAY),
            });
        }

        let date = policy.local_time(at).date_naive();
        let entry = self
            .students
            .entry(student_id.to_string())
            .or_default()
            .entry_mut(student_id, date);
        entry.bonus_seconds = entry.bonus_seconds.saturating_add(seconds);

        let record = AuditRecord {
            student_id: student_id.to_string(),
            kind: AuditKind::Extension,
            date,
            used_seconds_before: entry.used_seconds,
            seconds: Some(seconds),
            authorized_by: authorized_by.to_string(),
            at,
        };

        info!("Granted {}s extension to {} on {} by {}", seconds, student_id, date, authorized_by);
        self.audit.push(record.clone());
        Ok(record)
    }

    /// Daily entries for a student, most recent first
    pub fn history(&self, student_id: &str, days: usize) -> Vec<&UsageLedgerEntry> {
        self.students
            .get(student_id)
            .map(|ledger| ledger.days.iter().rev().take(days).collect())
            .unwrap_or_default()
    }

    /// Audit records for a student, oldest first
    pub fn audit_for(&self, student_id: &str) -> Vec<&AuditRecord> {
        self.audit.iter().filter(|r| r.student_id == student_id).collect()
    }
}

fn require_authority(authorized_by: &str) -> Result<()> {
    if authorized_by.trim().is_empty() {
        return Err(FocusError::PinRequired);
    }
    Ok(())
}

/// The first local midnight strictly after `at`, as a UTC instant
fn next_local_midnight(at: DateTime<Utc>, offset: FixedOffset) -> Option<DateTime<Utc>> {
    at.with_timezone(&offset)
        .date_naive()
        .succ_opt()?
        .and_hms_opt(0, 0, 0)?
        .and_local_timezone(offset)
        .single()
        .map(|midnight| midnight.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPACING: i64 = 10;

    fn at(text: &str) -> DateTime<Utc> {
        text.parse().unwrap()
    }

    fn beat(observed_at: &str, interval_seconds: i64) -> Heartbeat {
        Heartbeat {
            student_id: "kid1".to_string(),
            observed_at: at(observed_at),
            interval_seconds,
        }
    }

    fn date(text: &str) -> NaiveDate {
        text.parse().unwrap()
    }

    #[test]
    fn test_spaced_heartbeats_sum_exactly() {
        let policy = GuardianPolicy::with_daily_limit(7200);
        let mut ledger = UsageLedger::new();
        let start = at("2025-11-17T10:00:00Z");

        let mut expected = 0;
        for i in 0..20 {
            let interval = 10 + (i % 3) * 5;
            expected += interval;
            let hb = Heartbeat {
                student_id: "kid1".to_string(),
                observed_at: start + chrono::Duration::seconds(15 * (i + 1)),
                interval_seconds: interval,
            };
            assert!(ledger.heartbeat(&hb, &policy, SPACING).unwrap().counted);
        }

        let summary = ledger.summary("kid1", start, &policy);
        assert_eq!(summary.used_seconds, expected);
    }

    #[test]
    fn test_redelivered_heartbeat_counts_once() {
        let policy = GuardianPolicy::with_daily_limit(7200);
        let mut ledger = UsageLedger::new();

        let first = ledger.heartbeat(&beat("2025-11-17T10:00:15Z", 15), &policy, SPACING).unwrap();
        let retry = ledger.heartbeat(&beat("2025-11-17T10:00:15Z", 15), &policy, SPACING).unwrap();

        assert!(first.counted);
        assert!(!retry.counted);
        assert_eq!(retry.used_seconds_today, 15);
    }

    #[test]
    fn test_heartbeat_inside_spacing_not_counted() {
        let policy = GuardianPolicy::with_daily_limit(7200);
        let mut ledger = UsageLedger::new();

        ledger.heartbeat(&beat("2025-11-17T10:00:15Z", 15), &policy, SPACING).unwrap();
        let early = ledger.heartbeat(&beat("2025-11-17T10:00:20Z", 15), &policy, SPACING).unwrap();
        assert!(!early.counted);
        assert_eq!(early.used_seconds_today, 15);

        let on_time = ledger.heartbeat(&beat("2025-11-17T10:00:25Z", 15), &policy, SPACING).unwrap();
        assert!(on_time.counted);
        assert_eq!(on_time.used_seconds_today, 30);
    }

    #[test]
    fn test_replayed_older_heartbeat_not_counted() {
        let policy = GuardianPolicy::with_daily_limit(7200);
        let mut ledger = UsageLedger::new();

        ledger.heartbeat(&beat("2025-11-17T10:05:00Z", 15), &policy, SPACING).unwrap();
        let replay = ledger.heartbeat(&beat("2025-11-17T10:00:00Z", 15), &policy, SPACING).unwrap();
        assert!(!replay.counted);
    }

    #[test]
    fn test_limit_example() {
        let policy = GuardianPolicy::with_daily_limit(1800);
        let mut ledger = UsageLedger::new();

        let receipt = ledger.heartbeat(&beat("2025-11-17T10:30:00Z", 1750), &policy, SPACING).unwrap();
        assert_eq!(receipt.used_seconds_today, 1750);
        assert_eq!(receipt.remaining_seconds, 50);
        assert!(!receipt.limit_reached);

        let receipt = ledger.heartbeat(&beat("2025-11-17T10:31:00Z", 60), &policy, SPACING).unwrap();
        assert_eq!(receipt.used_seconds_today, 1810);
        assert_eq!(receipt.remaining_seconds, 0);
        assert!(receipt.limit_reached);
    }

    #[test]
    fn test_lowered_limit_applies_on_next_query() {
        let mut policy = GuardianPolicy::with_daily_limit(3600);
        let mut ledger = UsageLedger::new();

        let receipt = ledger.heartbeat(&beat("2025-11-17T10:30:00Z", 1200), &policy, SPACING).unwrap();
        assert!(!receipt.limit_reached);

        policy.daily_limit_seconds = 1200;
        let receipt = ledger.heartbeat(&beat("2025-11-17T10:30:15Z", 15), &policy, SPACING).unwrap();
        assert!(receipt.limit_reached);
    }

    #[test]
    fn test_midnight_split() {
        let policy = GuardianPolicy::with_daily_limit(7200);
        let mut ledger = UsageLedger::new();

        ledger.heartbeat(&beat("2025-11-17T23:59:50Z", 15), &policy, SPACING).unwrap();
        ledger.heartbeat(&beat("2025-11-18T00:00:05Z", 15), &policy, SPACING).unwrap();

        let history = ledger.history("kid1", 7);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].date, date("2025-11-18"));
        assert_eq!(history[0].used_seconds, 5);
        assert_eq!(history[1].date, date("2025-11-17"));
        assert_eq!(history[1].used_seconds, 25);
        assert_eq!(history[0].used_seconds + history[1].used_seconds, 30);
    }

    #[test]
    fn test_midnight_split_uses_student_timezone() {
        let mut policy = GuardianPolicy::with_daily_limit(7200);
        policy.utc_offset_minutes = 60;
        let mut ledger = UsageLedger::new();

        // 23:00:10Z is 00:00:10 on the 18th at UTC+1
        ledger.heartbeat(&beat("2025-11-17T23:00:10Z", 30), &policy, SPACING).unwrap();

        let history = ledger.history("kid1", 7);
        assert_eq!(history[0].date, date("2025-11-18"));
        assert_eq!(history[0].used_seconds, 10);
        assert_eq!(history[1].date, date("2025-11-17"));
        assert_eq!(history[1].used_seconds, 20);
    }

    #[test]
    fn test_heartbeat_at_midnight_opens_empty_day() {
        let policy = GuardianPolicy::with_daily_limit(7200);
        let mut ledger = UsageLedger::new();

        let receipt = ledger.heartbeat(&beat("2025-11-18T00:00:00Z", 15), &policy, SPACING).unwrap();
        assert_eq!(receipt.used_seconds_today, 0);

        let history = ledger.history("kid1", 7);
        assert_eq!(history[0].date, date("2025-11-18"));
        assert_eq!(history[0].used_seconds, 0);
        assert_eq!(history[1].used_seconds, 15);
    }

    #[test]
    fn test_out_of_range_interval_rejected() {
        let policy = GuardianPolicy::with_daily_limit(7200);
        let mut ledger = UsageLedger::new();

        for interval in [-30, SECONDS_PER_DAY + 1, i64::MAX, i64::MIN] {
            let result = ledger.heartbeat(&beat("2025-11-17T10:00:00Z", interval), &policy, SPACING);
            assert!(matches!(result, Err(FocusError::InvalidHeartbeat(_))), "interval {}", interval);
        }
        assert!(ledger.students.is_empty());

        // The same instant is still accepted with a sane interval
        let receipt = ledger.heartbeat(&beat("2025-11-17T10:00:00Z", 15), &policy, SPACING).unwrap();
        assert!(receipt.counted);
        assert_eq!(receipt.used_seconds_today, 15);
    }

    #[test]
    fn test_full_day_interval_spans_midnight() {
        let policy = GuardianPolicy::with_daily_limit(7200);
        let mut ledger = UsageLedger::new();

        let receipt = ledger
            .heartbeat(&beat("2025-11-17T06:00:00Z", SECONDS_PER_DAY), &policy, SPACING)
            .unwrap();
        assert_eq!(receipt.used_seconds_today, 6 * 3600);

        let history = ledger.history("kid1", 7);
        assert_eq!(history[1].date, date("2025-11-16"));
        assert_eq!(history[1].used_seconds, 18 * 3600);
    }

    #[test]
    fn test_reset_today_is_audited_and_keeps_history() {
        let policy = GuardianPolicy::with_daily_limit(7200);
        let mut ledger = UsageLedger::new();

        ledger.heartbeat(&beat("2025-11-16T12:00:00Z", 600), &policy, SPACING).unwrap();
        ledger.heartbeat(&beat("2025-11-17T12:00:00Z", 900), &policy, SPACING).unwrap();

        let record = ledger
            .reset_today("kid1", "parent", at("2025-11-17T13:00:00Z"), &policy)
            .unwrap();
        assert_eq!(record.used_seconds_before, 900);
        assert_eq!(record.kind, AuditKind::Reset);

        let history = ledger.history("kid1", 7);
        assert_eq!(history[0].used_seconds, 0);
        assert_eq!(history[1].used_seconds, 600);
        assert_eq!(ledger.audit_for("kid1").len(), 1);
    }

    #[test]
    fn test_reset_requires_authority() {
        let policy = GuardianPolicy::with_daily_limit(7200);
        let mut ledger = UsageLedger::new();
        let result = ledger.reset_today("kid1", "  ", at("2025-11-17T13:00:00Z"), &policy);
        assert_eq!(result, Err(FocusError::PinRequired));
        assert!(ledger.audit.is_empty());
    }

    #[test]
    fn test_heartbeats_continue_after_reset() {
        let policy = GuardianPolicy::with_daily_limit(7200);
        let mut ledger = UsageLedger::new();

        ledger.heartbeat(&beat("2025-11-17T12:00:00Z", 900), &policy, SPACING).unwrap();
        ledger
            .reset_today("kid1", "parent", at("2025-11-17T12:00:05Z"), &policy)
            .unwrap();
        let receipt = ledger.heartbeat(&beat("2025-11-17T12:00:15Z", 15), &policy, SPACING).unwrap();
        assert_eq!(receipt.used_seconds_today, 15);
    }

    #[test]
    fn test_extension_raises_effective_limit() {
        let policy = GuardianPolicy::with_daily_limit(1800);
        let mut ledger = UsageLedger::new();

        let receipt = ledger.heartbeat(&beat("2025-11-17T12:00:00Z", 1800), &policy, SPACING).unwrap();
        assert!(receipt.limit_reached);

        ledger
            .grant_extension("kid1", 600, "parent", at("2025-11-17T12:00:05Z"), &policy)
            .unwrap();
        let summary = ledger.summary("kid1", at("2025-11-17T12:00:05Z"), &policy);
        assert!(!summary.limit_reached);
        assert_eq!(summary.remaining_seconds, 600);
        assert_eq!(summary.bonus_seconds, 600);
    }

    #[test]
    fn test_extension_rejects_non_positive() {
        let policy = GuardianPolicy::with_daily_limit(1800);
        let mut ledger = UsageLedger::new();
        assert!(ledger
            .grant_extension("kid1", 0, "parent", at("2025-11-17T12:00:05Z"), &policy)
            .is_err());
        assert!(ledger
            .grant_extension("kid1", i64::MAX, "parent", at("2025-11-17T12:00:05Z"), &policy)
            .is_err());
        assert!(ledger.audit.is_empty());
    }

    #[test]
    fn test_history_retention() {
        let policy = GuardianPolicy::with_daily_limit(7200);
        let mut ledger = UsageLedger::new();
        let start = at("2025-01-01T12:00:00Z");

        for day in 0..100 {
            let hb = Heartbeat {
                student_id: "kid1".to_string(),
                observed_at: start + chrono::Duration::days(day),
                interval_seconds: 60,
            };
            ledger.heartbeat(&hb, &policy, SPACING).unwrap();
        }

        assert_eq!(ledger.students["kid1"].days.len(), HISTORY_RETENTION_DAYS);
        assert_eq!(ledger.history("kid1", 1)[0].date, date("2025-04-10"));
    }
}
