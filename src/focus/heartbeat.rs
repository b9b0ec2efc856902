use rand::Rng;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::FocusError;
use crate::focus::backend::FocusBackend;
use crate::focus::config::HeartbeatSettings;
use crate::focus::ledger::{Heartbeat, HeartbeatReceipt};

/// Exponential retry delay with random jitter
#[derive(Debug, Clone)]
pub struct RetryBackoff {
    base: Duration,
    max: Duration,
    jitter: Duration,
}

impl RetryBackoff {
    pub fn new(base: Duration, max: Duration, jitter: Duration) -> Self {
        Self { base, max, jitter }
    }

    pub fn from_settings(settings: &HeartbeatSettings) -> Self {
        Self::new(
            Duration::from_millis(settings.retry_base_ms),
            Duration::from_millis(settings.retry_max_ms),
            Duration::from_millis(settings.retry_jitter_ms),
        )
    }

    /// Delay before retry number `attempt` (1-based), capped at `max` before jitter
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        let delay = self.base.saturating_mul(factor).min(self.max);
        delay + self.random_jitter()
    }

    /// Random jitter in range [0, jitter]
    fn random_jitter(&self) -> Duration {
        let jitter_ms = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
        Duration::from_millis(jitter_ms)
    }
}

/// Result of one flush attempt
#[derive(Debug, Default)]
pub struct FlushReport {
    /// Receipt for the last heartbeat delivered in this flush
    pub receipt: Option<HeartbeatReceipt>,
    /// Sum of intervals the service counted in this flush
    pub counted_seconds: i64,
    pub delivered: usize,
    pub pending: usize,
    /// Delivery failure that stopped this flush; the heartbeat stays buffered
    pub error: Option<FocusError>,
    /// Heartbeats the service refused outright, dropped from the buffer
    pub rejected: Vec<(Heartbeat, FocusError)>,
}

/// Client-side buffer for heartbeats the service has not acknowledged yet.
///
/// Heartbeats are delivered in order; the first retryable failure stops the
/// flush and schedules the next attempt. A heartbeat that reached the service
/// but whose answer was lost is harmless to resend, because the service will
/// not count it twice. One the service refuses outright is dropped and reported.
pub struct HeartbeatOutbox {
    queue: VecDeque<Heartbeat>,
    backoff: RetryBackoff,
    failures: u32,
    next_attempt_at: Option<Instant>,
}

impl HeartbeatOutbox {
    pub fn new(backoff: RetryBackoff) -> Self {
        Self {
            queue: VecDeque::new(),
            backoff,
            failures: 0,
            next_attempt_at: None,
        }
    }

    pub fn push(&mut self, heartbeat: Heartbeat) {
        self.queue.push_back(heartbeat);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Whether a retry delay is still running at `now`
    pub fn is_backing_off(&self, now: Instant) -> bool {
        self.next_attempt_at.is_some_and(|at| now < at)
    }

    pub fn next_attempt_at(&self) -> Option<Instant> {
        self.next_attempt_at
    }

    /// Deliver buffered heartbeats oldest first.
    ///
    /// Does nothing while backing off unless `force` is set.
    pub fn flush(&mut self, backend: &dyn FocusBackend, now: Instant, force: bool) -> FlushReport {
        let mut report = FlushReport::default();

        if !force && self.is_backing_off(now) {
            report.pending = self.queue.len();
            return report;
        }

        while let Some(heartbeat) = self.queue.front() {
            match backend.heartbeat(heartbeat) {
                Ok(receipt) => {
                    if receipt.counted {
                        report.counted_seconds += heartbeat.interval_seconds.max(0);
                    }
                    debug!(
                        "Heartbeat delivered for {} ({}s used today, counted: {})",
                        heartbeat.student_id, receipt.used_seconds_today, receipt.counted
                    );
                    report.receipt = Some(receipt);
                    report.delivered += 1;
                    self.queue.pop_front();
                    self.failures = 0;
                    self.next_attempt_at = None;
                }
                Err(e) if !e.is_retryable() => {
                    warn!("Heartbeat for {} refused, dropping it: {}", heartbeat.student_id, e);
                    if let Some(heartbeat) = self.queue.pop_front() {
                        report.rejected.push((heartbeat, e));
                    }
                }
                Err(e) => {
                    self.failures += 1;
                    let delay = self.backoff.delay(self.failures);
                    self.next_attempt_at = Some(now + delay);
                    warn!(
                        "Heartbeat delivery failed (attempt {}), {} buffered, retrying in {}ms: {}",
                        self.failures,
                        self.queue.len(),
                        delay.as_millis(),
                        e
                    );
                    report.error = Some(e);
                    break;
                }
            }
        }

        report.pending = self.queue.len();
        report
    }
}
