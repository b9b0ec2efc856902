//! Focus session controller.
//!
//! One controller supervises one student. Host signals (visibility, input focus,
//! display mode) and timer callbacks all arrive on a single queue and are handled
//! one at a time through `&mut self`, so back-to-back events always resolve to a
//! single deterministic next state. Every timer event carries the generation it
//! was scheduled in; events from an earlier generation are dropped.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{FocusError, Result};
use crate::focus::auth::Pin;
use crate::focus::backend::FocusBackend;
use crate::focus::config::EngineSettings;
use crate::focus::devices::{self, ResourceSet};
use crate::focus::heartbeat::{FlushReport, HeartbeatOutbox, RetryBackoff};
use crate::focus::ledger::Heartbeat;
use crate::focus::overrides::{self, OverrideIntent, OverrideProtocol, OverrideReason, OverrideRequest};
use crate::focus::policy::GuardianPolicy;
use crate::focus::schedule::{Denial, ScheduleCalculator};
use crate::focus::session::{
    FocusSession, Protection, Resolution, SessionEvent, SessionState, TerminationCause, Transition, ViolationKind,
};

/// Signals from the host environment (browser tab, window manager, UI shell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HostSignal {
    VisibilityHidden,
    VisibilityVisible,
    FocusLost,
    FocusGained,
    DisplayModeExited,
    DisplayModeEntered,
    Unmounted,
}

/// What the controller tells the surrounding UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "notice", rename_all = "snake_case")]
pub enum SessionNotice {
    Started { session_id: Uuid, unprotected: bool },
    Denied {
        reason: Denial,
        /// When the next allowed window opens, for `OutsideWindow`
        next_window: Option<DateTime<Utc>>,
    },
    Unprotected { resource: String, reason: String },
    Violation { kind: ViolationKind, count: u32 },
    Returned,
    OverrideRequired { reason: OverrideReason },
    Resumed,
    PinRejected { attempts_remaining: u32 },
    PinLockedOut { until: DateTime<Utc> },
    HeartbeatDelayed { pending: usize, error: String },
    /// The service refused a heartbeat; its seconds are not counted
    HeartbeatRejected { interval_seconds: i64, error: String },
    Terminated { cause: TerminationCause },
}

pub type NoticeHandler = Box<dyn FnMut(&SessionNotice) + Send>;

#[derive(Debug)]
enum ControllerEvent {
    Host(HostSignal),
    HeartbeatDue { generation: u64 },
    RetryDue { generation: u64 },
    FocusLossSettled { generation: u64, sequence: u64 },
    GraceExpired { generation: u64, violation: u32 },
}

/// Handle for feeding host signals into a controller's queue
#[derive(Clone)]
pub struct SignalSender {
    tx: UnboundedSender<ControllerEvent>,
}

impl SignalSender {
    /// Queue a signal; false once the controller is gone
    pub fn send(&self, signal: HostSignal) -> bool {
        self.tx.send(ControllerEvent::Host(signal)).is_ok()
    }
}

/// Students with a session in progress, shared by all controllers in a process
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    active: Arc<Mutex<HashSet<String>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn claim(&self, student_id: &str) -> Result<()> {
        let mut active = self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !active.insert(student_id.to_string()) {
            return Err(FocusError::SessionAlreadyActive(student_id.to_string()));
        }
        Ok(())
    }

    fn release(&self, student_id: &str) {
        let mut active = self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        active.remove(student_id);
    }

    pub fn is_active(&self, student_id: &str) -> bool {
        let active = self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        active.contains(student_id)
    }
}

/// Wall-clock time derived from the monotonic clock, so timestamps stay ordered
/// even if the system clock is changed mid-session
#[derive(Debug, Clone, Copy)]
struct SessionClock {
    origin_utc: DateTime<Utc>,
    origin: Instant,
}

impl SessionClock {
    fn starting_at(origin_utc: DateTime<Utc>) -> Self {
        Self {
            origin_utc,
            origin: Instant::now(),
        }
    }

    fn at(&self, instant: Instant) -> DateTime<Utc> {
        let elapsed = instant.saturating_duration_since(self.origin);
        self.origin_utc + chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero())
    }

    fn now(&self) -> DateTime<Utc> {
        self.at(Instant::now())
    }
}

/// Timer tasks owned by the current session; aborted on cancel and on drop
#[derive(Default)]
struct SessionTimers {
    heartbeat: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
    focus_loss: Option<JoinHandle<()>>,
    grace: Option<JoinHandle<()>>,
}

impl SessionTimers {
    fn replace(slot: &mut Option<JoinHandle<()>>, handle: JoinHandle<()>) {
        Self::cancel(slot);
        *slot = Some(handle);
    }

    fn cancel(slot: &mut Option<JoinHandle<()>>) {
        if let Some(handle) = slot.take() {
            handle.abort();
        }
    }

    fn cancel_all(&mut self) {
        Self::cancel(&mut self.heartbeat);
        Self::cancel(&mut self.retry);
        Self::cancel(&mut self.focus_loss);
        Self::cancel(&mut self.grace);
    }
}

impl Drop for SessionTimers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Presence {
    hidden: bool,
    unfocused: bool,
    display_exited: bool,
}

impl Presence {
    fn is_present(&self) -> bool {
        !(self.hidden || self.unfocused || self.display_exited)
    }
}

pub struct FocusController {
    student_id: String,
    course_id: Option<String>,
    backend: Arc<dyn FocusBackend>,
    resources: ResourceSet,
    settings: EngineSettings,
    registry: SessionRegistry,
    clock: SessionClock,
    session: Option<FocusSession>,
    policy: Option<GuardianPolicy>,
    overrides: OverrideProtocol,
    outbox: HeartbeatOutbox,
    timers: SessionTimers,
    presence: Presence,
    generation: u64,
    focus_loss_sequence: u64,
    accrual_mark: Option<Instant>,
    /// `observed_at` of the newest heartbeat queued by this controller
    last_stamp: Option<DateTime<Utc>>,
    notice_handler: Option<NoticeHandler>,
    tx: UnboundedSender<ControllerEvent>,
    rx: UnboundedReceiver<ControllerEvent>,
}

impl FocusController {
    /// Create a controller. Must be used from within a Tokio runtime.
    pub fn new(
        student_id: impl Into<String>,
        backend: Arc<dyn FocusBackend>,
        resources: ResourceSet,
        settings: EngineSettings,
        registry: SessionRegistry,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let outbox = HeartbeatOutbox::new(RetryBackoff::from_settings(&settings.heartbeat));

        Self {
            student_id: student_id.into(),
            course_id: None,
            backend,
            resources,
            settings,
            registry,
            clock: SessionClock::starting_at(Utc::now()),
            session: None,
            policy: None,
            overrides: OverrideProtocol::new(),
            outbox,
            timers: SessionTimers::default(),
            presence: Presence::default(),
            generation: 0,
            focus_loss_sequence: 0,
            accrual_mark: None,
            last_stamp: None,
            notice_handler: None,
            tx,
            rx,
        }
    }

    pub fn with_course(mut self, course_id: impl Into<String>) -> Self {
        self.course_id = Some(course_id.into());
        self
    }

    /// Anchor the controller's wall clock at `origin` (from now on it advances monotonically)
    pub fn with_clock_origin(mut self, origin: DateTime<Utc>) -> Self {
        self.clock = SessionClock::starting_at(origin);
        self
    }

    pub fn on_notice(&mut self, handler: impl FnMut(&SessionNotice) + Send + 'static) {
        self.notice_handler = Some(Box::new(handler));
    }

    pub fn signal_sender(&self) -> SignalSender {
        SignalSender { tx: self.tx.clone() }
    }

    pub fn student_id(&self) -> &str {
        &self.student_id
    }

    pub fn session(&self) -> Option<&FocusSession> {
        self.session.as_ref()
    }

    pub fn state(&self) -> SessionState {
        self.session.as_ref().map_or(SessionState::Idle, |s| s.state)
    }

    pub fn pending_override(&self) -> Option<&OverrideRequest> {
        self.overrides.pending()
    }

    /// Heartbeats waiting for delivery
    pub fn buffered_heartbeats(&self) -> usize {
        self.outbox.len()
    }

    /// Request a focus session.
    ///
    /// Admission is evaluated here and only here. On denial the session returns
    /// to `Idle` and the specific reason is returned as `PolicyDenied`.
    pub fn start_focus(&mut self) -> Result<Uuid> {
        if self.state().holds_slot() {
            return Err(FocusError::SessionAlreadyActive(self.student_id.clone()));
        }
        self.registry.claim(&self.student_id)?;

        let now = self.clock.now();
        self.session = Some(FocusSession::new(self.student_id.clone(), self.course_id.clone(), now));
        self.presence = Presence::default();
        self.overrides.clear();
        self.apply(SessionEvent::StartRequested);

        // Heartbeats left over from an earlier session go out first
        self.flush_heartbeats(true);

        let evaluated = self.backend.policy(&self.student_id).and_then(|policy| {
            let usage = self.backend.usage(&self.student_id, now)?;
            let admission =
                ScheduleCalculator::can_start_session(&policy, now, usage.used_seconds, usage.bonus_seconds);
            Ok((admission, policy))
        });

        let (admission, policy) = match evaluated {
            Ok(evaluated) => evaluated,
            Err(e) => {
                warn!("Could not evaluate admission for {}: {}", self.student_id, e);
                self.teardown(TerminationCause::Error(e.to_string()));
                return Err(e);
            }
        };

        if let Some(denial) = admission.denial() {
            let next_window = match denial {
                Denial::OutsideWindow => ScheduleCalculator::next_window_start(&policy, now),
                Denial::LimitExhausted => None,
            };
            info!(
                "Focus session for {} denied: {} (next window {:?})",
                self.student_id, denial, next_window
            );
            self.apply(SessionEvent::Denied(denial));
            self.registry.release(&self.student_id);
            self.notify(SessionNotice::Denied {
                reason: denial,
                next_window,
            });
            return Err(FocusError::PolicyDenied(denial));
        }

        self.generation += 1;
        self.apply(SessionEvent::Admitted);

        let protection = if policy.focus_enabled {
            self.acquire_resources()
        } else {
            info!("Supervision disabled for {}; accounting time only", self.student_id);
            Protection::default()
        };

        let session_id = match self.session.as_mut() {
            Some(session) => {
                session.protection = protection;
                session.id
            }
            None => return Err(FocusError::InvalidState {
                action: "start a session",
                state: "missing".to_string(),
            }),
        };

        self.policy = Some(policy);
        self.accrual_mark = Some(Instant::now());
        self.start_heartbeat_loop();
        self.notify(SessionNotice::Started {
            session_id,
            unprotected: protection.is_unprotected(),
        });

        Ok(session_id)
    }

    /// End the session early. Needs the guardian PIN unless the settings waive it.
    ///
    /// Resources are released on success; a rejected PIN leaves the session as it was.
    pub fn stop_focus(&mut self, pin: Option<&Pin>) -> Result<()> {
        let state = self.state();
        if !state.is_live() {
            return Err(FocusError::InvalidState {
                action: "stop the session",
                state: state.to_string(),
            });
        }

        if self.settings.pin.require_pin_to_exit {
            let pin = pin.ok_or(FocusError::PinRequired)?;
            let now = self.clock.now();
            let authorized = overrides::authorize(
                self.backend.as_ref(),
                &self.student_id,
                pin,
                OverrideIntent::ExitFocus,
                now,
            )
            .and_then(|outcome| outcome.into_result());

            if let Err(e) = authorized {
                self.notify_pin_failure(&e);
                return Err(e);
            }
        }

        self.teardown(TerminationCause::Stopped);
        Ok(())
    }

    /// Resolve a pending override with the guardian PIN and an intent
    pub fn resolve_override(&mut self, pin: &Pin, intent: OverrideIntent) -> Result<SessionState> {
        let state = self.state();
        if state != SessionState::Paused {
            return Err(FocusError::InvalidState {
                action: "resolve an override",
                state: state.to_string(),
            });
        }

        let now = self.clock.now();
        let outcome = self
            .overrides
            .verify(self.backend.as_ref(), &self.student_id, pin, intent, now)?;

        let intent = match outcome.into_result() {
            Ok(intent) => intent,
            Err(e) => {
                self.notify_pin_failure(&e);
                return Err(e);
            }
        };

        match intent {
            OverrideIntent::ExitFocus => self.teardown(TerminationCause::GuardianExit),
            OverrideIntent::Resume | OverrideIntent::ExtendTime { .. } => self.resume(),
        }

        Ok(self.state())
    }

    /// The guardian dismissed the PIN prompt; the session stays paused
    pub fn cancel_override(&mut self) -> Result<()> {
        self.overrides.cancel()
    }

    /// Guardian-initiated pause
    pub fn request_pause(&mut self) -> Result<()> {
        let state = self.state();
        if !matches!(state, SessionState::Active | SessionState::Violated) {
            return Err(FocusError::InvalidState {
                action: "pause",
                state: state.to_string(),
            });
        }

        self.apply(SessionEvent::GuardianPause);
        self.enter_pause(OverrideReason::GuardianPause);
        Ok(())
    }

    /// Terminate after an unrecoverable error. Resources are still released.
    pub fn abort(&mut self, reason: impl Into<String>) {
        self.teardown(TerminationCause::Error(reason.into()));
    }

    /// Queue a host signal and handle everything queued so far, in order
    pub fn dispatch(&mut self, signal: HostSignal) {
        // The controller owns a sender, so the queue cannot be closed here
        let _ = self.tx.send(ControllerEvent::Host(signal));
        self.process_pending();
    }

    /// Wait for the next event and handle it. Cancel-safe.
    pub async fn process_next(&mut self) -> bool {
        match self.rx.recv().await {
            Some(event) => {
                self.handle(event);
                true
            }
            None => false,
        }
    }

    /// Handle every event already queued; returns how many were handled
    pub fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.rx.try_recv() {
            self.handle(event);
            handled += 1;
        }
        handled
    }

    /// Process events until the session leaves its live states
    pub async fn run_until_finished(&mut self) {
        while self.state().is_live() {
            if !self.process_next().await {
                break;
            }
        }
    }

    fn handle(&mut self, event: ControllerEvent) {
        match event {
            ControllerEvent::Host(signal) => self.on_signal(signal),
            ControllerEvent::HeartbeatDue { generation } if generation == self.generation => self.on_heartbeat_due(),
            ControllerEvent::RetryDue { generation } if generation == self.generation => {
                self.timers.retry = None;
                self.flush_heartbeats(false);
            }
            ControllerEvent::FocusLossSettled { generation, sequence } if generation == self.generation => {
                if sequence == self.focus_loss_sequence && self.presence.unfocused {
                    self.detect_violation(ViolationKind::FocusLost);
                }
            }
            ControllerEvent::GraceExpired { generation, violation } if generation == self.generation => {
                self.on_grace_expired(violation)
            }
            stale => debug!("Dropping stale timer event {:?}", stale),
        }
    }

    fn on_signal(&mut self, signal: HostSignal) {
        debug!("Host signal {:?} in state {}", signal, self.state());

        match signal {
            HostSignal::VisibilityHidden => {
                self.presence.hidden = true;
                self.detect_violation(ViolationKind::VisibilityHidden);
            }
            HostSignal::FocusLost => {
                self.presence.unfocused = true;
                self.focus_loss_sequence += 1;
                let debounce = self.settings.violations.debounce();
                if debounce.is_zero() {
                    self.detect_violation(ViolationKind::FocusLost);
                } else if self.state().is_live() {
                    let event = ControllerEvent::FocusLossSettled {
                        generation: self.generation,
                        sequence: self.focus_loss_sequence,
                    };
                    let handle = self.schedule(debounce, event);
                    SessionTimers::replace(&mut self.timers.focus_loss, handle);
                }
            }
            HostSignal::DisplayModeExited => {
                let held = self.session.as_ref().is_some_and(|s| s.protection.display);
                if held {
                    self.presence.display_exited = true;
                    self.detect_violation(ViolationKind::DisplayModeExited);
                } else {
                    debug!("Display mode exit ignored; exclusive display was never held");
                }
            }
            HostSignal::VisibilityVisible => {
                self.presence.hidden = false;
                self.check_return();
            }
            HostSignal::FocusGained => {
                self.presence.unfocused = false;
                self.focus_loss_sequence += 1;
                SessionTimers::cancel(&mut self.timers.focus_loss);
                self.check_return();
            }
            HostSignal::DisplayModeEntered => {
                self.presence.display_exited = false;
                self.check_return();
            }
            HostSignal::Unmounted => self.teardown(TerminationCause::Unmounted),
        }
    }

    fn supervising(&self) -> bool {
        self.policy.as_ref().is_some_and(|p| p.focus_enabled)
    }

    fn detect_violation(&mut self, kind: ViolationKind) {
        if !self.supervising() || self.state() != SessionState::Active {
            return;
        }
        if self.apply(SessionEvent::ViolationDetected(kind)).is_none() {
            return;
        }

        let count = self.session.as_ref().map_or(0, |s| s.violation_count);
        warn!("Violation #{} for {}: {:?}", count, self.student_id, kind);
        self.notify(SessionNotice::Violation { kind, count });

        match self.settings.violations.grace() {
            None => {}
            Some(grace) if grace.is_zero() => self.on_grace_expired(count),
            Some(grace) => {
                let event = ControllerEvent::GraceExpired {
                    generation: self.generation,
                    violation: count,
                };
                let handle = self.schedule(grace, event);
                SessionTimers::replace(&mut self.timers.grace, handle);
            }
        }
    }

    fn check_return(&mut self) {
        if self.state() != SessionState::Violated || !self.presence.is_present() {
            return;
        }
        if self.apply(SessionEvent::Returned).is_some() {
            SessionTimers::cancel(&mut self.timers.grace);
            info!("{} returned to the session", self.student_id);
            self.notify(SessionNotice::Returned);
        }
    }

    fn on_grace_expired(&mut self, violation: u32) {
        let current = self.session.as_ref().map_or(0, |s| s.violation_count);
        if self.state() != SessionState::Violated || current != violation {
            return;
        }
        if self.apply(SessionEvent::GraceExpired).is_some() {
            info!("Grace period expired for {}; guardian required", self.student_id);
            self.enter_pause(OverrideReason::Violation);
        }
    }

    fn enter_pause(&mut self, reason: OverrideReason) {
        SessionTimers::cancel(&mut self.timers.grace);
        SessionTimers::cancel(&mut self.timers.focus_loss);
        self.accrual_mark = None;
        let now = self.clock.now();
        self.overrides.request(reason, now);
        self.notify(SessionNotice::OverrideRequired { reason });
    }

    fn resume(&mut self) {
        if self.apply(SessionEvent::OverrideResolved(Resolution::Resume)).is_none() {
            return;
        }
        self.accrual_mark = Some(Instant::now());
        // Leaving exclusive display was part of what the guardian resolved
        self.presence.display_exited = false;
        self.notify(SessionNotice::Resumed);

        if self.presence.hidden {
            self.detect_violation(ViolationKind::VisibilityHidden);
        } else if self.presence.unfocused {
            self.detect_violation(ViolationKind::FocusLost);
        }
    }

    fn on_heartbeat_due(&mut self) {
        if !self.state().is_live() {
            return;
        }
        self.record_heartbeat(Instant::now());
        self.flush_heartbeats(false);
    }

    /// Queue a heartbeat for the whole seconds accrued since the last one.
    ///
    /// The service only counts heartbeats spaced at least `min_spacing_seconds`
    /// apart, so a short tail (at stop, or right after a restart) is stamped at
    /// the earliest instant it will be counted.
    fn record_heartbeat(&mut self, now: Instant) {
        let Some(mark) = self.accrual_mark else {
            return;
        };
        if !self.state().accrues_usage() {
            return;
        }

        let whole = now.saturating_duration_since(mark).as_secs();
        if whole == 0 {
            return;
        }
        let end = mark + Duration::from_secs(whole);
        self.accrual_mark = Some(end);

        let earliest = self.last_stamp.and_then(|last| {
            TimeDelta::try_seconds(self.settings.heartbeat.min_spacing_seconds)
                .and_then(|spacing| last.checked_add_signed(spacing))
        });
        let observed_at = match earliest {
            Some(earliest) => self.clock.at(end).max(earliest),
            None => self.clock.at(end),
        };
        self.last_stamp = Some(observed_at);

        self.outbox.push(Heartbeat {
            student_id: self.student_id.clone(),
            observed_at,
            interval_seconds: i64::try_from(whole).unwrap_or(i64::MAX),
        });
    }

    fn flush_heartbeats(&mut self, force: bool) {
        if self.outbox.is_empty() {
            return;
        }
        let report = self.outbox.flush(self.backend.as_ref(), Instant::now(), force);
        self.apply_report(report);
    }

    fn apply_report(&mut self, report: FlushReport) {
        self.count_delivered(&report);

        if let Some(error) = &report.error {
            self.notify(SessionNotice::HeartbeatDelayed {
                pending: report.pending,
                error: error.to_string(),
            });
            self.schedule_retry();
        }

        let Some(receipt) = report.receipt else {
            return;
        };

        if receipt.limit_reached && self.state().accrues_usage() {
            info!(
                "Daily limit reached for {} ({}s used); pausing",
                self.student_id, receipt.used_seconds_today
            );
            self.apply(SessionEvent::LimitReached);
            self.enter_pause(OverrideReason::TimeExhausted);
            return;
        }

        self.check_completion();
    }

    /// Add counted seconds to the session and report refused heartbeats
    fn count_delivered(&mut self, report: &FlushReport) {
        if let Some(session) = self.session.as_mut() {
            session.active_seconds += report.counted_seconds;
        }
        for (heartbeat, error) in &report.rejected {
            self.notify(SessionNotice::HeartbeatRejected {
                interval_seconds: heartbeat.interval_seconds,
                error: error.to_string(),
            });
        }
    }

    fn check_completion(&mut self) {
        let Some(target) = self.policy.as_ref().map(|p| p.default_session_seconds) else {
            return;
        };
        let done = self
            .session
            .as_ref()
            .is_some_and(|s| s.state == SessionState::Active && s.active_seconds >= target);
        if done {
            info!("Focus session for {} completed", self.student_id);
            self.teardown(TerminationCause::Completed);
        }
    }

    fn schedule_retry(&mut self) {
        if !self.state().is_live() {
            return;
        }
        if let Some(at) = self.outbox.next_attempt_at() {
            let delay = at.saturating_duration_since(Instant::now());
            let handle = self.schedule(delay, ControllerEvent::RetryDue {
                generation: self.generation,
            });
            SessionTimers::replace(&mut self.timers.retry, handle);
        }
    }

    fn acquire_resources(&mut self) -> Protection {
        let display = self.acquire_one(true);
        let sleep_lock = self.acquire_one(false);
        Protection { display, sleep_lock }
    }

    fn acquire_one(&mut self, display: bool) -> bool {
        let resource = if display {
            self.resources.display.as_mut()
        } else {
            self.resources.sleep_lock.as_mut()
        };

        match devices::acquire(resource) {
            Ok(()) => true,
            Err(FocusError::ResourceUnavailable { resource, reason }) => {
                warn!("Session for {} continues unprotected: {} unavailable ({})", self.student_id, resource, reason);
                self.notify(SessionNotice::Unprotected { resource, reason });
                false
            }
            Err(e) => {
                warn!("Session for {} continues unprotected: {}", self.student_id, e);
                false
            }
        }
    }

    fn start_heartbeat_loop(&mut self) {
        let tx = self.tx.clone();
        let generation = self.generation;
        let period = self.settings.heartbeat.interval();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if tx.send(ControllerEvent::HeartbeatDue { generation }).is_err() {
                    break;
                }
            }
        });
        SessionTimers::replace(&mut self.timers.heartbeat, handle);
    }

    fn schedule(&self, delay: Duration, event: ControllerEvent) -> JoinHandle<()> {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(event);
        })
    }

    /// Release everything and terminate. Runs on every exit path.
    fn teardown(&mut self, cause: TerminationCause) {
        let state = self.state();
        if !state.holds_slot() {
            return;
        }
        info!("Tearing down session for {} ({:?})", self.student_id, cause);

        self.timers.cancel_all();
        self.generation += 1;

        self.resources.display.release();
        self.resources.sleep_lock.release();

        self.record_heartbeat(Instant::now());
        if !self.outbox.is_empty() {
            let report = self.outbox.flush(self.backend.as_ref(), Instant::now(), true);
            self.count_delivered(&report);
            if let Some(error) = report.error {
                warn!(
                    "{} heartbeat(s) still buffered after teardown: {}",
                    report.pending, error
                );
                self.notify(SessionNotice::HeartbeatDelayed {
                    pending: report.pending,
                    error: error.to_string(),
                });
            }
        }

        let event = match (&cause, state) {
            (TerminationCause::GuardianExit, SessionState::Paused) => SessionEvent::OverrideResolved(Resolution::Exit),
            (TerminationCause::Completed, SessionState::Active) => SessionEvent::Completed,
            _ => SessionEvent::Stopped(cause.clone()),
        };
        self.apply(event);

        self.overrides.clear();
        self.accrual_mark = None;
        self.registry.release(&self.student_id);
        self.notify(SessionNotice::Terminated { cause });
    }

    fn apply(&mut self, event: SessionEvent) -> Option<Transition> {
        let now = self.clock.now();
        self.session.as_mut()?.apply(event, now)
    }

    fn notify_pin_failure(&mut self, error: &FocusError) {
        match error {
            FocusError::PinRejected { attempts_remaining } => self.notify(SessionNotice::PinRejected {
                attempts_remaining: *attempts_remaining,
            }),
            FocusError::PinLockedOut { until } => self.notify(SessionNotice::PinLockedOut { until: *until }),
            _ => {}
        }
    }

    fn notify(&mut self, notice: SessionNotice) {
        debug!("Notice for {}: {:?}", self.student_id, notice);
        if let Some(handler) = self.notice_handler.as_mut() {
            handler(&notice);
        }
    }
}

impl Drop for FocusController {
    fn drop(&mut self) {
        self.teardown(TerminationCause::Unmounted);
    }
}
