//! Interactive focus session driven from stdin.
//!
//! Each input line is either a host signal (`hidden`, `visible`, `blur`,
//! `focus`, `exit-display`, `enter-display`) or a guardian action. End of input
//! unmounts the session.

use anyhow::{Context, Result};
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use focus_guard::focus::{
    FocusBackend, FocusController, HostSignal, LocalBackend, OverrideIntent, Pin, ResourceSet, SessionNotice,
    SessionRegistry,
};

use super::utils::format_seconds;
use super::Workspace;

const HELP: &str = "signals: hidden visible blur focus exit-display enter-display
guardian: pause | resume <pin> | extend <minutes> <pin> | exit <pin> | cancel | stop [pin]
other: status | help | quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionInput {
    Signal(HostSignal),
    Pause,
    Resolve { pin: Pin, intent: OverrideIntent },
    Cancel,
    Stop(Option<Pin>),
    Status,
    Help,
    Quit,
}

impl FromStr for SessionInput {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        let command = words.next().context("empty input")?;

        let input = match command {
            "hidden" => SessionInput::Signal(HostSignal::VisibilityHidden),
            "visible" => SessionInput::Signal(HostSignal::VisibilityVisible),
            "blur" => SessionInput::Signal(HostSignal::FocusLost),
            "focus" => SessionInput::Signal(HostSignal::FocusGained),
            "exit-display" => SessionInput::Signal(HostSignal::DisplayModeExited),
            "enter-display" => SessionInput::Signal(HostSignal::DisplayModeEntered),
            "pause" => SessionInput::Pause,
            "resume" => SessionInput::Resolve {
                pin: next_pin(&mut words)?,
                intent: OverrideIntent::Resume,
            },
            "exit" => SessionInput::Resolve {
                pin: next_pin(&mut words)?,
                intent: OverrideIntent::ExitFocus,
            },
            "cancel" => SessionInput::Cancel,
            "status" => SessionInput::Status,
            "help" => SessionInput::Help,
            "quit" => SessionInput::Quit,
            "extend" => {
                let minutes: i64 = words
                    .next()
                    .context("usage: extend <minutes> <pin>")?
                    .parse()
                    .context("minutes must be a number")?;
                let seconds = minutes
                    .checked_mul(60)
                    .filter(|seconds| *seconds > 0)
                    .context("minutes must be a positive number of minutes")?;
                SessionInput::Resolve {
                    pin: next_pin(&mut words)?,
                    intent: OverrideIntent::ExtendTime { seconds },
                }
            }
            "stop" => {
                let pin = words.next().map(Pin::from_str).transpose()?;
                SessionInput::Stop(pin)
            }
            other => anyhow::bail!("unknown input '{}' (try 'help')", other),
        };

        Ok(input)
    }
}

fn next_pin<'a>(words: &mut impl Iterator<Item = &'a str>) -> Result<Pin> {
    let raw = words.next().context("a guardian PIN is required")?;
    Ok(raw.parse()?)
}

pub fn run(workspace: &Workspace, student: &str, course: Option<String>) -> Result<()> {
    let service = workspace.open_service()?;
    let backend: Arc<dyn FocusBackend> = Arc::new(LocalBackend::new(service));
    let settings = workspace.settings.clone();

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    let result = runtime.block_on(async move {
        let mut controller = FocusController::new(
            student,
            backend,
            ResourceSet::for_platform(),
            settings,
            SessionRegistry::new(),
        );
        if let Some(course) = course {
            controller = controller.with_course(course);
        }
        controller.on_notice(print_notice);

        controller.start_focus()?;
        println!("Type 'help' for commands.");

        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        while controller.state().is_live() {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line.context("Failed to read input")? else {
                        controller.dispatch(HostSignal::Unmounted);
                        break;
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    match line.parse::<SessionInput>() {
                        Ok(input) => apply_input(&mut controller, input),
                        Err(e) => println!("✗ {:#}", e),
                    }
                }
                _ = controller.process_next() => {}
            }
        }

        if let Some(session) = controller.session() {
            println!(
                "Session ended: {} counted, {} violation(s)",
                format_seconds(session.active_seconds),
                session.violation_count
            );
        }
        Ok::<(), anyhow::Error>(())
    });

    // A pending stdin read must not hold up exit
    runtime.shutdown_background();
    result
}

fn apply_input(controller: &mut FocusController, input: SessionInput) {
    let result = match input {
        SessionInput::Signal(signal) => {
            controller.dispatch(signal);
            Ok(())
        }
        SessionInput::Pause => controller.request_pause(),
        SessionInput::Resolve { pin, intent } => controller.resolve_override(&pin, intent).map(|_| ()),
        SessionInput::Cancel => controller.cancel_override(),
        SessionInput::Stop(pin) => controller.stop_focus(pin.as_ref()),
        SessionInput::Status => {
            print_status(controller);
            Ok(())
        }
        SessionInput::Help => {
            println!("{}", HELP);
            Ok(())
        }
        SessionInput::Quit => {
            controller.dispatch(HostSignal::Unmounted);
            Ok(())
        }
    };

    if let Err(e) = result {
        println!("✗ {}", e);
    }
}

fn print_status(controller: &FocusController) {
    println!("State: {}", controller.state());
    if let Some(session) = controller.session() {
        println!("  Counted: {}", format_seconds(session.active_seconds));
        println!("  Violations: {}", session.violation_count);
        if session.protection.is_unprotected() {
            println!("  Unprotected: display={} sleep_lock={}", session.protection.display, session.protection.sleep_lock);
        }
    }
    if let Some(request) = controller.pending_override() {
        println!("  Waiting for guardian ({:?})", request.reason);
    }
    let buffered = controller.buffered_heartbeats();
    if buffered > 0 {
        println!("  Heartbeats buffered: {}", buffered);
    }
}

fn print_notice(notice: &SessionNotice) {
    match notice {
        SessionNotice::Started { session_id, unprotected } => {
            println!("✓ Focus session {} started", session_id);
            if *unprotected {
                println!("  Running without full device protection");
            }
        }
        SessionNotice::Denied { reason, next_window } => {
            println!("✗ Session denied: {}", reason);
            if let Some(at) = next_window {
                println!("  Next window opens {}", at.format("%a %Y-%m-%d %H:%M UTC"));
            }
        }
        SessionNotice::Unprotected { resource, reason } => println!("! {} unavailable: {}", resource, reason),
        SessionNotice::Violation { kind, count } => println!("! Left the session ({:?}), violation #{}", kind, count),
        SessionNotice::Returned => println!("✓ Back in the session"),
        SessionNotice::OverrideRequired { reason } => {
            println!("! Session paused ({:?}); guardian PIN required", reason)
        }
        SessionNotice::Resumed => println!("✓ Session resumed"),
        SessionNotice::PinRejected { attempts_remaining } => {
            println!("✗ Wrong PIN, {} attempt(s) left", attempts_remaining)
        }
        SessionNotice::PinLockedOut { until } => println!("✗ PIN entry locked until {}", until.format("%H:%M:%S")),
        SessionNotice::HeartbeatDelayed { pending, error } => {
            println!("! {} heartbeat(s) not yet delivered: {}", pending, error)
        }
        SessionNotice::HeartbeatRejected { interval_seconds, error } => {
            println!("✗ {} of usage was not recorded: {}", format_seconds(*interval_seconds), error)
        }
        SessionNotice::Terminated { cause } => println!("Session terminated ({:?})", cause),
    }
}
