use assert_fs::prelude::*;
use assert_fs::TempDir;
use predicates::prelude::*;
use std::io::Write;
use std::process::{Command, Output, Stdio};

const POLICY: &str = "\
daily_limit_seconds: 3600
blocked_routes:
  - /games
allowed_routes_during_focus:
  - /courses/*/lessons
";

struct Sandbox {
    dir: TempDir,
}

impl Sandbox {
    fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        let data_dir = self.dir.child("data");
        let settings = self.dir.child("settings.toml");
        if !settings.path().exists() {
            settings.write_str("[heartbeat]\ninterval_seconds = 15\n").unwrap();
        }

        let mut command = Command::new(env!("CARGO_BIN_EXE_focus-guard"));
        command
            .args(args)
            .arg("--data-dir")
            .arg(data_dir.path())
            .arg("--settings")
            .arg(settings.path())
            .env("HOME", self.dir.path())
            .env_remove("RUST_LOG");
        command
    }

    fn run(&self, args: &[&str]) -> Output {
        self.command(args).output().unwrap()
    }

    fn ok(&self, args: &[&str]) -> String {
        let output = self.run(args);
        assert!(
            output.status.success(),
            "{:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8(output.stdout).unwrap()
    }

    fn fails(&self, args: &[&str]) -> String {
        let output = self.run(args);
        assert!(!output.status.success(), "{:?} unexpectedly succeeded", args);
        String::from_utf8(output.stderr).unwrap()
    }

    /// Store the test policy and PIN 4821 for kid1
    fn with_student(self) -> Self {
        let file = self.dir.child("policy.yaml");
        file.write_str(POLICY).unwrap();
        self.ok(&["policy", "set", "kid1", file.path().to_str().unwrap()]);
        self.ok(&["pin", "set", "kid1", "--pin", "4821"]);
        self
    }

    fn used_seconds(&self) -> i64 {
        let json = self.ok(&["usage", "kid1", "--json"]);
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        value["used_seconds"].as_i64().unwrap()
    }
}

#[test]
fn test_init_writes_examples_once() {
    let sandbox = Sandbox::new();
    let out = sandbox.dir.child("conf");
    let out_path = out.path().to_str().unwrap();

    let stdout = sandbox.ok(&["init", "--output", out_path]);
    assert!(predicate::str::contains("✓ Created").eval(&stdout));
    out.child("policy.yaml").assert(predicate::str::contains("daily_limit_seconds"));
    out.child("settings.toml").assert(predicate::path::exists());

    let stderr = sandbox.fails(&["init", "--output", out_path]);
    assert!(predicate::str::contains("--force").eval(&stderr));

    sandbox.ok(&["init", "--output", out_path, "--force"]);
}

#[test]
fn test_example_policy_is_accepted() {
    let sandbox = Sandbox::new();
    let out = sandbox.dir.child("conf");
    sandbox.ok(&["init", "--output", out.path().to_str().unwrap()]);

    let policy = out.child("policy.yaml");
    let stdout = sandbox.ok(&["policy", "set", "kid1", policy.path().to_str().unwrap()]);
    assert!(predicate::str::contains("Allowed windows: 3").eval(&stdout));
}

#[test]
fn test_invalid_policy_is_rejected_whole() {
    let sandbox = Sandbox::new().with_student();
    let bad = sandbox.dir.child("bad.yaml");
    bad.write_str(
        "daily_limit_seconds: 60\nallowed_windows:\n  - weekday: Mon\n    start: \"18:00\"\n    end: \"09:00\"\n",
    )
    .unwrap();

    let stderr = sandbox.fails(&["policy", "set", "kid1", bad.path().to_str().unwrap()]);
    assert!(predicate::str::starts_with("Error:").eval(&stderr));
    assert!(predicate::str::contains("must start before it ends").eval(&stderr));

    // The earlier policy is untouched
    let shown = sandbox.ok(&["policy", "show", "kid1"]);
    assert!(predicate::str::contains("daily_limit_seconds: 3600").eval(&shown));
}

#[test]
fn test_unknown_student() {
    let sandbox = Sandbox::new();
    let stderr = sandbox.fails(&["usage", "nobody"]);
    assert!(predicate::str::contains("Unknown student: nobody").eval(&stderr));
}

#[test]
fn test_heartbeats_accumulate_once() {
    let sandbox = Sandbox::new().with_student();

    let stdout = sandbox.ok(&["heartbeat", "kid1"]);
    assert!(predicate::str::contains("✓ Counted 15s").eval(&stdout));

    // Immediately again: inside the minimum spacing
    let stdout = sandbox.ok(&["heartbeat", "kid1"]);
    assert!(predicate::str::contains("not counted").eval(&stdout));

    assert_eq!(sandbox.used_seconds(), 15);
}

#[test]
fn test_oversized_heartbeat_is_refused() {
    let sandbox = Sandbox::new().with_student();

    let stderr = sandbox.fails(&["heartbeat", "kid1", "--interval", "9223372036854775807"]);
    assert!(predicate::str::contains("Invalid heartbeat").eval(&stderr));

    // Nothing was recorded and the store still accepts heartbeats
    assert_eq!(sandbox.used_seconds(), 0);
    sandbox.ok(&["heartbeat", "kid1"]);
    assert_eq!(sandbox.used_seconds(), 15);
}

#[test]
fn test_reset_requires_guardian_pin() {
    let sandbox = Sandbox::new().with_student();
    sandbox.ok(&["heartbeat", "kid1", "--interval", "15"]);

    let stderr = sandbox.fails(&["reset", "kid1", "--pin", "0000"]);
    assert!(predicate::str::contains("PIN rejected").eval(&stderr));
    assert_eq!(sandbox.used_seconds(), 15);

    sandbox.ok(&["reset", "kid1", "--pin", "4821"]);
    assert_eq!(sandbox.used_seconds(), 0);

    let history = sandbox.ok(&["history", "kid1"]);
    assert!(predicate::str::contains("reset (15s cleared)").eval(&history));
}

#[test]
fn test_extension_adds_to_remaining_time() {
    let sandbox = Sandbox::new().with_student();

    let stdout = sandbox.ok(&["extend", "kid1", "--minutes", "30", "--pin", "4821"]);
    assert!(predicate::str::contains("Remaining today: 1h 30m").eval(&stdout));

    let history = sandbox.ok(&["history", "kid1"]);
    assert!(predicate::str::contains("extension of 30m 00s by guardian-pin").eval(&history));
}

#[test]
fn test_pin_lockout_after_repeated_failures() {
    let sandbox = Sandbox::new().with_student();

    for _ in 0..5 {
        sandbox.fails(&["pin", "verify", "kid1", "--pin", "1111"]);
    }

    // Even the right PIN is refused while locked
    let stderr = sandbox.fails(&["pin", "verify", "kid1", "--pin", "4821"]);
    assert!(predicate::str::contains("locked until").eval(&stderr));
}

#[test]
fn test_changing_pin_needs_current_pin() {
    let sandbox = Sandbox::new().with_student();

    let stderr = sandbox.fails(&["pin", "set", "kid1", "--pin", "9999"]);
    assert!(predicate::str::contains("--current").eval(&stderr));

    sandbox.ok(&["pin", "set", "kid1", "--pin", "9999", "--current", "4821"]);
    sandbox.ok(&["pin", "verify", "kid1", "--pin", "9999"]);
}

#[test]
fn test_malformed_pin_rejected_by_parser() {
    let sandbox = Sandbox::new().with_student();
    let stderr = sandbox.fails(&["pin", "verify", "kid1", "--pin", "12ab"]);
    assert!(predicate::str::contains("PIN must be 4-12 digits").eval(&stderr));
}

#[test]
fn test_check_route() {
    let sandbox = Sandbox::new().with_student();

    let stdout = sandbox.ok(&["policy", "check-route", "kid1", "/games/chess"]);
    assert!(predicate::str::contains("redirect /games/chess -> / (blocked)").eval(&stdout));

    let stdout = sandbox.ok(&["policy", "check-route", "kid1", "/courses/7/lessons/2", "--focus"]);
    assert!(predicate::str::contains("render").eval(&stdout));

    let stdout = sandbox.ok(&["policy", "check-route", "kid1", "/profile", "--focus"]);
    assert!(predicate::str::contains("-> /focus (not allowed during focus)").eval(&stdout));
}

#[test]
fn test_interactive_session_violation_and_guarded_stop() {
    let sandbox = Sandbox::new().with_student();

    let mut child = sandbox
        .command(&["session", "kid1"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();

    {
        let mut stdin = child.stdin.take().unwrap();
        stdin.write_all(b"hidden\nvisible\nstop\nstop 4821\n").unwrap();
    }

    let output = child.wait_with_output().unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(predicate::str::contains("Focus session").eval(&stdout));
    assert!(predicate::str::contains("violation #1").eval(&stdout));
    assert!(predicate::str::contains("Back in the session").eval(&stdout));
    assert!(predicate::str::contains("Guardian PIN required").eval(&stdout));
    assert!(predicate::str::contains("Session terminated (Stopped)").eval(&stdout));
}
