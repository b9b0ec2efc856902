use anyhow::{Context, Result};
use chrono::Utc;
use std::path::Path;

use focus_guard::focus::auth::guardian_identity;
use focus_guard::focus::config::EXAMPLE_SETTINGS;
use focus_guard::focus::overrides::OverrideIntent;
use focus_guard::focus::policy::{load_policy_file, EXAMPLE_POLICY};
use focus_guard::focus::routes::{guard_route, RedirectReason, RouteDecision};
use focus_guard::focus::service::{PinVerifyRequest, ResetRequest, PIN_AUTHORITY};
use focus_guard::focus::{Pin, PinVerdict};

use super::utils::format_seconds;
use super::Workspace;

/// Write `policy.yaml` and `settings.toml` examples into `output`
pub fn init(output: &Path, force: bool) -> Result<()> {
    std::fs::create_dir_all(output)
        .with_context(|| format!("Failed to create directory: {}", output.display()))?;

    let files = [("policy.yaml", EXAMPLE_POLICY), ("settings.toml", EXAMPLE_SETTINGS)];

    for (name, _) in &files {
        let path = output.join(name);
        if path.exists() && !force {
            anyhow::bail!("{} already exists\nUse --force to overwrite", path.display());
        }
    }

    for (name, content) in &files {
        let path = output.join(name);
        std::fs::write(&path, content).with_context(|| format!("Failed to write {}", path.display()))?;
        println!("✓ Created {}", path.display());
    }

    println!("\nEdit policy.yaml, then apply it with:");
    println!("  focus-guard policy set <student-id> {}", output.join("policy.yaml").display());
    println!("and set the guardian PIN with:");
    println!("  focus-guard pin set <student-id> --pin <digits>");

    Ok(())
}

pub fn show_policy(workspace: &Workspace, student: &str) -> Result<()> {
    let service = workspace.open_service()?;
    let policy = service.get_policy(student)?;

    let yaml = serde_yaml::to_string(policy).context("Failed to serialize policy")?;
    print!("{}", yaml);
    Ok(())
}

pub fn set_policy(workspace: &Workspace, student: &str, file: &Path) -> Result<()> {
    let policy = load_policy_file(file)?;
    let mut service = workspace.open_service()?;
    service
        .put_policy(student, policy)
        .with_context(|| format!("Policy in {} was not applied", file.display()))?;

    let stored = service.get_policy(student)?;
    println!("✓ Stored policy for {}", student);
    println!("  Daily limit: {}", format_seconds(stored.daily_limit_seconds));
    println!("  Allowed windows: {}", stored.allowed_windows.len());
    println!("  Focus supervision: {}", if stored.focus_enabled { "on" } else { "off" });
    Ok(())
}

pub fn check_route(workspace: &Workspace, student: &str, route: &str, focus: bool) -> Result<()> {
    let service = workspace.open_service()?;
    let policy = service.get_policy(student)?;

    match guard_route(policy, route, focus) {
        RouteDecision::Render => println!("render {}", route),
        RouteDecision::Redirect { to, reason } => {
            let why = match reason {
                RedirectReason::Blocked => "blocked",
                RedirectReason::NotAllowedDuringFocus => "not allowed during focus",
            };
            println!("redirect {} -> {} ({})", route, to, why);
        }
    }
    Ok(())
}

pub fn reset(workspace: &Workspace, student: &str, pin: &Pin) -> Result<()> {
    let mut service = workspace.open_service()?;
    let now = Utc::now();

    service.authenticate(student, pin, now)?.into_result()?;

    let request = ResetRequest {
        student_id: student.to_string(),
        authorized_by: authority(),
    };
    let record = service.reset(&request, now)?;

    println!("✓ Reset today's usage for {}", student);
    println!("  Cleared: {}", format_seconds(record.used_seconds_before));
    Ok(())
}

pub fn extend(workspace: &Workspace, student: &str, minutes: u32, pin: &Pin) -> Result<()> {
    if minutes == 0 {
        anyhow::bail!("--minutes must be at least 1");
    }

    let mut service = workspace.open_service()?;
    let now = Utc::now();
    let request = PinVerifyRequest {
        student_id: student.to_string(),
        pin: pin.clone(),
        intent: OverrideIntent::ExtendTime {
            seconds: i64::from(minutes) * 60,
        },
    };

    service.verify_pin(&request, now)?.into_result()?;
    let summary = service.usage(student, now)?;

    println!("✓ Granted {} minute(s) to {}", minutes, student);
    println!("  Remaining today: {}", format_seconds(summary.remaining_seconds));
    Ok(())
}

pub fn set_pin(workspace: &Workspace, student: &str, pin: &Pin, current: Option<&Pin>) -> Result<()> {
    let mut service = workspace.open_service()?;
    let now = Utc::now();

    if service.has_pin(student) {
        let current = current.context("A guardian PIN is already set; pass it with --current to change it")?;
        service.authenticate(student, current, now)?.into_result()?;
    }

    service.set_pin(student, pin, now)?;
    println!("✓ Guardian PIN set for {}", student);
    Ok(())
}

pub fn verify_pin(workspace: &Workspace, student: &str, pin: &Pin) -> Result<()> {
    let mut service = workspace.open_service()?;
    let verdict = service.authenticate(student, pin, Utc::now())?;

    if verdict == PinVerdict::Accepted {
        println!("✓ PIN accepted");
    }
    verdict.into_result()?;
    Ok(())
}

/// Who to record in the audit log for CLI actions
fn authority() -> String {
    guardian_identity().unwrap_or_else(|_| PIN_AUTHORITY.to_string())
}
