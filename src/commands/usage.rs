use anyhow::{Context, Result};
use chrono::Utc;

use focus_guard::focus::ledger::AuditKind;
use focus_guard::focus::Heartbeat;

use super::utils::format_seconds;
use super::Workspace;

pub fn heartbeat(workspace: &Workspace, student: &str, interval: i64) -> Result<()> {
    if interval <= 0 {
        anyhow::bail!("--interval must be positive");
    }

    let mut service = workspace.open_service()?;
    let receipt = service.heartbeat(&Heartbeat {
        student_id: student.to_string(),
        observed_at: Utc::now(),
        interval_seconds: interval,
    })?;

    if receipt.counted {
        println!("✓ Counted {}", format_seconds(interval));
    } else {
        println!("Heartbeat not counted (duplicate or too soon after the previous one)");
    }
    println!(
        "  Used today: {}, remaining: {}",
        format_seconds(receipt.used_seconds_today),
        format_seconds(receipt.remaining_seconds)
    );
    if receipt.limit_reached {
        println!("  Daily limit reached");
    }
    Ok(())
}

pub fn show_usage(workspace: &Workspace, student: &str, json: bool) -> Result<()> {
    let service = workspace.open_service()?;
    let summary = service.usage(student, Utc::now())?;

    if json {
        let content = serde_json::to_string_pretty(&summary).context("Failed to serialize usage")?;
        println!("{}", content);
        return Ok(());
    }

    println!("\n=== Usage for {} on {} ===\n", student, summary.date);
    println!("  Used:      {}", format_seconds(summary.used_seconds));
    println!("  Limit:     {}", format_seconds(summary.limit_seconds));
    if summary.bonus_seconds > 0 {
        println!("  Extension: {}", format_seconds(summary.bonus_seconds));
    }
    println!("  Remaining: {}", format_seconds(summary.remaining_seconds));
    if summary.limit_reached {
        println!("  Status: limit reached");
    }
    Ok(())
}

pub fn history(workspace: &Workspace, student: &str, days: usize) -> Result<()> {
    let service = workspace.open_service()?;
    let entries = service.history(student, days)?;

    println!("\n=== Usage History for {} ===\n", student);

    if entries.is_empty() {
        println!("No usage recorded");
    }
    for entry in &entries {
        print!("{}  {}", entry.date, format_seconds(entry.used_seconds));
        if entry.bonus_seconds > 0 {
            print!("  (+{} extension)", format_seconds(entry.bonus_seconds));
        }
        println!();
    }

    let audit = service.audit(student);
    if !audit.is_empty() {
        println!("\nGuardian actions:");
        for record in audit {
            let action = match (record.kind, record.seconds) {
                (AuditKind::Reset, _) => format!("reset ({} cleared)", format_seconds(record.used_seconds_before)),
                (AuditKind::Extension, Some(seconds)) => format!("extension of {}", format_seconds(seconds)),
                (AuditKind::Extension, None) => "extension".to_string(),
            };
            println!(
                "  {} {} by {}",
                record.at.format("%Y-%m-%d %H:%M:%S"),
                action,
                record.authorized_by
            );
        }
    }
    Ok(())
}
