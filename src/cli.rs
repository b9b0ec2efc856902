use clap::{Parser, Subcommand};
use std::path::PathBuf;

use focus_guard::focus::Pin;

/// Focus session and screen-time enforcement
///
/// Keeps a per-student usage ledger against a guardian policy and supervises
/// focus sessions whose exits are gated by the guardian PIN.
#[derive(Parser, Debug)]
#[command(name = "focus-guard")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Directory holding the state file (defaults to the settings value, then the platform data dir)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Engine settings file (TOML)
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write an example policy and settings file
    Init {
        /// Directory to write into
        #[arg(long, default_value = ".")]
        output: PathBuf,

        /// Overwrite existing files
        #[arg(long)]
        force: bool,
    },
    /// Manage guardian policies
    Policy {
        #[command(subcommand)]
        command: PolicyCommands,
    },
    /// Report active time for a student
    Heartbeat {
        student: String,

        /// Seconds of activity this heartbeat covers
        #[arg(long, default_value = "15")]
        interval: i64,
    },
    /// Show today's usage
    Usage {
        student: String,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Reset today's usage (requires the guardian PIN)
    Reset {
        student: String,

        #[arg(long)]
        pin: Pin,
    },
    /// Grant extra time for today (requires the guardian PIN)
    Extend {
        student: String,

        #[arg(long)]
        minutes: u32,

        #[arg(long)]
        pin: Pin,
    },
    /// Manage the guardian PIN
    Pin {
        #[command(subcommand)]
        command: PinCommands,
    },
    /// Show daily usage history and guardian actions
    History {
        student: String,

        /// Number of days to show
        #[arg(long, default_value = "7")]
        days: usize,
    },
    /// Run a supervised focus session, reading host signals from stdin
    Session {
        student: String,

        #[arg(long)]
        course: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum PolicyCommands {
    /// Print a student's policy as YAML
    Show { student: String },
    /// Validate a YAML policy file and store it for a student
    Set { student: String, file: PathBuf },
    /// Show what the route guard does with a route
    CheckRoute {
        student: String,
        route: String,

        /// Evaluate as if a focus session were running
        #[arg(long)]
        focus: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum PinCommands {
    /// Set the guardian PIN (changing it requires the current one)
    Set {
        student: String,

        #[arg(long)]
        pin: Pin,

        #[arg(long)]
        current: Option<Pin>,
    },
    /// Check a guardian PIN (counts towards lockout)
    Verify {
        student: String,

        #[arg(long)]
        pin: Pin,
    },
}
