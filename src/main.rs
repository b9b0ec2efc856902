use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;

use cli::{Args, Commands, PinCommands, PolicyCommands};
use commands::{guardian, session, usage, utils, Workspace};

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    // init needs no settings or state
    if let Commands::Init { output, force } = &args.command {
        utils::init_logging(args.verbose, "info");
        return guardian::init(output, *force);
    }

    let workspace = Workspace::load(args.settings.as_deref(), args.data_dir.as_deref())?;
    utils::init_logging(args.verbose, &workspace.settings.logging.level);

    match args.command {
        Commands::Init { .. } => Ok(()),
        Commands::Policy { command } => match command {
            PolicyCommands::Show { student } => guardian::show_policy(&workspace, &student),
            PolicyCommands::Set { student, file } => guardian::set_policy(&workspace, &student, &file),
            PolicyCommands::CheckRoute { student, route, focus } => {
                guardian::check_route(&workspace, &student, &route, focus)
            }
        },
        Commands::Heartbeat { student, interval } => usage::heartbeat(&workspace, &student, interval),
        Commands::Usage { student, json } => usage::show_usage(&workspace, &student, json),
        Commands::Reset { student, pin } => guardian::reset(&workspace, &student, &pin),
        Commands::Extend { student, minutes, pin } => guardian::extend(&workspace, &student, minutes, &pin),
        Commands::Pin { command } => match command {
            PinCommands::Set { student, pin, current } => {
                guardian::set_pin(&workspace, &student, &pin, current.as_ref())
            }
            PinCommands::Verify { student, pin } => guardian::verify_pin(&workspace, &student, &pin),
        },
        Commands::History { student, days } => usage::history(&workspace, &student, days),
        Commands::Session { student, course } => session::run(&workspace, &student, course),
    }
}
