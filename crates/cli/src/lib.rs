pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

use crate::commands::limits::LimitsAction;

#[derive(Debug, Parser)]
#[command(
    name = "concierge",
    about = "Concierge operator CLI",
    long_about = "Operate the Concierge chat pipeline: migrations, demo data, config inspection, readiness checks and rate-limit maintenance.",
    after_help = "Examples:\n  concierge doctor --json\n  concierge seed --reporting-demo\n  concierge limits status --user-id u-1 --role VEN"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Load demo role contexts, guides and access policies")]
    Seed {
        #[arg(long, help = "Also rebuild the demo `projects` table in the reporting store")]
        reporting_demo: bool,
    },
    #[command(about = "Inspect effective configuration values with source attribution and redaction")]
    Config,
    #[command(about = "Validate config, completion provider, database and reporting store")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Inspect and maintain hourly rate-limit windows")]
    Limits {
        #[command(subcommand)]
        action: LimitsCommand,
    },
}

#[derive(Debug, Subcommand)]
enum LimitsCommand {
    #[command(about = "Show the current window for a user under a role's quota")]
    Status {
        #[arg(long)]
        user_id: String,
        #[arg(long)]
        role: String,
    },
    #[command(about = "Delete windows that ended more than an hour ago")]
    Cleanup,
    #[command(about = "Delete every window recorded for a user")]
    Reset {
        #[arg(long)]
        user_id: String,
    },
}

impl From<LimitsCommand> for LimitsAction {
    fn from(command: LimitsCommand) -> Self {
        match command {
            LimitsCommand::Status { user_id, role } => Self::Status { user_id, role },
            LimitsCommand::Cleanup => Self::Cleanup,
            LimitsCommand::Reset { user_id } => Self::Reset { user_id },
        }
    }
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Seed { reporting_demo } => commands::seed::run(reporting_demo),
        Command::Config => commands::config::run(),
        Command::Doctor { json } => commands::doctor::run(json),
        Command::Limits { action } => commands::limits::run(action.into()),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
