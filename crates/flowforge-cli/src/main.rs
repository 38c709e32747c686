//! CLI for flowforge — generate, aggregate, and publish network flow records.

mod commands;

use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "flowforge")]
#[command(about = "flowforge — network flow record storage and generation")]
#[command(version = flowforge_core::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate synthetic flow records into hourly files or a single stream
    Generate(commands::generate::GenerateArgs),

    /// Inspect and combine aggregate-bag files
    Bag {
        #[command(subcommand)]
        command: commands::bag::BagCommands,
    },

    /// Run the storage-core invariant battery
    Selfcheck,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Generate(args) => commands::generate::run(args),
        Commands::Bag { command } => commands::bag::run(command),
        Commands::Selfcheck => commands::selfcheck::run(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("flowforge: {err}");
            ExitCode::FAILURE
        }
    }
}
