use clap::{Parser, Subcommand};
use reward_model_rs::{config::ScriptArguments, run};
use tracing_subscriber::EnvFilter;

/// CLI
#[derive(Debug, Parser)]
#[command(name = "reward-model-rs")]
#[command(about = "Train a pairwise preference reward model.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fine-tune a reward model and save its adapter
    Train {
        #[command(flatten)]
        args: ScriptArguments,
    },
    /// Build the datasets and print their sizes
    Data {
        #[command(flatten)]
        args: ScriptArguments,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Train { args } => run::run_training(&args),
        Commands::Data { args } => run::inspect_data(&args),
    };
    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
