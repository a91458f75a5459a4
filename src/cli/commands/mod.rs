mod subcommands;


use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "parlance")]
#[command(about = "Conversational agent runtime")]
#[command(version)]
pub struct Cli {
    /// Config file (defaults to ~/.parlance/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Talk to the agent (interactive unless --message is given)
    Chat {
        #[arg(short, long)]
        message: Option<String>,
        #[arg(short, long, default_value = "cli:default")]
        session: String,
    },
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        cmd: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Load and validate the config file
    Check,
    /// Print the effective configuration with secrets masked
    Show,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Chat { message, session } => {
            subcommands::chat(config_path, message, session).await?;
        }
        Commands::Config { cmd } => {
            subcommands::config_command(config_path, &cmd)?;
        }
    }

    Ok(())
}
