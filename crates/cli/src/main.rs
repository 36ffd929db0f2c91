//! cmdpipe CLI - drive experiments for a controller over a multiplexed socket

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use cmdpipe::Config;

mod commands;
mod logging;

use commands::{cmd_config_init, cmd_config_show, cmd_connect};
use logging::{init_cli_logging, init_connection_logging};

#[derive(Parser)]
#[command(name = "cmdpipe")]
#[command(about = "Multiplexed line-oriented command transport")]
#[command(after_help = "\
QUICK START:
  cmdpipe config init             # Write a config template
  cmdpipe connect --foreground    # Connect and log to the console
  cmdpipe connect -s /tmp/x.sock  # Connect to a specific socket")]
struct Cli {
  /// Config file (default: ~/.config/cmdpipe/config.toml)
  #[arg(long, global = true, value_name = "FILE")]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Connect to a controller and serve its commands until it quits
  Connect {
    /// Socket path (default: from config, then $XDG_RUNTIME_DIR/cmdpipe.sock)
    #[arg(short, long)]
    socket: Option<PathBuf>,
    /// Log to the console instead of the log file
    #[arg(long)]
    foreground: bool,
  },
  /// Manage configuration
  Config {
    #[command(subcommand)]
    command: ConfigCommand,
  },
}

#[derive(Subcommand)]
enum ConfigCommand {
  /// Show the effective configuration
  Show,
  /// Write a config template to the user config path
  Init {
    /// Overwrite an existing file
    #[arg(long)]
    force: bool,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();

  match cli.command {
    Commands::Connect { socket, foreground } => {
      let config = Config::load(cli.config.as_deref())?;
      let _guard = init_connection_logging(&config.logging, foreground);
      cmd_connect(config, socket).await
    }
    Commands::Config { command } => {
      init_cli_logging();
      match command {
        ConfigCommand::Show => cmd_config_show(cli.config.as_deref()),
        ConfigCommand::Init { force } => cmd_config_init(force),
      }
    }
  }
}
