//! butleradm library
//!
//! The binary is a thin wrapper around [`Cli`]; everything else lives in
//! [`bootstrap`] so it can be tested without a terminal.

pub mod bootstrap;
pub mod commands;

pub use butler_common::{Error, Result};

use clap::{Parser, Subcommand};

/// butleradm - Butler platform administration
#[derive(Parser, Debug)]
#[command(name = "butleradm")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Bootstrap a new Butler management cluster
    Bootstrap(commands::bootstrap::BootstrapArgs),
    /// Print version information
    Version,
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Bootstrap(args) => commands::bootstrap::run(args).await,
            Commands::Version => {
                commands::version::run();
                Ok(())
            }
        }
    }
}
