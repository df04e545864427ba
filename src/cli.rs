//! Command line interface definitions.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "batchgate",
    about = "Dynamic batching inference gateway",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP gateway
    Serve,

    /// Hash a password for seeding `auth.users` in the configuration
    HashPassword {
        /// Read the password from this argument instead of prompting
        #[arg(long)]
        password: Option<String>,
    },
}
