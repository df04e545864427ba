//! Main entry point for the batchgate gateway.

use batchgate::{auth, cli, server, settings::Settings, telemetry};
use clap::Parser;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let args = cli::Cli::parse();

    match args.command {
        cli::Commands::Serve => serve().await,
        cli::Commands::HashPassword { password } => hash_password(password),
    }
}

async fn serve() -> ExitCode {
    let settings = match Settings::load() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(1);
        }
    };

    if let Err(e) = telemetry::init(&settings.logging) {
        eprintln!("failed to initialize logging: {e}");
        return ExitCode::from(1);
    }

    match server::serve(&settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e @ server::ServeError::Bind { .. }) => {
            tracing::error!("{e}");
            ExitCode::from(2)
        }
        Err(e) => {
            tracing::error!("server error: {e}");
            ExitCode::from(1)
        }
    }
}

fn hash_password(password: Option<String>) -> ExitCode {
    let password = match password {
        Some(password) => password,
        None => {
            print!("Enter password: ");
            if std::io::Write::flush(&mut std::io::stdout()).is_err() {
                return ExitCode::from(1);
            }
            match rpassword::read_password() {
                Ok(password) => password,
                Err(e) => {
                    eprintln!("failed to read password: {e}");
                    return ExitCode::from(1);
                }
            }
        }
    };

    match auth::hash_password(&password) {
        Ok(hash) => {
            println!("{hash}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("failed to hash password: {e}");
            ExitCode::from(1)
        }
    }
}
