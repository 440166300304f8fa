//! confidectl: Operator tool for the conversation encryption subsystem.
//!
//! Inspects and maintains a key directory: run diagnostics, register
//! users, and force key rotations.

use clap::{Parser, Subcommand};
use confide_crypto::{E2eConfig, E2eService};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "confidectl")]
#[command(author, version, about = "Key lifecycle operations for Confide conversation encryption")]
#[command(propagate_version = true)]
struct Cli {
    /// Key directory (service keypair + user key registry)
    #[arg(short, long, default_value = "keys")]
    key_dir: PathBuf,

    /// Rotation threshold in days
    #[arg(long, default_value_t = 90)]
    rotation_days: u32,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the integrity self-test and print the diagnostic report
    Verify,

    /// Register a user's public key
    Register {
        /// User id to register
        #[arg(short, long)]
        user: String,

        /// Path to the user's public key PEM file
        #[arg(short, long)]
        public_key: PathBuf,
    },

    /// Rotate a user's symmetric key now
    Rotate {
        /// User id whose key to rotate
        #[arg(short, long)]
        user: String,
    },

    /// Run one rotation scan over every registered user
    Scan,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = E2eConfig::default()
        .with_key_directory(&cli.key_dir)
        .with_rotation_days(cli.rotation_days);
    let service = E2eService::open(config)?;

    match cli.command {
        Commands::Verify => {
            let report = service.check();
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Register { user, public_key } => {
            let pem = std::fs::read_to_string(&public_key)?;
            let record = service.register_user(&user, &pem)?;
            println!("Registered user {} (created_at: {})", record.user_id, record.created_at);
        }
        Commands::Rotate { user } => {
            let record = service.rotate_user(&user)?;
            println!(
                "Rotated key for user {} ({} retired key(s) retained)",
                record.user_id,
                record.previous_keys.len()
            );
        }
        Commands::Scan => {
            let report = service.run_rotation();
            println!(
                "Checked {} user(s): {} rotated, {} nearing expiry, {} error(s)",
                report.checked,
                report.rotated.len(),
                report.warned.len(),
                report.errors.len()
            );
            for (user, error) in &report.errors {
                eprintln!("  rotation failed for {}: {}", user, error);
            }
        }
    }

    Ok(())
}
