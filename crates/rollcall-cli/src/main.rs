use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rollcalld::{Config, Service};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall roster management CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a student from a photo
    Enroll {
        /// Student identifier (e.g., "S1023")
        id: String,
        /// Display name
        name: String,
        /// Path to a photo containing exactly one face
        photo: PathBuf,
    },
    /// List enrolled students
    List,
    /// Remove a student's enrollment
    Remove {
        /// Student identifier to remove
        id: String,
    },
    /// Probe a photo against the roster
    Probe {
        /// Path to the probe photo
        photo: PathBuf,
    },
    /// Report which of the given student ids are enrolled
    Check {
        /// Student identifiers to look up
        ids: Vec<String>,
    },
    /// Compare the faces in two photos
    Compare {
        photo_a: PathBuf,
        photo_b: PathBuf,
    },
    /// Run one identification pass against the configured stream
    Identify,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let service = Service::new(Config::from_env()).context("service startup failed")?;

    match cli.command {
        Commands::Enroll { id, name, photo } => {
            let bytes = std::fs::read(&photo)
                .with_context(|| format!("reading {}", photo.display()))?;
            service.enroll(&id, &name, &bytes).await?;
            println!("Enrolled {name} ({id})");
        }
        Commands::List => {
            let roster = service.roster_snapshot().await;
            if roster.is_empty() {
                println!("No students enrolled");
            } else {
                for (id, name) in roster {
                    println!("{id}\t{name}");
                }
            }
        }
        Commands::Remove { id } => {
            if service.remove_enrollment(&id).await? {
                println!("Removed {id}");
            } else {
                println!("No enrollment for {id}");
            }
        }
        Commands::Probe { photo } => {
            let bytes = std::fs::read(&photo)
                .with_context(|| format!("reading {}", photo.display()))?;
            let check = service.probe_photo(&bytes).await?;
            println!("{}", serde_json::to_string_pretty(&check)?);
        }
        Commands::Check { ids } => {
            let presence = service.check_roster(&ids).await;
            println!("{}", serde_json::to_string_pretty(&presence)?);
        }
        Commands::Compare { photo_a, photo_b } => {
            let a = std::fs::read(&photo_a)
                .with_context(|| format!("reading {}", photo_a.display()))?;
            let b = std::fs::read(&photo_b)
                .with_context(|| format!("reading {}", photo_b.display()))?;
            let outcome = service.compare(&a, &b).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Identify => {
            service.start_stream().await?;
            let report = service.identify().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            service.stop_stream().await.ok();
        }
    }

    Ok(())
}
