use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use facia_core::{Decision, Frame, FrameSource, IdentifyOutcome, IdentityStore, ImageSetSource};
use facia_store::SqliteStore;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;

use config::AppConfig;
use engine::EnrollRun;

#[derive(Parser)]
#[command(name = "facia", about = "facia face identification CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a new identity from a set of face images
    Enroll {
        /// Human-readable label for the identity
        #[arg(short, long)]
        label: String,
        /// Image files, consumed in order
        images: Vec<PathBuf>,
    },
    /// Identify the subject in a face image
    Identify {
        image: PathBuf,
    },
    /// Verify that a face image matches a claimed identity
    Verify {
        /// Identity ID being claimed
        #[arg(long)]
        id: String,
        image: PathBuf,
    },
    /// List enrolled identities
    List,
    /// Remove an enrolled identity and its embeddings
    Remove {
        /// Identity ID to remove
        id: String,
    },
    /// Show recent identify/enroll attempts
    Log {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show store and configuration status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = AppConfig::load()?;
    let store = Arc::new(SqliteStore::open(&config.db_path)?);
    let cli = Cli::parse();

    match cli.command {
        Commands::Enroll { label, images } => {
            anyhow::ensure!(!images.is_empty(), "at least one image is required");
            let frames = read_frames("enroll", images)?;
            let handle = engine::spawn_engine(&config, Arc::clone(&store))?;

            match handle.enroll(label.clone(), frames).await? {
                EnrollRun::Committed { identity, embeddings, rejected } => {
                    store.record_access(Some(&identity.id), "enrollment", "success", None)?;
                    println!(
                        "enrolled '{label}' as {} ({embeddings} samples, {rejected} captures rejected)",
                        identity.id
                    );
                }
                EnrollRun::TimedOut { captured, required } => {
                    store.record_access(None, "enrollment", "failure", None)?;
                    println!("enrollment timed out after {captured}/{required} accepted captures");
                }
                EnrollRun::Exhausted { captured, required, rejected } => {
                    store.record_access(None, "enrollment", "failure", None)?;
                    println!(
                        "not enough usable captures: {captured}/{required} accepted, {rejected} rejected"
                    );
                }
            }
        }

        Commands::Identify { image } => {
            let frame = read_frames("identify", vec![image])?
                .pop()
                .ok_or_else(|| anyhow::anyhow!("no frames decoded"))?;
            let handle = engine::spawn_engine(&config, Arc::clone(&store))?;

            match handle.identify(frame).await? {
                IdentifyOutcome::NoFace => {
                    store.record_access(None, "identification", "failure", None)?;
                    println!("no face detected");
                }
                IdentifyOutcome::QualityRejected(issues) => {
                    store.record_access(None, "identification", "failure", None)?;
                    let reasons: Vec<String> = issues.iter().map(|i| i.to_string()).collect();
                    println!("capture unusable: {}", reasons.join(", "));
                }
                IdentifyOutcome::Decided(result) => {
                    report_decision(&store, &result)?;
                }
            }
        }

        Commands::Verify { id, image } => {
            let frame = read_frames("verify", vec![image])?
                .pop()
                .ok_or_else(|| anyhow::anyhow!("no frames decoded"))?;
            let handle = engine::spawn_engine(&config, Arc::clone(&store))?;

            match handle.verify(frame, id.clone()).await? {
                IdentifyOutcome::NoFace => {
                    store.record_access(None, "verification", "failure", None)?;
                    println!("no face detected");
                }
                IdentifyOutcome::QualityRejected(issues) => {
                    store.record_access(None, "verification", "failure", None)?;
                    let reasons: Vec<String> = issues.iter().map(|i| i.to_string()).collect();
                    println!("capture unusable: {}", reasons.join(", "));
                }
                IdentifyOutcome::Decided(result) => {
                    let distance = result.best.as_ref().map(|b| b.distance);
                    if result.decision == Decision::Accepted {
                        store.record_access(Some(&id), "verification", "success", distance)?;
                        println!("verified: {id} (distance {:.4})", distance.unwrap_or(f32::NAN));
                    } else {
                        store.record_access(Some(&id), "verification", "failure", distance)?;
                        match distance {
                            Some(distance) => {
                                println!("verification failed for {id} (distance {distance:.4})")
                            }
                            None => println!("verification failed: {id} has nothing enrolled"),
                        }
                    }
                }
            }
        }

        Commands::List => {
            let identities = store.list_identities()?;
            if identities.is_empty() {
                println!("no identities enrolled");
            }
            for identity in identities {
                println!(
                    "{}  {}  {}  {}",
                    identity.id,
                    identity.enrolled_at.format("%Y-%m-%d %H:%M:%S"),
                    identity.encoder_version,
                    identity.label,
                );
            }
        }

        Commands::Remove { id } => {
            store.delete_identity(&id)?;
            println!("removed {id}");
        }

        Commands::Log { limit } => {
            for record in store.recent_access(limit)? {
                println!(
                    "{}  {:<14}  {:<7}  {}  {}",
                    record.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    record.operation,
                    record.result,
                    record.score.map(|s| format!("{s:.4}")).unwrap_or_else(|| "-".into()),
                    record.identity_id.as_deref().unwrap_or("-"),
                );
            }
        }

        Commands::Status => {
            let identities = store.list_identities()?;
            let embeddings = store.load_all_embeddings()?;
            println!(
                "{}",
                serde_json::json!({
                    "version": env!("CARGO_PKG_VERSION"),
                    "db_path": config.db_path.display().to_string(),
                    "model_dir": config.model_dir.display().to_string(),
                    "identities": identities.len(),
                    "embeddings": embeddings.len(),
                    "encoder_version": config.pipeline.encoder_version,
                    "accept_threshold": config.pipeline.accept_threshold,
                    "ambiguity_margin": config.pipeline.ambiguity_margin,
                })
            );
        }
    }

    Ok(())
}

/// Decode images into frames, in order.
fn read_frames(source_id: &str, images: Vec<PathBuf>) -> Result<Vec<Frame>> {
    let mut source = ImageSetSource::new(source_id, images);
    let mut frames = Vec::new();
    while let Some(frame) = source.next_frame()? {
        frames.push(frame);
    }
    anyhow::ensure!(!frames.is_empty(), "no frames decoded");
    Ok(frames)
}

fn report_decision(store: &SqliteStore, result: &facia_core::MatchResult) -> Result<()> {
    let best = result.best.as_ref();
    match result.decision {
        Decision::Accepted => {
            if let Some(best) = best {
                let label = store
                    .list_identities()?
                    .into_iter()
                    .find(|i| i.id == best.identity_id)
                    .map(|i| i.label)
                    .unwrap_or_default();
                store.record_access(
                    Some(&best.identity_id),
                    "identification",
                    "success",
                    Some(best.distance),
                )?;
                println!("accepted: {} '{label}' (distance {:.4})", best.identity_id, best.distance);
            }
        }
        Decision::Ambiguous => {
            store.record_access(None, "identification", "failure", best.map(|b| b.distance))?;
            println!("ambiguous between {} close candidates:", result.runners_up.len() + 1);
            if let Some(best) = best {
                println!("  {}  {:.4}", best.identity_id, best.distance);
            }
            for candidate in &result.runners_up {
                println!("  {}  {:.4}", candidate.identity_id, candidate.distance);
            }
        }
        Decision::Rejected => {
            store.record_access(None, "identification", "failure", best.map(|b| b.distance))?;
            match best {
                Some(best) => println!("unknown subject (closest distance {:.4})", best.distance),
                None => println!("unknown subject (gallery is empty)"),
            }
        }
    }
    Ok(())
}
