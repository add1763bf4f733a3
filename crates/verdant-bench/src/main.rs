//! verdant-bench: CLI tool for running diagnoses outside the browser.
//!
//! Runs the full analysis (validation, preprocessing, tiered
//! classification, assembly, persistence) on image files, using a native
//! inference thread in place of the web worker. Useful for:
//!
//! - Checking which tier answers and how long each tier takes
//! - Trying model weights and validation/preprocessing settings
//! - Inspecting and editing a local SQLite diagnosis history
//!
//! # Usage
//!
//! ```text
//! cargo run --release --bin verdant-bench -- diagnose [OPTIONS] <IMAGE>...
//! cargo run --release --bin verdant-bench -- history --db history.db
//! ```

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;
use verdant_diagnosis::{FeedbackAnnotation, StaticCatalog};
use verdant_io::{Analyzer, ThreadContextFactory, TokioTimer, VerdantConfig};
use verdant_pipeline::RawImage;
use verdant_store::{ResultStore, SqliteStore, WriteOutcome};
use verdant_worker::ModelSource;

/// Leaf disease diagnosis and history management for verdant.
#[derive(Parser)]
#[command(name = "verdant-bench", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Diagnose one or more leaf photographs.
    Diagnose(DiagnoseArgs),
    /// List saved diagnoses, newest first.
    History {
        /// SQLite history database.
        #[arg(long)]
        db: PathBuf,
        /// Output JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Delete a saved diagnosis and its stored image.
    Delete {
        /// SQLite history database.
        #[arg(long)]
        db: PathBuf,
        /// Diagnosis id.
        id: Uuid,
    },
    /// Record whether a diagnosis was helpful. Replaces earlier feedback.
    Feedback {
        /// SQLite history database.
        #[arg(long)]
        db: PathBuf,
        /// Diagnosis id.
        id: Uuid,
        #[command(flatten)]
        verdict: Verdict,
        /// Optional comment.
        #[arg(long)]
        comment: Option<String>,
    },
}

#[derive(Args)]
struct DiagnoseArgs {
    /// Input images (PNG, JPEG, BMP, WebP).
    #[arg(required = true)]
    images: Vec<PathBuf>,

    /// JSON model weights. Without a model the classical and stub tiers
    /// answer.
    #[arg(long)]
    model: Option<PathBuf>,

    /// Skip the background thread, as if workers were unsupported.
    #[arg(long)]
    no_worker: bool,

    /// SQLite history database. Results are not persisted without one.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Config file (JSON). Flags override its values.
    #[arg(long, conflicts_with = "config_json")]
    config: Option<PathBuf>,

    /// Full config as a JSON string.
    #[arg(long)]
    config_json: Option<String>,

    /// Seed for the stub tier.
    #[arg(long)]
    seed: Option<u64>,

    /// Output each analysis as JSON instead of a report.
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct Verdict {
    /// The diagnosis was helpful.
    #[arg(long)]
    helpful: bool,
    /// The diagnosis was not helpful.
    #[arg(long)]
    not_helpful: bool,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Load the config from `--config`/`--config-json` and apply flag
/// overrides.
fn config_from_cli(args: &DiagnoseArgs) -> Result<VerdantConfig, String> {
    let mut config = if let Some(ref json) = args.config_json {
        VerdantConfig::from_json(json).map_err(|e| format!("Error parsing --config-json: {e}"))?
    } else if let Some(ref path) = args.config {
        let json = std::fs::read_to_string(path)
            .map_err(|e| format!("Error reading {}: {e}", path.display()))?;
        VerdantConfig::from_json(&json).map_err(|e| format!("Error in {}: {e}", path.display()))?
    } else {
        VerdantConfig::default()
    };
    if let Some(ref model) = args.model {
        config.model = Some(ModelSource::Path(model.clone()));
    }
    if args.seed.is_some() {
        config.stub_seed = args.seed;
    }
    Ok(config)
}

fn open_store(db: &Path) -> Result<SqliteStore, String> {
    SqliteStore::open(db).map_err(|e| format!("Error opening {}: {e}", db.display()))
}

/// MIME type from the file extension.
fn mime_type(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("bmp") => "image/bmp",
        _ => "application/octet-stream",
    }
}

async fn diagnose(args: &DiagnoseArgs) -> Result<(), String> {
    let config = config_from_cli(args)?;
    let catalog = StaticCatalog::embedded().map_err(|e| format!("Error loading catalog: {e}"))?;
    let store = match args.db {
        Some(ref db) => ResultStore::connected(open_store(db)?, config.store),
        None => ResultStore::unconfigured(config.store),
    };
    let channel = if args.no_worker {
        None
    } else {
        config.channel(ThreadContextFactory::default(), TokioTimer)
    };
    let analyzer = Analyzer::new(config.orchestrator(channel), store, catalog)
        .with_validation(config.validation.clone())
        .with_preprocess(config.preprocess);

    let mut failures = 0usize;
    for path in &args.images {
        let bytes =
            std::fs::read(path).map_err(|e| format!("Error reading {}: {e}", path.display()))?;
        info!(path = %path.display(), bytes = bytes.len(), "analyzing image");
        let raw = RawImage::new(bytes, mime_type(path));
        let preview = format!("file://{}", path.display());

        match analyzer.analyze(&raw, &preview).await {
            Ok(analysis) if args.json => {
                let json = serde_json::to_string_pretty(&analysis)
                    .map_err(|e| format!("Error serializing analysis: {e}"))?;
                println!("{json}");
            }
            Ok(analysis) => {
                println!("{}", analysis.report());
                println!();
            }
            Err(e) => {
                failures += 1;
                warn!(path = %path.display(), error = %e, "{}", e.user_message());
            }
        }
    }

    if let Some(channel) = analyzer.orchestrator().channel() {
        channel.shutdown().await;
    }
    if failures > 0 {
        return Err(format!("{failures} of {} images failed", args.images.len()));
    }
    Ok(())
}

async fn history(db: &Path, json: bool) -> Result<(), String> {
    let store = ResultStore::connected(open_store(db)?, verdant_store::StoreConfig::default());
    let records = store.list().await;
    if json {
        let out = serde_json::to_string_pretty(&records)
            .map_err(|e| format!("Error serializing history: {e}"))?;
        println!("{out}");
        return Ok(());
    }
    println!(
        "{:<20} {:<36} {:<20} {:>5}  {}",
        "Created", "Id", "Disease", "Conf", "Feedback"
    );
    println!("{}", "-".repeat(96));
    for record in &records {
        let feedback = match &record.feedback {
            Some(f) if f.helpful => "helpful",
            Some(_) => "not helpful",
            None => "",
        };
        println!(
            "{:<20} {:<36} {:<20} {:>4}%  {feedback}",
            record.created_at.format("%Y-%m-%d %H:%M:%S"),
            record.id,
            record.disease_identifier,
            record.confidence_score,
        );
    }
    println!("{} diagnoses", records.len());
    Ok(())
}

fn describe(outcome: &WriteOutcome, id: Uuid) -> Result<(), String> {
    match outcome {
        WriteOutcome::Written => Ok(()),
        WriteOutcome::NotFound => Err(format!("No diagnosis with id {id}")),
        WriteOutcome::Skipped => Err("History store unavailable".to_owned()),
        WriteOutcome::Failed(e) => Err(format!("Write failed: {e}")),
    }
}

async fn run(cli: Cli) -> Result<(), String> {
    match cli.command {
        Command::Diagnose(ref args) => diagnose(args).await,
        Command::History { ref db, json } => history(db, json).await,
        Command::Delete { ref db, id } => {
            let store = ResultStore::connected(open_store(db)?, verdant_store::StoreConfig::default());
            describe(&store.delete(id).await, id)?;
            info!(%id, "diagnosis deleted");
            Ok(())
        }
        Command::Feedback {
            ref db,
            id,
            ref verdict,
            ref comment,
        } => {
            let store = ResultStore::connected(open_store(db)?, verdant_store::StoreConfig::default());
            let feedback = FeedbackAnnotation::new(id, verdict.helpful, comment.clone());
            describe(&store.attach_feedback(&feedback).await, id)?;
            info!(%id, helpful = verdict.helpful, "feedback recorded");
            Ok(())
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    init_tracing();
    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(msg) => {
            eprintln!("{msg}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn mime_from_extension() {
        assert_eq!(mime_type(Path::new("leaf.PNG")), "image/png");
        assert_eq!(mime_type(Path::new("leaf.jpeg")), "image/jpeg");
        assert_eq!(mime_type(Path::new("notes.txt")), "application/octet-stream");
        assert_eq!(mime_type(Path::new("noext")), "application/octet-stream");
    }

    #[test]
    fn flags_override_config_json() {
        let cli = Cli::try_parse_from([
            "verdant-bench",
            "diagnose",
            "leaf.png",
            "--config-json",
            r#"{"stub_seed": 1, "store": {"min_confidence": 80}}"#,
            "--seed",
            "9",
            "--model",
            "weights.json",
        ])
        .unwrap();
        let Command::Diagnose(args) = cli.command else {
            unreachable!("parsed as a different subcommand");
        };
        let config = config_from_cli(&args).unwrap();
        assert_eq!(config.stub_seed, Some(9));
        assert_eq!(config.store.min_confidence, 80);
        assert_eq!(config.model, Some(ModelSource::Path("weights.json".into())));
    }

    #[test]
    fn feedback_needs_exactly_one_verdict() {
        let id = Uuid::nil().to_string();
        let base = ["verdant-bench", "feedback", "--db", "h.db", id.as_str()];
        assert!(Cli::try_parse_from(base).is_err());
        assert!(Cli::try_parse_from(base.iter().copied().chain(["--helpful"])).is_ok());
        assert!(
            Cli::try_parse_from(base.iter().copied().chain(["--helpful", "--not-helpful"]))
                .is_err()
        );
    }
}
