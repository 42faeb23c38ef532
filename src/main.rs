use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use writing_integrity::batch::{BatchItem, BatchProcessor, CancelHandle};
use writing_integrity::db::{self, PgStore};
use writing_integrity::models::StyleDimension;
use writing_integrity::report::{self, ReportInput};
use writing_integrity::source::CorpusSourceMatcher;
use writing_integrity::store::BaselineStore;
use writing_integrity::{EngineConfig, EngineError, IntegrityEngine};

#[derive(Parser)]
#[command(name = "writing-integrity")]
#[command(about = "Writing style baselines and authorship drift detection", long_about = None)]
struct Cli {
    /// JSON engine configuration; defaults apply to anything omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Directory of reference .txt files for source matching
    #[arg(long, global = true)]
    sources: Option<PathBuf>,
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Import writing samples from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Rebuild a student's baseline from stored submissions
    Baseline {
        #[arg(long)]
        student: String,
    },
    /// Score a text for machine authorship
    Detect {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        student: Option<String>,
    },
    /// Fused integrity score for a submission
    Score {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        student: String,
        #[arg(long, default_value = "default")]
        class: String,
    },
    /// Trend of one style measure across a student's submissions
    Trend {
        #[arg(long)]
        student: String,
        #[arg(long, default_value = "grade_level")]
        metric: StyleDimension,
    },
    /// Generate a markdown report for a student
    Report {
        #[arg(long)]
        student: String,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
    /// Score and record every sample in a CSV file
    Batch {
        #[arg(long)]
        csv: PathBuf,
        #[arg(long, default_value = "default")]
        class: String,
        #[arg(long, default_value = "batch.json")]
        out: PathBuf,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = match &cli.config {
        Some(path) => EngineConfig::from_path(path)
            .with_context(|| format!("invalid config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a production Postgres instance")?;
    let store = PgStore::connect(&database_url).await?;

    if let Commands::InitDb = cli.command {
        db::init_db(store.pool()).await?;
        println!("Schema ready.");
        return Ok(());
    }

    let store: Arc<dyn BaselineStore> = Arc::new(store);
    let mut engine = IntegrityEngine::new(config, Arc::clone(&store))?;
    if let Some(dir) = &cli.sources {
        let matcher = CorpusSourceMatcher::from_dir(dir)
            .with_context(|| format!("failed to load sources from {}", dir.display()))?;
        engine = engine.with_source_matcher(Arc::new(matcher));
    }

    match cli.command {
        Commands::InitDb => {}
        Commands::Import { csv } => {
            let inserted = db::import_csv(store.as_ref(), &csv).await?;
            println!("Imported {inserted} samples from {}.", csv.display());
        }
        Commands::Baseline { student } => {
            let baseline = engine.rebuild_baseline(&student).await?;
            println!(
                "Baseline for {} rebuilt from {} samples (confidence {:.2}).",
                student, baseline.sample_count, baseline.confidence
            );
            print_json(&engine.baseline_state(&student).await?)?;
        }
        Commands::Detect { file, student } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let baseline = match &student {
                Some(id) => engine.baseline(id).await?,
                None => None,
            };
            let result = engine.detect(&text, baseline.as_ref()).await?;
            print_json(&result)?;
        }
        Commands::Score {
            file,
            student,
            class,
        } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let score = engine.score_integrity(&text, &student, &class).await?;
            print_json(&score)?;
        }
        Commands::Trend { student, metric } => {
            let series = engine.metric_series(&student, metric).await?;
            let trend = engine.analyze_trend(&series);
            println!(
                "{} for {} is {} ({:+.3} per day, confidence {:.2}).",
                metric.label(),
                student,
                trend.trend,
                trend.rate,
                trend.confidence
            );
            print_json(&trend)?;
        }
        Commands::Report { student, out } => {
            let baseline = engine.baseline(&student).await?;
            let state = engine.baseline_state(&student).await?;
            let history = store
                .submission_history(&student)
                .await
                .context("failed to load submission history")?;

            let mut trends = Vec::new();
            for &dimension in &engine.config().drift.dimensions {
                let series = engine.metric_series(&student, dimension).await?;
                trends.push((dimension, engine.analyze_trend(&series)));
            }
            let latest = match history.last() {
                Some(sample) => match engine.rescore_sample(sample, "default").await {
                    Ok(score) => Some(score),
                    Err(EngineError::Input { .. }) => None,
                    Err(e) => return Err(e.into()),
                },
                None => None,
            };

            let report = report::build_report(&ReportInput {
                student_id: &student,
                generated_at: Utc::now(),
                state,
                baseline: baseline.as_ref(),
                trends: &trends,
                history: &history,
                latest: latest.as_ref(),
            });
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
        Commands::Batch { csv, class, out } => {
            let items: Vec<BatchItem> = db::read_samples_csv(&csv)?
                .into_iter()
                .map(|sample| BatchItem {
                    sample,
                    class_id: class.clone(),
                })
                .collect();

            let cancel = CancelHandle::new();
            let on_interrupt = Arc::clone(&cancel);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_interrupt.cancel("interrupted");
                }
            });

            let processor = BatchProcessor::new(Arc::new(engine));
            let report = processor.run(items, cancel).await;
            std::fs::write(&out, serde_json::to_string_pretty(&report)?)?;
            println!(
                "Scored {} of {} samples; results written to {}.",
                report.scored(),
                report.total,
                out.display()
            );
        }
    }

    Ok(())
}
