use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use hdb_core::DatasetKind;
use hdb_sync::EnrichOutcome;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Parser)]
#[command(name = "hdb-cli")]
#[command(about = "HDB housing transactions and address enrichment pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create tables and publish column descriptions.
    Migrate,
    /// Replace one transaction table with a fresh dataset snapshot.
    Ingest {
        #[arg(value_enum)]
        dataset: DatasetArg,
    },
    /// Geocode addresses not yet in the address details table.
    Enrich,
    /// Ingest both datasets, then enrich.
    Run,
    /// Run the pipeline on its cron schedule until interrupted.
    Schedule,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DatasetArg {
    Resale,
    Rental,
}

impl From<DatasetArg> for DatasetKind {
    fn from(arg: DatasetArg) -> Self {
        match arg {
            DatasetArg::Resale => DatasetKind::Resale,
            DatasetArg::Rental => DatasetKind::Rental,
        }
    }
}

fn describe_enrichment(outcome: &EnrichOutcome) -> String {
    match outcome {
        EnrichOutcome::NoOp { observed, known } => {
            format!("status=noop observed={observed} known={known}")
        }
        EnrichOutcome::Enriched(summary) => format!(
            "status=ok missing={} persisted={} unresolved={}",
            summary.missing,
            summary.persisted,
            summary.unresolved.len()
        ),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Migrate => {
            let summary = hdb_sync::run_migrate_from_env().await?;
            println!(
                "status=ok stage=migrate run_id={} metadata_rows={}",
                summary.run_id, summary.metadata_rows
            );
        }
        Commands::Ingest { dataset } => {
            let summary = hdb_sync::run_ingest_from_env(dataset.into()).await?;
            println!(
                "status=ok stage=ingest run_id={} table={} rows={} chunks={} bytes={} source={}",
                summary.run_id,
                summary.table,
                summary.rows,
                summary.chunks,
                summary.source_bytes,
                summary.source_url
            );
        }
        Commands::Enrich => {
            let outcome = hdb_sync::run_enrich_from_env().await?;
            println!("{} stage=enrich", describe_enrichment(&outcome));
        }
        Commands::Run => {
            let summary = hdb_sync::run_all_once_from_env().await?;
            let rows: usize = summary.ingested.iter().map(|s| s.rows).sum();
            println!(
                "status=ok stage=run run_id={} ingested_rows={} enrich=[{}] reports={}",
                summary.run_id,
                rows,
                describe_enrichment(&summary.enrichment),
                summary.reports_dir.display()
            );
        }
        Commands::Schedule => {
            hdb_sync::run_scheduler_from_env().await?;
            println!("status=ok stage=schedule");
        }
    }

    Ok(())
}
