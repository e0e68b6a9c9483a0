//! Batch ingestion of files and directory trees.
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::json;
use sitedocs::{
    config, logging,
    pipeline::{ProcessOptions, source::has_supported_extension},
    runtime::Runtime,
};
use walkdir::WalkDir;

#[derive(Parser)]
#[command(
    name = "sitedocs-ingest",
    about = "Ingest construction documents from the command line"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Process files; directories are walked recursively.
    Ingest {
        /// Files or directories.
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Reprocess content that is already indexed.
        #[arg(long)]
        force: bool,
        /// Override WORKER_CONCURRENCY.
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Run one tool through the dispatcher and print its envelope.
    Tool {
        /// Tool name, e.g. document_status.
        name: String,
        /// JSON object with the tool arguments.
        #[arg(long, default_value = "{}")]
        args: String,
    },
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    config::init_config();
    logging::init_tracing();

    match cli.command {
        Command::Ingest {
            paths,
            force,
            concurrency,
        } => ingest(paths, force, concurrency).await,
        Command::Tool { name, args } => run_tool(&name, &args).await,
    }
}

async fn ingest(paths: Vec<PathBuf>, force: bool, concurrency: Option<usize>) -> Result<()> {
    let mut config = config::get_config().clone();
    if let Some(concurrency) = concurrency {
        config.worker_concurrency = concurrency;
    }
    let runtime = Runtime::build(&config)
        .await
        .context("failed to build runtime")?;

    let files = collect_files(&paths)?;
    if files.is_empty() {
        bail!("no supported documents found under the given paths");
    }
    tracing::info!(files = files.len(), force, "Starting batch ingestion");

    let options = ProcessOptions {
        force,
        ..ProcessOptions::default()
    };
    let mut failures = 0usize;
    for (path, result) in runtime.pipeline.process_many(files, options).await {
        let line = match result {
            Ok(record) => json!({
                "file": path.display().to_string(),
                "document_id": record.id.to_string(),
                "status": record.status,
                "doc_type": record.doc_type,
                "chunks": record.chunk_count,
                "warnings": record.warnings,
            }),
            Err(failure) => {
                failures += 1;
                json!({
                    "file": path.display().to_string(),
                    "document_id": failure.document_id.map(|id| id.to_string()),
                    "status": "error",
                    "error_category": failure.category(),
                    "error": failure.source.to_string(),
                    "suggestion": failure.suggestion(),
                })
            }
        };
        println!("{line}");
    }

    let snapshot = runtime.metrics.snapshot();
    eprintln!(
        "indexed {} | rejected {} | failed {} | duplicates {} | chunks {}",
        snapshot.documents_indexed,
        snapshot.documents_rejected,
        snapshot.documents_failed,
        snapshot.duplicates_skipped,
        snapshot.chunks_indexed
    );
    if failures > 0 {
        bail!("{failures} document(s) were not indexed");
    }
    Ok(())
}

async fn run_tool(name: &str, args: &str) -> Result<()> {
    let arguments: serde_json::Value =
        serde_json::from_str(args).context("--args must be a JSON object")?;
    let runtime = Runtime::build(config::get_config())
        .await
        .context("failed to build runtime")?;
    let envelope = runtime.dispatcher.execute(name, arguments).await;
    println!(
        "{}",
        serde_json::to_string_pretty(&envelope).context("failed to render envelope")?
    );
    if !envelope.is_ok() {
        bail!(
            "{} failed: {}",
            name,
            envelope.error.unwrap_or_else(|| "unknown error".into())
        );
    }
    Ok(())
}

fn collect_files(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for root in paths {
        if root.is_file() {
            files.push(root.clone());
            continue;
        }
        if !root.exists() {
            bail!("{} does not exist", root.display());
        }
        for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
            let entry =
                entry.with_context(|| format!("failed to walk {}", root.display()))?;
            if entry.file_type().is_file() && has_supported_extension(entry.path()) {
                files.push(entry.into_path());
            }
        }
    }
    Ok(files)
}
