use anyhow::{Context, Result};
use clap::Parser as ClapParser;
use engine::{Inspector, InspectorConfig};
use model::{CounterTracker, ScanContext};
use parsers::Parser;
use provider::FileSystemSourceProvider;
use resolver::Resolver;
use scan::Service;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use storage::{JsonStorage, MemoryStorage, Storage};
use tracing::info;
use tracing::level_filters::LevelFilter;
use uuid::Uuid;

mod args;
mod output;

use args::{Cli, Commands, ScanArgs};

fn main() {
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Scan(scan_args) => run_scan(scan_args),
    };
    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(2);
    }
}

fn run_scan(args: ScanArgs) -> Result<()> {
    let level = if args.quiet {
        LevelFilter::OFF
    } else if args.debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let scan_id = args
        .scan_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let storage: Arc<dyn Storage> = match &args.storage_dir {
        Some(dir) => Arc::new(JsonStorage::open(dir)?),
        None => Arc::new(MemoryStorage::new()),
    };
    let tracker = Arc::new(CounterTracker::new());
    let inspector = Inspector::from_path(
        &args.queries,
        InspectorConfig {
            query_timeout: args.timeout_ms.map(Duration::from_millis),
            output_lines: args.output_lines,
        },
    )
    .context("failed to load query bundle")?;
    info!(queries = inspector.queries(), path = %args.path.display(), "Scan started");

    let service = Service {
        source_provider: FileSystemSourceProvider::new(args.path.clone()),
        storage,
        parser: Parser::new(),
        inspector,
        tracker: tracker.clone(),
        resolver: Resolver::new(),
    };

    let ctx = ScanContext::new();
    service.start_scan(&ctx, &scan_id)?;

    let vulnerabilities = service.get_vulnerabilities(&ctx, &scan_id)?;
    let summaries = service.get_scan_summary(&ctx, std::slice::from_ref(&scan_id))?;
    if !args.quiet {
        output::print_findings(&vulnerabilities, summaries.first(), &tracker);
    }
    if let Some(path) = &args.output {
        let report = serde_json::to_string_pretty(&vulnerabilities)?;
        fs::write(path, report)
            .with_context(|| format!("failed to write report: {}", path.display()))?;
    }
    info!(findings = vulnerabilities.len(), "Scan completed");

    if let Some(threshold) = args.fail_on {
        if vulnerabilities.iter().any(|v| v.severity >= threshold) {
            std::process::exit(1);
        }
    }
    Ok(())
}
