use clap::{Args as ClapArgs, Parser, Subcommand};
use model::Severity;
use std::path::PathBuf;

fn parse_severity(s: &str) -> Result<Severity, String> {
    s.parse()
}

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Static analysis for Infrastructure-as-Code artifacts",
    subcommand_required = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Scan a directory tree for security misconfigurations
    Scan(ScanArgs),
}

#[derive(ClapArgs)]
pub struct ScanArgs {
    /// Path to scan (file or directory)
    pub path: PathBuf,
    /// Path to the query bundle directory
    #[arg(long)]
    pub queries: PathBuf,
    /// Identifier grouping this scan's results; generated when omitted
    #[arg(long = "scan-id")]
    pub scan_id: Option<String>,
    /// Write results as a JSON report to this path
    #[arg(long)]
    pub output: Option<PathBuf>,
    /// Persist scan artifacts as JSON under this directory
    #[arg(long = "storage-dir")]
    pub storage_dir: Option<PathBuf>,
    /// Timeout per query evaluation in milliseconds
    #[arg(long = "timeout-ms")]
    pub timeout_ms: Option<u64>,
    /// Source lines excerpted around each finding
    #[arg(long = "output-lines", default_value_t = 3)]
    pub output_lines: usize,
    /// Exit with error code if findings of this severity or higher exist
    #[arg(long = "fail-on", value_parser = parse_severity)]
    pub fail_on: Option<Severity>,
    /// Enable debug output
    #[arg(long)]
    pub debug: bool,
    /// Suppress non-essential output
    #[arg(long)]
    pub quiet: bool,
}
