use std::io;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueHint};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use dls_report::report::{
    generate_calibration, generate_production, ReportJob, DEFAULT_MIRROR_DIR,
};
use dls_report::trim::{trim_history, trim_reports, DEFAULT_MAX_HISTORY_ROWS, DEFAULT_MAX_REPORTS};
use dls_report::{data, load_test_document, TestDocument};

#[derive(Parser, Debug)]
#[command(author, version, about = "DLS test report generation CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate PDF reports from a recorded sample file and test details
    Generate(GenerateArgs),
    /// Cap the historical sample log at a maximum row count
    TrimHistory(TrimHistoryArgs),
    /// Cap the report output directory at a maximum document count
    TrimReports(TrimReportsArgs),
}

#[derive(Parser, Debug)]
struct GenerateArgs {
    /// Recorded sample CSV
    #[arg(value_hint = ValueHint::FilePath)]
    data_file: PathBuf,

    /// Test details JSON document
    #[arg(value_hint = ValueHint::FilePath)]
    details_file: PathBuf,

    /// Directory for the generated PDFs
    #[arg(value_hint = ValueHint::DirPath)]
    output_dir: PathBuf,

    /// Secondary directory finalized PDFs are mirrored into
    #[arg(long, default_value = DEFAULT_MIRROR_DIR, value_hint = ValueHint::DirPath)]
    mirror_dir: PathBuf,

    /// Disable mirroring
    #[arg(long, action = ArgAction::SetTrue)]
    no_mirror: bool,

    /// Logo image placed in the page header
    #[arg(long, default_value = "assets/logo.png", value_hint = ValueHint::FilePath)]
    logo: PathBuf,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct TrimHistoryArgs {
    /// Historical sample log to trim
    #[arg(value_hint = ValueHint::FilePath)]
    history_file: PathBuf,

    /// Maximum number of rows to keep
    #[arg(long, default_value_t = DEFAULT_MAX_HISTORY_ROWS)]
    max_rows: usize,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct TrimReportsArgs {
    /// Report directory to trim
    #[arg(value_hint = ValueHint::DirPath)]
    report_dir: PathBuf,

    /// Maximum number of finalized documents to keep
    #[arg(long, default_value_t = DEFAULT_MAX_REPORTS)]
    max_files: usize,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Generate(args) => args.verbose,
        Command::TrimHistory(args) => args.verbose,
        Command::TrimReports(args) => args.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Generate(args) => handle_generate(args),
        Command::TrimHistory(args) => handle_trim_history(args),
        Command::TrimReports(args) => handle_trim_reports(args),
    }
}

fn handle_generate(args: GenerateArgs) -> Result<()> {
    let document = load_test_document(&args.details_file)
        .with_context(|| format!("failed to load {}", args.details_file.display()))?;

    let job = ReportJob {
        output_dir: args.output_dir.clone(),
        mirror_dir: (!args.no_mirror).then(|| args.mirror_dir.clone()),
        logo_path: Some(args.logo.clone()),
    };

    let outcome = match &document {
        TestDocument::Production {
            metadata,
            channel_info,
        } => {
            let loaded = data::load_samples(&args.data_file, channel_info)
                .with_context(|| format!("failed to load {}", args.data_file.display()))?;
            info!(
                channels = loaded.active_channels.len(),
                rows = loaded.series.len(),
                "loaded production samples"
            );
            generate_production(&loaded.series, metadata, channel_info, &job)
        }
        TestDocument::Calibration {
            metadata,
            calibration,
        } => {
            let series = data::load_calibration_samples(&args.data_file, calibration.channel_index)
                .with_context(|| format!("failed to load {}", args.data_file.display()))?;
            info!(
                channel_index = calibration.channel_index,
                rows = series.len(),
                "loaded calibration samples"
            );
            generate_calibration(&series, metadata, calibration, &job)
        }
    };

    for path in &outcome.written {
        info!("wrote report: {}", path.display());
    }
    for (path, error) in &outcome.failures {
        warn!("failed report {}: {error}", path.display());
    }
    if !outcome.failures.is_empty() {
        bail!(
            "{} of {} reports failed",
            outcome.failures.len(),
            outcome.failures.len() + outcome.written.len()
        );
    }

    info!("report generation completed successfully");
    Ok(())
}

fn handle_trim_history(args: TrimHistoryArgs) -> Result<()> {
    let removed = trim_history(&args.history_file, args.max_rows)
        .with_context(|| format!("failed to trim {}", args.history_file.display()))?;
    info!(removed, "history trim complete");
    Ok(())
}

fn handle_trim_reports(args: TrimReportsArgs) -> Result<()> {
    let deleted = trim_reports(&args.report_dir, args.max_files)
        .with_context(|| format!("failed to trim {}", args.report_dir.display()))?;
    info!(deleted, "report trim complete");
    Ok(())
}
