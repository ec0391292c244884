mod args;
mod services;
mod sysconfig;

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result, bail};
use clap::Parser;
use log::{info, error, debug};

use extractor::{Extractor, ExtractorConfig, RequestedMode};

use args::{Args, Command};
use services::{MemoryStore, ReceiptService};

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logger with default level set to info; -v flags raise it
    let level = match args.verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();
    debug!("{}", sysconfig::SYSCONFIG.app_info());

    match args.command {
        Command::Scan {
            images,
            mode,
            csv,
            compact,
        } => run_scan(&images, mode.map(Into::into), csv.as_deref(), compact),
        Command::Capabilities => run_capabilities(),
    }
}

fn run_scan(
    images: &[PathBuf],
    mode: Option<RequestedMode>,
    csv: Option<&Path>,
    compact: bool,
) -> Result<()> {
    let extractor = Extractor::from_config(ExtractorConfig::from_env());
    let mut service = ReceiptService::new(MemoryStore::new());

    let mut failures = 0usize;
    for path in images {
        info!("Processing {}", path.display());
        let response = service.ingest_file(&extractor, path, mode);
        if !response.success {
            failures += 1;
            error!("{}: {}", path.display(), response.message);
        }
        let rendered = if compact {
            serde_json::to_string(&response)?
        } else {
            serde_json::to_string_pretty(&response)?
        };
        println!("{rendered}");
    }

    if let Some(csv_path) = csv {
        let (written_to, rows) = service
            .export_csv_file(csv_path)
            .context("CSV export failed")?;
        info!("Exported {} row(s) to {}", rows, written_to.display());
    }

    if failures > 0 {
        bail!("{failures} of {} image(s) failed", images.len());
    }
    Ok(())
}

fn run_capabilities() -> Result<()> {
    let extractor = Extractor::from_config(ExtractorConfig::from_env());
    println!("{}", serde_json::to_string_pretty(&extractor.capabilities())?);
    Ok(())
}
