use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use extractor::RequestedMode;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Increase log verbosity (-v: debug, -vv: trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Extract structured records from receipt images
    Scan {
        /// Receipt image files to process
        #[arg(required = true)]
        images: Vec<PathBuf>,

        /// Extraction path; overrides RECESCAN_DEFAULT_MODE
        #[arg(short, long, value_enum)]
        mode: Option<ModeArg>,

        /// Also export the extracted records as CSV to this file or directory
        #[arg(long)]
        csv: Option<PathBuf>,

        /// Print one JSON object per line instead of pretty-printing
        #[arg(long)]
        compact: bool,
    },
    /// Report which extraction paths this build and environment support
    Capabilities,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    /// Vision model first, OCR fallback
    Auto,
    /// Vision model only
    Ai,
    /// OCR and text heuristics only
    Ocr,
}

impl From<ModeArg> for RequestedMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Auto => RequestedMode::Auto,
            ModeArg::Ai => RequestedMode::Ai,
            ModeArg::Ocr => RequestedMode::Ocr,
        }
    }
}
