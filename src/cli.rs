//! # Command-Line Interface Module
//!
//! Argument parsing for the interceptor binary, using the `clap` derive
//! API. The surface is deliberately small: everything interesting lives
//! in the configuration file; the flags here select that file and shape
//! logging.

use clap::{
    builder::styling::{AnsiColor, Styles},
    Parser,
};
use std::path::PathBuf;

/// Defines the styles for the help message to replicate clap v3's appearance.
fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Args {
    /// Path to the YAML configuration file
    ///
    /// Carries the listener endpoint, the payload-handling rules
    /// (block/delay/insert/replay, global and per direction) and the
    /// attack-mode settings.
    #[arg(long, value_name = "PATH")]
    pub config: PathBuf,

    /// Launch the terminal UI front-end
    ///
    /// The UI runs alongside the data plane and is handled by its own
    /// component; the proxy core behaves identically with or without it.
    #[arg(long)]
    pub gui: bool,

    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress the colorized stdout log, keeping only the detail log
    #[arg(short, long)]
    pub quiet: bool,

    /// Detail log destination: a file path, or "stderr"
    ///
    /// Defaults to a daily-rolling file in the working directory.
    #[arg(long, value_name = "PATH")]
    pub log_file: Option<String>,
}
