//! # Transparent Interception Proxy - Main Entry Point
//!
//! The binary wires the pieces together:
//! 1. **Initialize logging**: detail log (file or stderr) plus a clean
//!    colorized stdout layer, verbosity from `-v` flags
//! 2. **Parse arguments**: a config path and a few logging switches
//! 3. **Load configuration**: listener endpoint, manipulation rules,
//!    attack mode
//! 4. **Publish the rule snapshot** and create the process-wide MITM
//!    machine
//! 5. **Run the acceptor** until ctrl-c, then await connection cleanup
//!
//! Exit codes: 0 on normal shutdown, 1 on a fatal bind or privilege
//! error at the acceptor.

use anyhow::{Context, Result};
use clap::Parser;
use std::time::Instant;
use tcp_interceptor::{
    cli::Args, config::Config, mitm::MitmMachine, proxy, rules::RuleSetHandle, ProxyShared,
};
use tracing::{error, info};

use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

mod logging;
use logging::ConsoleFormatter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Configure logging level based on verbosity flags.
    // This level applies to both the log file and stdout.
    // - default: INFO
    // -v: DEBUG
    // -vv and more: TRACE
    let log_level = match args.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    // Configure the detailed log layer (file or stderr).
    // The guard must be kept alive for the duration of the program for file logging.
    let guard;
    let detailed_log_layer;

    if let Some("stderr") = args.log_file.as_deref() {
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(log_level)
            .boxed();
        guard = None;
    } else {
        let file_appender = match args.log_file.as_deref() {
            Some(path_str) => {
                let log_path = std::path::Path::new(path_str);
                let log_dir = log_path
                    .parent()
                    .unwrap_or_else(|| std::path::Path::new("."));
                let log_filename = log_path
                    .file_name()
                    .unwrap_or_else(|| std::ffi::OsStr::new("tcp_interceptor.log"));
                tracing_appender::rolling::daily(log_dir, log_filename)
            }
            None => tracing_appender::rolling::daily(".", "tcp_interceptor.log"),
        };
        let (non_blocking_writer, file_guard) = tracing_appender::non_blocking(file_appender);
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false) // Disable color codes for the file logger
            .with_filter(log_level)
            .boxed();
        guard = Some(file_guard);
    }

    // Clean, user-facing output on stdout unless --quiet is present.
    let stdout_log = if !args.quiet {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .event_format(ConsoleFormatter)
                .with_filter(log_level),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(detailed_log_layer)
        .with(stdout_log)
        .init();

    // Keep the logging guard alive for the duration of the program.
    // If we don't assign it to a variable, it gets dropped immediately, and file logging stops working.
    let _log_guard = guard;

    info!("Starting TCP interceptor v{}", tcp_interceptor::VERSION);
    if args.gui {
        // The terminal UI is driven by its own component; nothing in the
        // data plane changes.
        info!("Terminal UI requested");
    }

    let config = Config::load(&args.config)
        .with_context(|| format!("loading configuration from {:?}", args.config))?;
    let listen = config.listen_addr().context("resolving listener address")?;

    let rules = RuleSetHandle::new(config.build_rules());
    let mitm = MitmMachine::new(config.mitm_config());

    let shared = ProxyShared {
        rules,
        mitm,
        process_start: Instant::now(),
    };

    if let Err(err) = proxy::run(listen, shared).await {
        error!("{err}");
        // A bind or privilege failure at the acceptor is the one fatal
        // condition; everything below it is contained per connection.
        std::process::exit(1);
    }

    info!("Proxy shutdown complete");
    Ok(())
}
