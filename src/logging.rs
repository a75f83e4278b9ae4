//! Logging prelude module for convenient access to tracing macros.
//!
//! # Usage
//!
//! ```ignore
//! use crate::logging::*;
//!
//! info!("Starting service");
//! warn!("Unable to verify service started");
//! ```

use std::fs::OpenOptions;
use std::io;
use std::path::Path;

pub use tracing::{debug, error, info, trace, warn};

/// Name of the log file written by the supervised process under `--logdir`
pub const LOG_FILE_NAME: &str = "zkharness.log";

fn env_filter() -> tracing_subscriber::EnvFilter {
	tracing_subscriber::EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

/// Initialize the tracing subscriber with environment filter support.
///
/// By default, logs at INFO level and above are displayed. Control the log level
/// with the `RUST_LOG` environment variable:
///
/// ```bash
/// RUST_LOG=debug zkharness start
/// RUST_LOG=zkharness::listener=trace zkharness launch --shutdownPort 52000
/// ```
pub fn init_tracing() {
	tracing_subscriber::fmt().with_env_filter(env_filter()).with_writer(io::stderr).init();
}

/// Initialize tracing into `dir/zkharness.log`.
///
/// The supervised process logs here when started with `--logdir`, so its
/// diagnostics survive after the controller stops reading its stderr.
pub fn init_tracing_to(dir: &Path) -> io::Result<()> {
	std::fs::create_dir_all(dir)?;
	let file = OpenOptions::new().create(true).append(true).open(dir.join(LOG_FILE_NAME))?;
	tracing_subscriber::fmt()
		.with_env_filter(env_filter())
		.with_ansi(false)
		.with_writer(std::sync::Mutex::new(file))
		.init();
	Ok(())
}

// vim: ts=4
