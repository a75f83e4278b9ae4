//! # zkharness - Fork, verify and stop a coordination service
//!
//! zkharness starts a long-running service (ZooKeeper by default) for a
//! build or test harness, confirms it actually started, and later shuts it
//! down through a private socket handshake with a bounded grace period.
//!
//! ## Starting
//!
//! ```rust,ignore
//! use zkharness::launcher::{self, LaunchCommand, StartOptions, TokioSpawner};
//!
//! let token = launcher::new_token();
//! let command = LaunchCommand::new("zkharness")
//!     .args(["launch", "--shutdownPort", "52000", "--token", &token])
//!     .args(["--", "zkServer.sh", "start-foreground"]);
//! let outcome = launcher::start(&TokioSpawner, &command, &token, StartOptions::default()).await?;
//! if !outcome.verified {
//!     eprintln!("could not verify startup");
//! }
//! ```
//!
//! ## Stopping
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use zkharness::controller;
//! use zkharness::protocol::Endpoint;
//!
//! let outcome = controller::stop(&Endpoint::new("127.0.0.1", 52000), "shutdown", Duration::from_secs(30)).await?;
//! println!("{}", outcome);
//! ```

pub mod config;
pub mod controller;
pub mod error;
pub mod launcher;
pub mod layout;
pub mod listener;
pub mod logging;
pub mod protocol;
pub mod runner;
pub mod service;
pub mod supervised;

// Re-export commonly used types and functions
pub use config::Config;
pub use controller::StopOutcome;
pub use error::{ConfigError, StateError, SupervisorError};
pub use launcher::{StartOutcome, SupervisedProcess};
pub use protocol::Endpoint;
pub use runner::{Service, ServiceRunner, ServiceState, StopResult};

// vim: ts=4
