//! Configuration for zkharness
//!
//! Priority chain:
//! 1. Built-in defaults (`Config::default()`)
//! 2. Config file (TOML, `-c/--config`)
//! 3. CLI flags (highest priority)

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::launcher::DEFAULT_VERIFY_LINES;
use crate::protocol::Endpoint;

/// Settings for starting, supervising and stopping one service instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
	// ========================================================================
	// ENDPOINTS
	// ========================================================================
	/// Local address of the service; the shutdown listener binds here too
	pub client_port_address: String,

	/// Port on which the service accepts clients
	pub client_port: u16,

	/// Port on which the shutdown listener waits for the secret
	pub shutdown_port: u16,

	/// Secret that triggers a shutdown when received on the shutdown port
	pub shutdown_string: String,

	// ========================================================================
	// TIMING
	// ========================================================================
	/// Seconds the controller waits for `done` after sending the secret (0 = don't wait)
	pub shutdown_wait: u64,

	/// Seconds the supervised process grants the service to stop before forcing exit
	pub grace_period: u64,

	/// Lines of child output scanned for the launch token (0 = unbounded)
	pub verify_lines: usize,

	/// Readiness probe against the client endpoint, off when absent
	pub readiness: Option<ReadinessConfig>,

	// ========================================================================
	// SERVICE TUNING (written to zoo.cfg)
	// ========================================================================
	pub tick_time: u32,
	pub init_limit: u32,
	pub sync_limit: u32,
	pub max_client_cnxns: u32,

	// ========================================================================
	// LAYOUT & LAUNCH
	// ========================================================================
	/// Root under which instance directories are created
	pub base_dir: PathBuf,

	/// Keep data and state from a previous run instead of wiping it
	pub keep_previous_state: bool,

	/// Executable used for the supervised process (defaults to this binary)
	pub launcher: Option<PathBuf>,

	/// Extra arguments placed before the `launch` subcommand
	pub launch_args: Vec<String>,

	/// The wrapped service
	pub service: ServiceConfig,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			client_port_address: "127.0.0.1".to_string(),
			client_port: 2181,
			shutdown_port: 52000,
			shutdown_string: "shutdown".to_string(),

			shutdown_wait: 30,
			grace_period: 5,
			verify_lines: DEFAULT_VERIFY_LINES,
			readiness: None,

			tick_time: 2000,
			init_limit: 10,
			sync_limit: 5,
			max_client_cnxns: 100,

			base_dir: PathBuf::from("target/zmp"),
			keep_previous_state: false,
			launcher: None,
			launch_args: Vec::new(),
			service: ServiceConfig::default(),
		}
	}
}

impl Config {
	/// Load a TOML config file on top of the defaults and validate it
	pub fn load(path: &Path) -> Result<Self, ConfigError> {
		let text = fs::read_to_string(path)
			.map_err(|source| ConfigError::ReadFailed { path: path.to_path_buf(), source })?;
		let config = Self::from_toml(&text)
			.map_err(|e| ConfigError::ParseFailed { path: path.to_path_buf(), message: e.to_string() })?;
		config.validate()?;
		Ok(config)
	}

	pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
		toml::from_str(text)
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		validate_port("shutdownPort", self.shutdown_port)?;
		validate_port("clientPort", self.client_port)?;
		validate_secret(&self.shutdown_string)?;
		if self.client_port_address.trim().is_empty() {
			return Err(ConfigError::Invalid {
				field: "clientPortAddress",
				message: "address must not be empty".to_string(),
			});
		}
		if self.grace_period == 0 {
			return Err(ConfigError::Invalid {
				field: "gracePeriod",
				message: "grace period must be greater than 0".to_string(),
			});
		}
		if self.service.command.is_empty() {
			return Err(ConfigError::Invalid {
				field: "service.command",
				message: "service command must not be empty".to_string(),
			});
		}
		if let Some(readiness) = &self.readiness {
			readiness.validate()?;
		}
		Ok(())
	}

	pub fn shutdown_endpoint(&self) -> Endpoint {
		Endpoint::new(self.client_port_address.clone(), self.shutdown_port)
	}

	pub fn client_endpoint(&self) -> Endpoint {
		Endpoint::new(self.client_port_address.clone(), self.client_port)
	}

	/// Token scan cap; `None` means scan without a bound
	pub fn verify_limit(&self) -> Option<usize> {
		if self.verify_lines == 0 {
			None
		} else {
			Some(self.verify_lines)
		}
	}

	pub fn shutdown_wait(&self) -> Duration {
		Duration::from_secs(self.shutdown_wait)
	}

	pub fn grace_period(&self) -> Duration {
		Duration::from_secs(self.grace_period)
	}
}

/// Ports must be non-zero
pub fn validate_port(field: &'static str, port: u16) -> Result<(), ConfigError> {
	if port == 0 {
		return Err(ConfigError::Invalid { field, message: "port must be greater than 0".to_string() });
	}
	Ok(())
}

/// The secret travels as one line, so it can't be empty or contain breaks
pub fn validate_secret(secret: &str) -> Result<(), ConfigError> {
	if secret.is_empty() {
		return Err(ConfigError::Invalid {
			field: "shutdownString",
			message: "shutdown string must not be empty".to_string(),
		});
	}
	if secret.contains('\n') || secret.contains('\r') {
		return Err(ConfigError::Invalid {
			field: "shutdownString",
			message: "shutdown string must not contain line breaks".to_string(),
		});
	}
	Ok(())
}

/// The service wrapped by the supervised process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServiceConfig {
	/// Display name used in logs and the launch token line
	pub name: String,

	/// Program and arguments; the generated zoo.cfg path is appended
	pub command: Vec<String>,
}

impl Default for ServiceConfig {
	fn default() -> Self {
		ServiceConfig {
			name: "ZooKeeper".to_string(),
			command: vec!["zkServer.sh".to_string(), "start-foreground".to_string()],
		}
	}
}

/// Probe kind used while waiting for readiness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ReadinessCheck {
	/// A TCP connection is accepted
	#[default]
	Connect,
	/// The `ruok` four-letter command is answered with `imok`
	Ruok,
}

/// Bounded readiness polling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReadinessConfig {
	/// Pause between attempts in milliseconds
	pub interval_ms: u64,

	/// Total time allowed before giving up, in seconds
	pub timeout_secs: u64,

	pub check: ReadinessCheck,
}

impl Default for ReadinessConfig {
	fn default() -> Self {
		ReadinessConfig { interval_ms: 1000, timeout_secs: 60, check: ReadinessCheck::Connect }
	}
}

impl ReadinessConfig {
	pub fn interval(&self) -> Duration {
		Duration::from_millis(self.interval_ms)
	}

	pub fn timeout(&self) -> Duration {
		Duration::from_secs(self.timeout_secs)
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.interval_ms == 0 {
			return Err(ConfigError::Invalid {
				field: "readiness.intervalMs",
				message: "interval must be greater than 0".to_string(),
			});
		}
		if self.timeout_secs == 0 {
			return Err(ConfigError::Invalid {
				field: "readiness.timeoutSecs",
				message: "timeout must be greater than 0".to_string(),
			});
		}
		Ok(())
	}
}


// vim: ts=4
