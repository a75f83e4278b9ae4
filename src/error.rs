//! Error types for zkharness operations

use std::error::Error;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use crate::runner::ServiceState;

/// Main error type for start/stop/launch operations
#[derive(Debug)]
pub enum SupervisorError {
	/// The child process could not be forked
	SpawnFailed { cmd: String, source: io::Error },

	/// The shutdown listener could not bind its endpoint
	ListenerBind { endpoint: String, source: io::Error },

	/// The service never answered on its client endpoint
	ReadinessTimeout { endpoint: String, attempts: u32, timeout: Duration },

	/// Accepting on the shutdown socket failed
	ListenerFailed { source: io::Error },

	/// The wrapped service reported a failure
	ServiceFailed { message: String },

	/// Stdio of the child process was not piped
	StdioUnavailable { what: String },

	/// Instance directory or config artifact could not be prepared
	Layout { path: PathBuf, source: io::Error },

	/// Invalid configuration
	Config(ConfigError),

	/// Illegal service state transition
	State(StateError),

	/// I/O error
	Io(io::Error),
}

impl fmt::Display for SupervisorError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			SupervisorError::SpawnFailed { cmd, source } => {
				write!(f, "Failed to spawn '{}': {}", cmd, source)
			}
			SupervisorError::ListenerBind { endpoint, source } => {
				write!(f, "Cannot bind shutdown listener on {}: {}", endpoint, source)
			}
			SupervisorError::ReadinessTimeout { endpoint, attempts, timeout } => write!(
				f,
				"Service at {} not ready after {} attempts ({}s)",
				endpoint,
				attempts,
				timeout.as_secs()
			),
			SupervisorError::ListenerFailed { source } => {
				write!(f, "Shutdown listener failed: {}", source)
			}
			SupervisorError::ServiceFailed { message } => {
				write!(f, "Service failed: {}", message)
			}
			SupervisorError::StdioUnavailable { what } => {
				write!(f, "Stdio unavailable: {}", what)
			}
			SupervisorError::Layout { path, source } => {
				write!(f, "Cannot prepare {}: {}", path.display(), source)
			}
			SupervisorError::Config(e) => write!(f, "Configuration error: {}", e),
			SupervisorError::State(e) => write!(f, "State error: {}", e),
			SupervisorError::Io(e) => write!(f, "I/O error: {}", e),
		}
	}
}

impl Error for SupervisorError {
	fn source(&self) -> Option<&(dyn Error + 'static)> {
		match self {
			SupervisorError::SpawnFailed { source, .. }
			| SupervisorError::ListenerBind { source, .. }
			| SupervisorError::ListenerFailed { source }
			| SupervisorError::Layout { source, .. } => Some(source),
			SupervisorError::Io(e) => Some(e),
			_ => None,
		}
	}
}

impl From<io::Error> for SupervisorError {
	fn from(e: io::Error) -> Self {
		SupervisorError::Io(e)
	}
}

impl From<ConfigError> for SupervisorError {
	fn from(e: ConfigError) -> Self {
		SupervisorError::Config(e)
	}
}

impl From<StateError> for SupervisorError {
	fn from(e: StateError) -> Self {
		SupervisorError::State(e)
	}
}

/// Configuration loading and validation errors
#[derive(Debug)]
pub enum ConfigError {
	/// Config file could not be read
	ReadFailed { path: PathBuf, source: io::Error },

	/// Config file is not valid TOML for [`crate::config::Config`]
	ParseFailed { path: PathBuf, message: String },

	/// A value is out of its accepted range
	Invalid { field: &'static str, message: String },
}

impl fmt::Display for ConfigError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ConfigError::ReadFailed { path, source } => {
				write!(f, "Cannot read {}: {}", path.display(), source)
			}
			ConfigError::ParseFailed { path, message } => {
				write!(f, "Cannot parse {}: {}", path.display(), message)
			}
			ConfigError::Invalid { field, message } => write!(f, "{}: {}", field, message),
		}
	}
}

impl Error for ConfigError {}

/// Rejected service state transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateError {
	pub from: ServiceState,
	pub to: ServiceState,
}

impl fmt::Display for StateError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Illegal transition {} -> {}", self.from, self.to)
	}
}

impl Error for StateError {}

// vim: ts=4
