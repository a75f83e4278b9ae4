//! Client side of the shutdown handshake

use std::fmt;
use std::io;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::error::SupervisorError;
use crate::logging::*;
use crate::protocol::{self, Endpoint};

/// Upper bound for establishing the TCP connection
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How a stop request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
	/// The listener answered `done`
	Confirmed,
	/// The message was sent and no confirmation was requested
	Sent,
	/// Nothing listens on the endpoint; the service is not running
	AlreadyStopped,
	/// No `done` arrived in time. The shutdown may still have happened.
	ConfirmationTimeout,
	/// The listener closed the connection without confirming
	Unconfirmed,
}

impl StopOutcome {
	/// Whether the caller can treat the service as stopped (or stopping)
	pub fn is_success(self) -> bool {
		matches!(self, StopOutcome::Confirmed | StopOutcome::Sent | StopOutcome::AlreadyStopped)
	}
}

impl fmt::Display for StopOutcome {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			StopOutcome::Confirmed => write!(f, "shutdown confirmed"),
			StopOutcome::Sent => write!(f, "shutdown message sent"),
			StopOutcome::AlreadyStopped => write!(f, "service not running"),
			StopOutcome::ConfirmationTimeout => write!(f, "no confirmation received in time"),
			StopOutcome::Unconfirmed => write!(f, "connection closed without confirmation"),
		}
	}
}

/// Ask the listener at `endpoint` to shut the service down.
///
/// With a zero `wait` the message is sent and the call returns without
/// reading. Otherwise response lines are read until `done`, end of stream,
/// or `wait` elapses.
pub async fn stop(endpoint: &Endpoint, secret: &str, wait: Duration) -> Result<StopOutcome, SupervisorError> {
	let mut stream = match connect(endpoint).await {
		Ok(stream) => stream,
		Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
			info!("Service not running: nothing listens on {}", endpoint);
			return Ok(StopOutcome::AlreadyStopped);
		}
		Err(e) => return Err(SupervisorError::Io(e)),
	};

	stream.write_all(protocol::request(secret).as_bytes()).await?;
	stream.flush().await?;
	info!("Shutdown message sent to {}", endpoint);

	if wait.is_zero() {
		return Ok(StopOutcome::Sent);
	}

	let mut reader = BufReader::new(stream);
	let confirmation = async {
		while let Some(line) = protocol::read_line(&mut reader).await? {
			if protocol::is_confirmation(&line) {
				return Ok(true);
			}
			debug!("Ignoring response line {:?}", line);
		}
		Ok::<bool, io::Error>(false)
	};

	match tokio::time::timeout(wait, confirmation).await {
		Ok(Ok(true)) => {
			info!("Shutdown response received: success");
			Ok(StopOutcome::Confirmed)
		}
		Ok(Ok(false)) => {
			warn!("Listener at {} closed the connection without confirming", endpoint);
			Ok(StopOutcome::Unconfirmed)
		}
		Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionReset => {
			warn!("Listener at {} reset the connection without confirming", endpoint);
			Ok(StopOutcome::Unconfirmed)
		}
		Ok(Err(e)) => Err(SupervisorError::Io(e)),
		Err(_) => {
			warn!("Shutdown response not received within {}s", wait.as_secs());
			Ok(StopOutcome::ConfirmationTimeout)
		}
	}
}

async fn connect(endpoint: &Endpoint) -> io::Result<TcpStream> {
	match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((endpoint.host.as_str(), endpoint.port))).await {
		Ok(result) => result,
		Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, format!("connecting to {} timed out", endpoint))),
	}
}


// vim: ts=4
