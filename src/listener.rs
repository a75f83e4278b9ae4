//! Shutdown listener running inside the supervised process
//!
//! Accepts connections one at a time until a client sends the shared
//! secret. Wrong secrets, silent clients and early disconnects are logged
//! and ignored; the first match is answered with `done` and ends the
//! listener, which is the supervisor's cue to stop the service.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpSocket, TcpStream};

use crate::error::SupervisorError;
use crate::logging::*;
use crate::protocol::{self, Endpoint};

/// Pending connections kept by the kernel; enough for accidental duplicates
pub const LISTEN_BACKLOG: u32 = 10;

/// Time a connected client gets to send its line
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of a single accepted connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt {
	/// The secret matched; the listener is done
	Matched,
	/// A complete line arrived but did not match
	Mismatch,
	/// The client closed without sending a complete line
	Disconnected,
	/// The client stayed silent past the read timeout
	TimedOut,
}

/// Bound, not yet running, shutdown listener
pub struct ShutdownListener {
	listener: TcpListener,
	secret: String,
	read_timeout: Duration,
}

impl ShutdownListener {
	/// Bind the shutdown endpoint. Failing here is fatal for the process.
	pub async fn bind(endpoint: &Endpoint, secret: impl Into<String>) -> Result<Self, SupervisorError> {
		let bind_err =
			|source: io::Error| SupervisorError::ListenerBind { endpoint: endpoint.to_string(), source };

		let addr = endpoint.resolve().await.map_err(bind_err)?[0];
		let socket = if addr.is_ipv4() { TcpSocket::new_v4() } else { TcpSocket::new_v6() }
			.map_err(bind_err)?;
		#[cfg(unix)]
		socket.set_reuseaddr(true).map_err(bind_err)?;
		socket.bind(addr).map_err(bind_err)?;
		let listener = socket.listen(LISTEN_BACKLOG).map_err(bind_err)?;

		info!("Shutdown listener bound to {}", listener.local_addr().map_err(bind_err)?);
		Ok(ShutdownListener { listener, secret: secret.into(), read_timeout: READ_TIMEOUT })
	}

	/// Override the per-connection read timeout
	pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
		self.read_timeout = timeout;
		self
	}

	pub fn local_addr(&self) -> io::Result<SocketAddr> {
		self.listener.local_addr()
	}

	/// Accept connections until the secret arrives.
	///
	/// Returns once, after the matching client has been answered. The socket
	/// is closed on return, so later connection attempts are refused.
	pub async fn run(self) -> Result<(), SupervisorError> {
		loop {
			let (stream, peer) =
				self.listener.accept().await.map_err(|source| SupervisorError::ListenerFailed { source })?;
			debug!("Shutdown connection from {}", peer);

			match self.handle(stream).await {
				Attempt::Matched => {
					info!("Received shutdown message from {}", peer);
					return Ok(());
				}
				Attempt::Mismatch => warn!("Ignoring invalid shutdown message from {}", peer),
				Attempt::Disconnected => warn!("Connection lost to unresponsive client {}", peer),
				Attempt::TimedOut => warn!("Shutdown client {} sent nothing within {:?}", peer, self.read_timeout),
			}
		}
	}

	async fn handle(&self, stream: TcpStream) -> Attempt {
		let mut reader = BufReader::new(stream);
		let line = match tokio::time::timeout(self.read_timeout, protocol::read_line(&mut reader)).await {
			Err(_) => return Attempt::TimedOut,
			Ok(Err(e)) => {
				debug!("Read from shutdown client failed: {}", e);
				return Attempt::Disconnected;
			}
			Ok(Ok(None)) => return Attempt::Disconnected,
			Ok(Ok(Some(line))) => line,
		};

		if !protocol::secret_matches(&self.secret, &line) {
			return Attempt::Mismatch;
		}

		let mut stream = reader.into_inner();
		let reply = async {
			stream.write_all(protocol::confirmation().as_bytes()).await?;
			stream.flush().await?;
			stream.shutdown().await
		};
		if let Err(e) = reply.await {
			// the shutdown still proceeds, the client just won't hear about it
			error!("Unable to confirm shutdown: {}", e);
		}
		Attempt::Matched
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::io::AsyncReadExt;

	async fn bind_local(secret: &str) -> (ShutdownListener, SocketAddr) {
		let listener = ShutdownListener::bind(&Endpoint::new("127.0.0.1", 0), secret).await.unwrap();
		let addr = listener.local_addr().unwrap();
		(listener, addr)
	}

	async fn send(addr: SocketAddr, payload: &[u8]) -> String {
		let mut stream = TcpStream::connect(addr).await.unwrap();
		stream.write_all(payload).await.unwrap();
		let mut reply = String::new();
		let _ = stream.read_to_string(&mut reply).await;
		reply
	}

	#[tokio::test]
	async fn test_match_replies_done_and_finishes() {
		let (listener, addr) = bind_local("shutdown").await;
		let task = tokio::spawn(listener.run());

		assert_eq!(send(addr, b"shutdown\r\n").await, "done\r\n");
		task.await.unwrap().unwrap();

		assert!(TcpStream::connect(addr).await.is_err());
	}

	#[tokio::test]
	async fn test_trailing_space_does_not_match() {
		let (listener, addr) = bind_local("shutdown").await;
		let task = tokio::spawn(listener.run());

		assert_eq!(send(addr, b"shutdown \r\n").await, "");
		assert!(!task.is_finished());

		assert_eq!(send(addr, b"shutdown\r\n").await, "done\r\n");
		task.await.unwrap().unwrap();
	}

	#[tokio::test]
	async fn test_partial_line_then_close_is_ignored() {
		let (listener, addr) = bind_local("shutdown").await;
		let task = tokio::spawn(listener.run());

		// no terminator before EOF
		let mut stream = TcpStream::connect(addr).await.unwrap();
		stream.write_all(b"shutdown").await.unwrap();
		stream.shutdown().await.unwrap();
		let mut reply = String::new();
		let _ = stream.read_to_string(&mut reply).await;
		assert_eq!(reply, "");

		assert_eq!(send(addr, b"shutdown\n").await, "done\r\n");
		task.await.unwrap().unwrap();
	}

	#[tokio::test]
	async fn test_silent_client_times_out() {
		let (listener, addr) = bind_local("shutdown").await;
		let task = tokio::spawn(listener.with_read_timeout(Duration::from_millis(100)).run());

		let mut silent = TcpStream::connect(addr).await.unwrap();
		let mut reply = String::new();
		let _ = silent.read_to_string(&mut reply).await;
		assert_eq!(reply, "");

		assert_eq!(send(addr, b"shutdown\r\n").await, "done\r\n");
		task.await.unwrap().unwrap();
	}

	#[tokio::test]
	async fn test_bind_conflict_is_reported() {
		let (_listener, addr) = bind_local("shutdown").await;
		let err = ShutdownListener::bind(&Endpoint::from(addr), "shutdown").await.err().unwrap();
		assert!(matches!(err, SupervisorError::ListenerBind { .. }));
	}
}

// vim: ts=4
