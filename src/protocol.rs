//! Shutdown handshake wire format
//!
//! A controller connects to the shutdown endpoint and writes a single line
//! holding the shared secret:
//!
//! ```text
//! C: shutdown\r\n
//! S: done\r\n
//! ```
//!
//! The listener answers only on an exact match. Any other line, or a
//! connection closed before a full line arrived, is dropped without a reply.

use std::fmt;
use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Line terminator on both directions of the handshake
pub const LINE_END: &str = "\r\n";

/// Confirmation sent by the listener after a matching secret
pub const CONFIRMATION: &str = "done";

/// Longest request line accepted by the listener (terminator included)
pub const MAX_LINE_LEN: u64 = 4096;

/// Host and port of a shutdown listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
	pub host: String,
	pub port: u16,
}

impl Endpoint {
	pub fn new(host: impl Into<String>, port: u16) -> Self {
		Endpoint { host: host.into(), port }
	}

	/// Resolve to socket addresses, first match first
	pub async fn resolve(&self) -> io::Result<Vec<SocketAddr>> {
		let addrs: Vec<SocketAddr> =
			tokio::net::lookup_host((self.host.as_str(), self.port)).await?.collect();
		if addrs.is_empty() {
			return Err(io::Error::new(
				io::ErrorKind::AddrNotAvailable,
				format!("{} did not resolve to any address", self.host),
			));
		}
		Ok(addrs)
	}
}

impl From<SocketAddr> for Endpoint {
	fn from(addr: SocketAddr) -> Self {
		Endpoint { host: addr.ip().to_string(), port: addr.port() }
	}
}

impl fmt::Display for Endpoint {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.host.contains(':') {
			write!(f, "[{}]:{}", self.host, self.port)
		} else {
			write!(f, "{}:{}", self.host, self.port)
		}
	}
}

/// Request line sent by the controller
pub fn request(secret: &str) -> String {
	format!("{}{}", secret, LINE_END)
}

/// Response line sent by the listener on a match
pub fn confirmation() -> String {
	format!("{}{}", CONFIRMATION, LINE_END)
}

/// Strip exactly one line terminator (`\n` or `\r\n`).
///
/// Returns `None` when `raw` does not end with `\n`, i.e. the peer closed the
/// stream mid-line.
pub fn strip_line_end(raw: &str) -> Option<&str> {
	let line = raw.strip_suffix('\n')?;
	Some(line.strip_suffix('\r').unwrap_or(line))
}

/// Compare a received line with the secret. No trimming, no case folding.
pub fn secret_matches(secret: &str, line: &str) -> bool {
	line == secret
}

/// Whether a response line from the listener confirms the shutdown
pub fn is_confirmation(line: &str) -> bool {
	line == CONFIRMATION
}

/// Read one terminated line of at most [`MAX_LINE_LEN`] bytes.
///
/// `Ok(None)` means end of stream before a complete line (including an
/// oversized line). Invalid UTF-8 is reported as `InvalidData`.
pub async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
	R: AsyncBufRead + Unpin,
{
	let mut raw = String::new();
	let n = reader.take(MAX_LINE_LEN).read_line(&mut raw).await?;
	if n == 0 {
		return Ok(None);
	}
	Ok(strip_line_end(&raw).map(str::to_string))
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::io::BufReader;

	#[test]
	fn test_request_format() {
		assert_eq!(request("shutdown"), "shutdown\r\n");
		assert_eq!(confirmation(), "done\r\n");
	}

	#[test]
	fn test_strip_line_end() {
		assert_eq!(strip_line_end("shutdown\r\n"), Some("shutdown"));
		assert_eq!(strip_line_end("shutdown\n"), Some("shutdown"));
		assert_eq!(strip_line_end("shutdown \r\n"), Some("shutdown "));
		assert_eq!(strip_line_end("shutdown"), None);
		// only a single CR belongs to the terminator
		assert_eq!(strip_line_end("shutdown\r\r\n"), Some("shutdown\r"));
	}

	#[test]
	fn test_secret_match_is_exact() {
		assert!(secret_matches("shutdown", "shutdown"));
		assert!(!secret_matches("shutdown", "shutdown "));
		assert!(!secret_matches("shutdown", " shutdown"));
		assert!(!secret_matches("shutdown", "SHUTDOWN"));
		assert!(!secret_matches("shutdown", ""));
	}

	#[test]
	fn test_endpoint_display() {
		assert_eq!(Endpoint::new("127.0.0.1", 52000).to_string(), "127.0.0.1:52000");
		assert_eq!(Endpoint::new("::1", 52000).to_string(), "[::1]:52000");
	}

	#[tokio::test]
	async fn test_read_line_variants() {
		let mut reader = BufReader::new(&b"shutdown\r\nnext\n"[..]);
		assert_eq!(read_line(&mut reader).await.unwrap().as_deref(), Some("shutdown"));
		assert_eq!(read_line(&mut reader).await.unwrap().as_deref(), Some("next"));
		assert_eq!(read_line(&mut reader).await.unwrap(), None);

		let mut partial = BufReader::new(&b"shutd"[..]);
		assert_eq!(read_line(&mut partial).await.unwrap(), None);
	}

	#[tokio::test]
	async fn test_read_line_rejects_oversized() {
		let long = format!("{}\r\n", "x".repeat(MAX_LINE_LEN as usize + 10));
		let mut reader = BufReader::new(long.as_bytes());
		assert_eq!(read_line(&mut reader).await.unwrap(), None);
	}
}

// vim: ts=4
