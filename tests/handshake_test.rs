//! Integration tests for the shutdown handshake
//!
//! A real listener and the real controller talk over loopback TCP.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use zkharness::controller::{self, StopOutcome};
use zkharness::listener::ShutdownListener;
use zkharness::Endpoint;

async fn bind_local(secret: &str) -> (ShutdownListener, SocketAddr) {
	let listener = ShutdownListener::bind(&Endpoint::new("127.0.0.1", 0), secret).await.unwrap();
	let addr = listener.local_addr().unwrap();
	(listener, addr)
}

fn free_port() -> u16 {
	let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
	l.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_fourth_attempt_with_correct_secret_stops() {
	let (listener, addr) = bind_local("s3cret").await;
	let task = tokio::spawn(listener.run());

	for wrong in ["shutdown", "S3CRET", "s3cret "] {
		let outcome = controller::stop(&Endpoint::from(addr), wrong, Duration::from_secs(5)).await.unwrap();
		assert_eq!(outcome, StopOutcome::Unconfirmed, "secret {:?}", wrong);
		assert!(!outcome.is_success());
	}
	assert!(!task.is_finished());

	let outcome = controller::stop(&Endpoint::from(addr), "s3cret", Duration::from_secs(5)).await.unwrap();
	assert_eq!(outcome, StopOutcome::Confirmed);
	task.await.unwrap().unwrap();

	// the listener is gone for good
	assert!(TcpStream::connect(addr).await.is_err());
	let outcome = controller::stop(&Endpoint::from(addr), "s3cret", Duration::from_secs(1)).await.unwrap();
	assert_eq!(outcome, StopOutcome::AlreadyStopped);
}

#[tokio::test]
async fn test_raw_wire_exchange() {
	let (listener, addr) = bind_local("shutdown").await;
	let task = tokio::spawn(listener.run());

	let mut stream = TcpStream::connect(addr).await.unwrap();
	stream.write_all(b"shutdown\r\n").await.unwrap();
	let mut reply = Vec::new();
	stream.read_to_end(&mut reply).await.unwrap();
	assert_eq!(reply, b"done\r\n");

	task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_stop_without_listener() {
	let endpoint = Endpoint::new("127.0.0.1", free_port());
	let outcome = controller::stop(&endpoint, "shutdown", Duration::from_secs(30)).await.unwrap();
	assert_eq!(outcome, StopOutcome::AlreadyStopped);
}

#[tokio::test]
async fn test_fire_and_forget_still_stops() {
	let (listener, addr) = bind_local("shutdown").await;
	let task = tokio::spawn(listener.run());

	let outcome = controller::stop(&Endpoint::from(addr), "shutdown", Duration::ZERO).await.unwrap();
	assert_eq!(outcome, StopOutcome::Sent);

	tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_second_listener_on_same_port_fails() {
	let (_listener, addr) = bind_local("shutdown").await;
	let err = ShutdownListener::bind(&Endpoint::from(addr), "shutdown").await;
	assert!(err.is_err());
}

// vim: ts=4
