//! Tests for the `stop` subcommand and its instance record bookkeeping
#![cfg(unix)]

use std::fs;
use std::path::Path;
use std::time::Duration;

use tempfile::TempDir;
use tokio::process::Command;
use zkharness::layout::{InstanceLayout, InstanceRecord};
use zkharness::listener::ShutdownListener;
use zkharness::{Config, Endpoint};

const BIN: &str = env!("CARGO_BIN_EXE_zkharness");

/// Config file in `dir` pointing the shutdown port at `port`
fn write_config(dir: &Path, port: u16) -> (Config, std::path::PathBuf) {
	let base_dir = dir.join("zmp");
	let text = format!("shutdownPort = {}\nbaseDir = {:?}\n", port, base_dir.display().to_string());
	let path = dir.join("zkharness.toml");
	fs::write(&path, text).unwrap();
	(Config::load(&path).unwrap(), path)
}

async fn run_stop(config_file: &Path, wait: &str) -> std::process::ExitStatus {
	let run = Command::new(BIN).arg("stop").arg("-c").arg(config_file).args(["--wait", wait]).output();
	tokio::time::timeout(Duration::from_secs(20), run).await.unwrap().unwrap().status
}

#[tokio::test]
async fn test_fire_and_forget_stop_removes_record() {
	let tmp = TempDir::new().unwrap();
	let listener = ShutdownListener::bind(&Endpoint::new("127.0.0.1", 0), "shutdown").await.unwrap();
	let port = listener.local_addr().unwrap().port();
	let task = tokio::spawn(listener.run());

	let (config, config_file) = write_config(tmp.path(), port);
	let layout = InstanceLayout::prepare(&config).unwrap();
	layout.write_record(&InstanceRecord::new(&config, Some(4242), "T1", true)).unwrap();

	assert!(run_stop(&config_file, "0").await.success());
	assert_eq!(layout.read_record().unwrap(), None);
	tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_confirmed_stop_removes_record() {
	let tmp = TempDir::new().unwrap();
	let listener = ShutdownListener::bind(&Endpoint::new("127.0.0.1", 0), "shutdown").await.unwrap();
	let port = listener.local_addr().unwrap().port();
	let task = tokio::spawn(listener.run());

	let (config, config_file) = write_config(tmp.path(), port);
	let layout = InstanceLayout::prepare(&config).unwrap();
	layout.write_record(&InstanceRecord::new(&config, Some(4242), "T1", true)).unwrap();

	assert!(run_stop(&config_file, "5").await.success());
	assert_eq!(layout.read_record().unwrap(), None);
	task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_unanswered_stop_keeps_record() {
	let tmp = TempDir::new().unwrap();
	// accepts but never reads or answers
	let silent = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
	let port = silent.local_addr().unwrap().port();

	let (config, config_file) = write_config(tmp.path(), port);
	let layout = InstanceLayout::prepare(&config).unwrap();
	let record = InstanceRecord::new(&config, Some(4242), "T1", true);
	layout.write_record(&record).unwrap();

	assert!(!run_stop(&config_file, "1").await.success());
	assert_eq!(layout.read_record().unwrap(), Some(record));
}

// vim: ts=4
