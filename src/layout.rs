//! On-disk layout of one service instance
//!
//! ```text
//! <baseDir>/<clientPortAddress>_<clientPort>/
//!     conf/zoo.cfg
//!     data/
//!     logs/
//!     instance.json
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::Config;
use crate::error::SupervisorError;
use crate::logging::*;

pub const CONFIG_FILE_NAME: &str = "zoo.cfg";
pub const RECORD_FILE_NAME: &str = "instance.json";

/// Directories and files of a prepared instance
#[derive(Debug, Clone)]
pub struct InstanceLayout {
	pub instance_dir: PathBuf,
	pub conf_dir: PathBuf,
	pub data_dir: PathBuf,
	pub log_dir: PathBuf,
}

fn layout_err(path: &Path) -> impl Fn(io::Error) -> SupervisorError + '_ {
	move |source| SupervisorError::Layout { path: path.to_path_buf(), source }
}

impl InstanceLayout {
	/// Paths for `config`, without touching the filesystem
	pub fn for_config(config: &Config) -> Self {
		let instance_dir = config
			.base_dir
			.join(format!("{}_{}", config.client_port_address, config.client_port));
		InstanceLayout {
			conf_dir: instance_dir.join("conf"),
			data_dir: instance_dir.join("data"),
			log_dir: instance_dir.join("logs"),
			instance_dir,
		}
	}

	/// Create the directory tree, wiping previous state unless asked to keep it
	pub fn prepare(config: &Config) -> Result<Self, SupervisorError> {
		fs::create_dir_all(&config.base_dir).map_err(layout_err(&config.base_dir))?;
		let layout = Self::for_config(config);

		if !config.keep_previous_state {
			remove_dir_if_exists(&layout.instance_dir)?;
		}
		for dir in [&layout.instance_dir, &layout.conf_dir, &layout.data_dir, &layout.log_dir] {
			fs::create_dir_all(dir).map_err(layout_err(dir))?;
		}
		debug!("Prepared instance directory {}", layout.instance_dir.display());
		Ok(layout)
	}

	pub fn config_file(&self) -> PathBuf {
		self.conf_dir.join(CONFIG_FILE_NAME)
	}

	pub fn record_file(&self) -> PathBuf {
		self.instance_dir.join(RECORD_FILE_NAME)
	}

	/// Write `conf/zoo.cfg`, replacing an existing file
	pub fn write_service_config(&self, config: &Config) -> Result<PathBuf, SupervisorError> {
		let path = self.config_file();
		let data_dir = absolute(&self.data_dir).map_err(layout_err(&self.data_dir))?;
		fs::write(&path, render_service_config(config, &data_dir)).map_err(layout_err(&path))?;
		info!("Wrote service configuration {}", path.display());
		Ok(path)
	}

	pub fn write_record(&self, record: &InstanceRecord) -> Result<(), SupervisorError> {
		let path = self.record_file();
		let json = serde_json::to_string_pretty(record)
			.map_err(|e| SupervisorError::Layout { path: path.clone(), source: e.into() })?;
		fs::write(&path, json).map_err(layout_err(&path))
	}

	/// Read the record of a running instance; `None` if there is none
	pub fn read_record(&self) -> Result<Option<InstanceRecord>, SupervisorError> {
		let path = self.record_file();
		let text = match fs::read_to_string(&path) {
			Ok(text) => text,
			Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
			Err(e) => return Err(SupervisorError::Layout { path, source: e }),
		};
		let record =
			serde_json::from_str(&text).map_err(|e| SupervisorError::Layout { path, source: e.into() })?;
		Ok(Some(record))
	}

	pub fn remove_record(&self) -> Result<(), SupervisorError> {
		let path = self.record_file();
		match fs::remove_file(&path) {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
			Err(e) => Err(SupervisorError::Layout { path, source: e }),
		}
	}
}

/// `zoo.cfg` contents, one `key=value` per line
pub fn render_service_config(config: &Config, data_dir: &Path) -> String {
	let entries: [(&str, String); 7] = [
		("tickTime", config.tick_time.to_string()),
		("initLimit", config.init_limit.to_string()),
		("syncLimit", config.sync_limit.to_string()),
		("clientPortAddress", config.client_port_address.clone()),
		("clientPort", config.client_port.to_string()),
		("maxClientCnxns", config.max_client_cnxns.to_string()),
		("dataDir", data_dir.display().to_string()),
	];
	let mut out = String::from("# generated by zkharness\n");
	for (key, value) in entries.iter() {
		out.push_str(key);
		out.push('=');
		out.push_str(value);
		out.push('\n');
	}
	out
}

fn remove_dir_if_exists(dir: &Path) -> Result<(), SupervisorError> {
	match fs::remove_dir_all(dir) {
		Ok(()) => {
			debug!("Removed previous state in {}", dir.display());
			Ok(())
		}
		Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
		Err(e) => Err(SupervisorError::Layout { path: dir.to_path_buf(), source: e }),
	}
}

fn absolute(path: &Path) -> io::Result<PathBuf> {
	if path.is_absolute() {
		Ok(path.to_path_buf())
	} else {
		Ok(std::env::current_dir()?.join(path))
	}
}

/// Bookkeeping for a started instance, written next to its data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
	pub pid: Option<u32>,
	pub shutdown_host: String,
	pub shutdown_port: u16,
	pub token: String,
	pub verified: bool,
	/// Seconds since the Unix epoch
	pub started_at: u64,
}

impl InstanceRecord {
	pub fn new(config: &Config, pid: Option<u32>, token: &str, verified: bool) -> Self {
		InstanceRecord {
			pid,
			shutdown_host: config.client_port_address.clone(),
			shutdown_port: config.shutdown_port,
			token: token.to_string(),
			verified,
			started_at: SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	fn config_in(dir: &Path) -> Config {
		Config { base_dir: dir.join("zmp"), client_port: 21123, ..Default::default() }
	}

	#[test]
	fn test_prepare_creates_tree() {
		let tmp = TempDir::new().unwrap();
		let layout = InstanceLayout::prepare(&config_in(tmp.path())).unwrap();
		assert!(layout.instance_dir.ends_with("127.0.0.1_21123"));
		assert!(layout.conf_dir.is_dir());
		assert!(layout.data_dir.is_dir());
		assert!(layout.log_dir.is_dir());
	}

	#[test]
	fn test_prepare_wipes_previous_state() {
		let tmp = TempDir::new().unwrap();
		let config = config_in(tmp.path());
		let layout = InstanceLayout::prepare(&config).unwrap();
		let marker = layout.data_dir.join("snapshot.0");
		fs::write(&marker, b"old").unwrap();

		InstanceLayout::prepare(&config).unwrap();
		assert!(!marker.exists());
	}

	#[test]
	fn test_prepare_keeps_previous_state() {
		let tmp = TempDir::new().unwrap();
		let mut config = config_in(tmp.path());
		let layout = InstanceLayout::prepare(&config).unwrap();
		let marker = layout.data_dir.join("snapshot.0");
		fs::write(&marker, b"old").unwrap();

		config.keep_previous_state = true;
		InstanceLayout::prepare(&config).unwrap();
		assert!(marker.exists());
	}

	#[test]
	fn test_service_config_contents() {
		let tmp = TempDir::new().unwrap();
		let config = config_in(tmp.path());
		let layout = InstanceLayout::prepare(&config).unwrap();
		let path = layout.write_service_config(&config).unwrap();
		assert_eq!(path, layout.conf_dir.join("zoo.cfg"));

		let text = fs::read_to_string(&path).unwrap();
		assert!(text.contains("clientPort=21123\n"));
		assert!(text.contains("clientPortAddress=127.0.0.1\n"));
		assert!(text.contains("tickTime=2000\n"));
		assert!(text.contains("maxClientCnxns=100\n"));
		let data_line = text.lines().find(|l| l.starts_with("dataDir=")).unwrap();
		assert!(Path::new(&data_line["dataDir=".len()..]).is_absolute());

		// rewriting replaces instead of appending
		layout.write_service_config(&config).unwrap();
		assert_eq!(fs::read_to_string(&path).unwrap(), text);
	}

	#[test]
	fn test_record_lifecycle() {
		let tmp = TempDir::new().unwrap();
		let config = config_in(tmp.path());
		let layout = InstanceLayout::prepare(&config).unwrap();
		assert_eq!(layout.read_record().unwrap(), None);

		let record = InstanceRecord::new(&config, Some(4242), "T1", true);
		layout.write_record(&record).unwrap();
		assert_eq!(layout.read_record().unwrap(), Some(record));

		layout.remove_record().unwrap();
		assert_eq!(layout.read_record().unwrap(), None);
		layout.remove_record().unwrap();
	}
}

// vim: ts=4
