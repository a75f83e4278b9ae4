//! External program run as the supervised service
//!
//! The program (typically `zkServer.sh start-foreground <zoo.cfg>`) runs as
//! a child of the supervised process. Stopping sends SIGTERM; the forced
//! path sends SIGKILL.

use std::fs::File;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Mutex;

use crate::error::SupervisorError;
use crate::logging::*;
use crate::runner::Service;

#[derive(Debug, Default)]
struct ChildSlot {
	pid: Option<u32>,
	stop_requested: bool,
}

/// Runs an external command until it exits or is signalled
#[derive(Debug)]
pub struct CommandService {
	name: String,
	program: String,
	args: Vec<String>,
	log_dir: Option<PathBuf>,
	slot: Mutex<ChildSlot>,
}

impl CommandService {
	/// `command[0]` is the program; `config_file`, when set, is appended last
	pub fn new(
		name: impl Into<String>,
		command: &[String],
		config_file: Option<PathBuf>,
	) -> Result<Self, SupervisorError> {
		let (program, rest) = command.split_first().ok_or_else(|| SupervisorError::ServiceFailed {
			message: "no service command given".to_string(),
		})?;
		let mut args = rest.to_vec();
		if let Some(path) = config_file {
			args.push(path.display().to_string());
		}
		Ok(CommandService {
			name: name.into(),
			program: program.clone(),
			args,
			log_dir: None,
			slot: Mutex::new(ChildSlot::default()),
		})
	}

	/// Send the program's stdout/stderr to files in `dir`
	pub fn with_log_dir(mut self, dir: Option<PathBuf>) -> Self {
		self.log_dir = dir;
		self
	}

	pub fn args(&self) -> &[String] {
		&self.args
	}

	fn output(&self, file_name: &str) -> Result<Stdio, SupervisorError> {
		match &self.log_dir {
			Some(dir) => {
				let path = dir.join(file_name);
				let file = File::create(&path)
					.map_err(|source| SupervisorError::Layout { path: path.clone(), source })?;
				Ok(Stdio::from(file))
			}
			None => Ok(Stdio::inherit()),
		}
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, ChildSlot> {
		self.slot.lock().unwrap_or_else(|e| e.into_inner())
	}

	fn signal(&self, signal: libc::c_int) {
		let pid = match self.lock().pid {
			Some(pid) => pid,
			None => return,
		};
		send_signal(pid, signal);
	}
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: libc::c_int) {
	if pid == 0 || pid > i32::MAX as u32 {
		return;
	}
	// SAFETY: kill(2) only reports an error for a stale pid
	let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
	if rc != 0 {
		debug!("kill({}, {}) failed: {}", pid, signal, std::io::Error::last_os_error());
	}
}

#[cfg(not(unix))]
fn send_signal(pid: u32, _signal: libc::c_int) {
	warn!("Cannot signal process {} on this platform", pid);
}

impl Service for CommandService {
	fn name(&self) -> &str {
		&self.name
	}

	fn run(&self) -> Result<(), SupervisorError> {
		let cmd_line = format!("{} {}", self.program, self.args.join(" "));
		let mut child = Command::new(&self.program)
			.args(&self.args)
			.stdin(Stdio::null())
			.stdout(self.output("service.stdout")?)
			.stderr(self.output("service.stderr")?)
			.spawn()
			.map_err(|source| SupervisorError::SpawnFailed { cmd: cmd_line.clone(), source })?;

		let stop_early = {
			let mut slot = self.lock();
			slot.pid = Some(child.id());
			slot.stop_requested
		};
		info!("Started {} (pid {})", cmd_line, child.id());
		if stop_early {
			send_signal(child.id(), libc::SIGTERM);
		}

		let status = child.wait()?;
		let stop_requested = {
			let mut slot = self.lock();
			slot.pid = None;
			slot.stop_requested
		};

		if status.success() || stop_requested {
			info!("{} exited with {}", self.name, status);
			Ok(())
		} else {
			Err(SupervisorError::ServiceFailed { message: format!("{} exited with {}", self.name, status) })
		}
	}

	fn stop(&self) {
		self.lock().stop_requested = true;
		self.signal(libc::SIGTERM);
	}

	fn kill(&self) {
		self.signal(libc::SIGKILL);
	}
}


// vim: ts=4
