//! Forking the supervised process and verifying that it started
//!
//! The child is spawned with stdout and stderr merged into one line stream.
//! Startup is verified by finding the launch token in that stream and,
//! optionally, by probing the service's client endpoint until it answers.

use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::config::{ReadinessCheck, ReadinessConfig};
use crate::controller::{self, StopOutcome};
use crate::error::SupervisorError;
use crate::logging::*;
use crate::protocol::Endpoint;

/// Lines scanned for the launch token before giving up, by default
pub const DEFAULT_VERIFY_LINES: usize = 50;

const OUTPUT_BUFFER: usize = 256;

/// Prefix the supervised process puts in front of the launch token
pub fn token_marker(token: &str) -> String {
	format!("Token: {}", token)
}

/// Generate a fresh launch token
pub fn new_token() -> String {
	uuid::Uuid::new_v4().to_string()
}

/// Line-oriented output of a child process
#[async_trait]
pub trait LineSource: Send {
	/// Next line without its terminator, `None` at end of stream
	async fn next_line(&mut self) -> io::Result<Option<String>>;
}

/// Wait/kill handle of a spawned child
#[async_trait]
pub trait ProcessControl: Send {
	fn id(&self) -> Option<u32>;

	async fn wait(&mut self) -> io::Result<ExitStatus>;

	fn try_wait(&mut self) -> io::Result<Option<ExitStatus>>;

	async fn kill(&mut self) -> io::Result<()>;
}

/// A spawned child: its merged output and its control handle
pub struct Spawned {
	pub output: Box<dyn LineSource>,
	pub control: Box<dyn ProcessControl>,
}

/// Program, arguments and working directory of the child
#[derive(Debug, Clone, Default)]
pub struct LaunchCommand {
	pub program: PathBuf,
	pub args: Vec<String>,
	pub working_dir: Option<PathBuf>,
}

impl LaunchCommand {
	pub fn new(program: impl Into<PathBuf>) -> Self {
		LaunchCommand { program: program.into(), ..Default::default() }
	}

	pub fn arg(mut self, arg: impl Into<String>) -> Self {
		self.args.push(arg.into());
		self
	}

	pub fn args<I, S>(mut self, args: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.args.extend(args.into_iter().map(Into::into));
		self
	}

	pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
		self.working_dir = Some(dir.into());
		self
	}

	/// Command line as a single string, for logs and errors
	pub fn display(&self) -> String {
		let mut s = self.program.display().to_string();
		for arg in &self.args {
			s.push(' ');
			s.push_str(arg);
		}
		s
	}
}

/// Platform seam for forking the child
pub trait ProcessSpawner {
	fn spawn(&self, command: &LaunchCommand) -> Result<Spawned, SupervisorError>;
}

/// Spawns real OS processes through `tokio::process`
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSpawner;

impl ProcessSpawner for TokioSpawner {
	fn spawn(&self, command: &LaunchCommand) -> Result<Spawned, SupervisorError> {
		let mut cmd = Command::new(&command.program);
		cmd.args(&command.args).stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
		if let Some(dir) = &command.working_dir {
			cmd.current_dir(dir);
		}
		// keep the child out of the controller's terminal signals
		#[cfg(unix)]
		cmd.process_group(0);

		let mut child = cmd
			.spawn()
			.map_err(|source| SupervisorError::SpawnFailed { cmd: command.display(), source })?;

		let stdout = child
			.stdout
			.take()
			.ok_or(SupervisorError::StdioUnavailable { what: "stdout".to_string() })?;
		let stderr = child
			.stderr
			.take()
			.ok_or(SupervisorError::StdioUnavailable { what: "stderr".to_string() })?;

		Ok(Spawned {
			output: Box::new(MergedOutput::new(stdout, stderr)),
			control: Box::new(TokioChild { child }),
		})
	}
}

struct TokioChild {
	child: Child,
}

#[async_trait]
impl ProcessControl for TokioChild {
	fn id(&self) -> Option<u32> {
		self.child.id()
	}

	async fn wait(&mut self) -> io::Result<ExitStatus> {
		self.child.wait().await
	}

	fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
		self.child.try_wait()
	}

	async fn kill(&mut self) -> io::Result<()> {
		self.child.kill().await
	}
}

/// Stdout and stderr of a child interleaved line by line.
///
/// Each stream is read by its own task. Once the consumer drops this value
/// the tasks keep draining the pipes so the child never blocks on a full
/// pipe buffer.
pub struct MergedOutput {
	rx: mpsc::Receiver<String>,
}

impl MergedOutput {
	pub fn new<O, E>(stdout: O, stderr: E) -> Self
	where
		O: AsyncRead + Unpin + Send + 'static,
		E: AsyncRead + Unpin + Send + 'static,
	{
		let (tx, rx) = mpsc::channel(OUTPUT_BUFFER);
		tokio::spawn(forward_lines(stdout, tx.clone(), "stdout"));
		tokio::spawn(forward_lines(stderr, tx, "stderr"));
		MergedOutput { rx }
	}
}

async fn forward_lines<R>(stream: R, tx: mpsc::Sender<String>, name: &'static str)
where
	R: AsyncRead + Unpin,
{
	let mut reader = BufReader::new(stream);
	let mut buf = Vec::new();
	loop {
		buf.clear();
		match reader.read_until(b'\n', &mut buf).await {
			Ok(0) => break,
			Ok(_) => {
				// services log in whatever encoding they like; a bad byte must not end the scan
				let line = decode_line(&buf);
				if tx.is_closed() {
					trace!("child {}: {}", name, line);
				} else if tx.send(line).await.is_err() {
					trace!("child {} consumer gone, draining", name);
				}
			}
			Err(e) => {
				debug!("Reading child {} failed: {}", name, e);
				break;
			}
		}
	}
}

/// One output line without its terminator, invalid UTF-8 replaced
fn decode_line(raw: &[u8]) -> String {
	let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
	let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
	String::from_utf8_lossy(raw).into_owned()
}

#[async_trait]
impl LineSource for MergedOutput {
	async fn next_line(&mut self) -> io::Result<Option<String>> {
		Ok(self.rx.recv().await)
	}
}

/// Result of scanning the child's output for the launch token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenScan {
	pub verified: bool,
	pub lines_scanned: usize,
}

/// Scan for a line containing `Token: <token>`.
///
/// `limit` caps the number of lines inspected; `None` scans until the token
/// shows up or the stream ends. Only the first match counts.
pub async fn scan_for_token(
	output: &mut dyn LineSource,
	token: &str,
	limit: Option<usize>,
) -> io::Result<TokenScan> {
	let marker = token_marker(token);
	let mut lines_scanned = 0;
	while limit.map_or(true, |max| lines_scanned < max) {
		let line = match output.next_line().await? {
			Some(line) => line,
			None => break,
		};
		lines_scanned += 1;
		debug!("LINE: {}", line);
		if line.contains(&marker) {
			return Ok(TokenScan { verified: true, lines_scanned });
		}
	}
	Ok(TokenScan { verified: false, lines_scanned })
}

/// Poll the service's client endpoint until it answers.
///
/// Sleeps `config.interval` between attempts and gives up after
/// `config.timeout` with [`SupervisorError::ReadinessTimeout`]. Returns the
/// number of attempts made.
pub async fn wait_until_ready(endpoint: &Endpoint, config: &ReadinessConfig) -> Result<u32, SupervisorError> {
	let timeout = config.timeout();
	let interval = config.interval();
	let deadline = tokio::time::Instant::now() + timeout;
	let mut attempts = 0;

	loop {
		attempts += 1;
		let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
		match tokio::time::timeout(remaining, probe(endpoint, config.check)).await {
			Ok(Ok(())) => {
				info!("Service at {} is ready after {} attempt(s)", endpoint, attempts);
				return Ok(attempts);
			}
			Ok(Err(e)) => debug!("Readiness probe {} against {} failed: {}", attempts, endpoint, e),
			Err(_) => {}
		}

		let now = tokio::time::Instant::now();
		if now >= deadline {
			return Err(SupervisorError::ReadinessTimeout { endpoint: endpoint.to_string(), attempts, timeout });
		}
		tokio::time::sleep(interval.min(deadline - now)).await;
	}
}

/// Single readiness probe against the service's client endpoint
pub async fn probe(endpoint: &Endpoint, check: ReadinessCheck) -> io::Result<()> {
	let mut stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
	match check {
		ReadinessCheck::Connect => Ok(()),
		ReadinessCheck::Ruok => {
			stream.write_all(b"ruok").await?;
			let mut reply = String::new();
			tokio::io::AsyncReadExt::read_to_string(&mut stream, &mut reply).await?;
			if reply.trim() == "imok" {
				Ok(())
			} else {
				Err(io::Error::new(io::ErrorKind::InvalidData, format!("unexpected reply {:?}", reply)))
			}
		}
	}
}

/// Knobs for a single `start` call
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
	/// Line cap for the token scan; `None` scans without bound
	pub verify_lines: Option<usize>,
	/// Client endpoint and probe settings, when readiness should be awaited
	pub readiness: Option<(Endpoint, ReadinessConfig)>,
	/// Shutdown endpoint and secret of the child, kept on the handle
	pub shutdown: Option<(Endpoint, String)>,
}

/// What `start` observed
pub struct StartOutcome {
	/// The launch token was seen on the child's output
	pub verified: bool,
	pub lines_scanned: usize,
	/// Probe attempts until the service answered, when probing was requested
	pub ready_after: Option<u32>,
	pub process: SupervisedProcess,
}

/// Handle to a forked, supervised child
pub struct SupervisedProcess {
	control: Box<dyn ProcessControl>,
	shutdown: Option<(Endpoint, String)>,
}

impl SupervisedProcess {
	pub fn id(&self) -> Option<u32> {
		self.control.id()
	}

	pub fn shutdown_endpoint(&self) -> Option<&Endpoint> {
		self.shutdown.as_ref().map(|(endpoint, _)| endpoint)
	}

	pub async fn wait(&mut self) -> io::Result<ExitStatus> {
		self.control.wait().await
	}

	pub fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
		self.control.try_wait()
	}

	pub async fn kill(&mut self) -> io::Result<()> {
		self.control.kill().await
	}

	/// Run the shutdown handshake against this child, then reap it.
	///
	/// The child is only waited for when the handshake was confirmed or the
	/// listener was already gone; its exit status is returned in that case.
	pub async fn shutdown(&mut self, wait: Duration) -> Result<(StopOutcome, Option<ExitStatus>), SupervisorError> {
		let (endpoint, secret) = match &self.shutdown {
			Some(target) => target.clone(),
			None => {
				return Err(SupervisorError::ServiceFailed {
					message: "no shutdown endpoint known for this process".to_string(),
				})
			}
		};
		let outcome = controller::stop(&endpoint, &secret, wait).await?;
		let status = match outcome {
			StopOutcome::Confirmed | StopOutcome::AlreadyStopped => Some(self.wait().await?),
			_ => None,
		};
		Ok((outcome, status))
	}
}

/// Spawn `command` and verify that it started.
///
/// Spawn failure is fatal. Not finding the token is a warning only. With
/// readiness configured, failing to become ready kills the child and
/// returns [`SupervisorError::ReadinessTimeout`].
pub async fn start(
	spawner: &dyn ProcessSpawner,
	command: &LaunchCommand,
	token: &str,
	options: StartOptions,
) -> Result<StartOutcome, SupervisorError> {
	info!("Starting {}", command.display());
	let Spawned { mut output, control } = spawner.spawn(command)?;
	let mut process = SupervisedProcess { control, shutdown: options.shutdown };

	info!("Waiting for service to start...");
	let scan = match scan_for_token(output.as_mut(), token, options.verify_lines).await {
		Ok(scan) => scan,
		Err(e) => return Err(abandon(&mut process, e.into()).await),
	};
	drop(output);
	if scan.verified {
		info!("Service has started (token seen after {} lines)", scan.lines_scanned);
	} else {
		warn!("Unable to verify service started (scanned {} lines)", scan.lines_scanned);
	}

	let ready_after = match &options.readiness {
		Some((endpoint, config)) => match wait_until_ready(endpoint, config).await {
			Ok(attempts) => Some(attempts),
			Err(e) => return Err(abandon(&mut process, e).await),
		},
		None => None,
	};

	Ok(StartOutcome { verified: scan.verified, lines_scanned: scan.lines_scanned, ready_after, process })
}

/// Kill a child whose start failed; no handle to it leaves `start`
async fn abandon(process: &mut SupervisedProcess, e: SupervisorError) -> SupervisorError {
	warn!("Killing child process: {}", e);
	if let Err(kill_err) = process.kill().await {
		warn!("Failed to kill child process: {}", kill_err);
	}
	e
}


// vim: ts=4
