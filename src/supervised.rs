//! Entry point of the supervised process
//!
//! Runs the service thread and the shutdown listener side by side. The
//! listener finishing (a valid handshake) or a termination signal starts a
//! bounded stop; the resulting [`StopResult`] decides the exit status.

use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::error::SupervisorError;
use crate::listener::ShutdownListener;
use crate::logging::*;
use crate::protocol::Endpoint;
use crate::runner::{panic_message, Service, ServiceRunner, StopResult, DEFAULT_GRACE_PERIOD, EXIT_FAULT};
use crate::service::CommandService;

/// Arguments of `zkharness launch`
#[derive(Debug, Clone)]
pub struct LaunchArgs {
	pub host: String,
	pub shutdown_port: u16,
	pub shutdown_string: String,
	pub token: Option<String>,
	pub zoocfg: Option<PathBuf>,
	pub log_dir: Option<PathBuf>,
	pub grace: Duration,
	pub service_name: String,
	pub command: Vec<String>,
}

impl Default for LaunchArgs {
	fn default() -> Self {
		LaunchArgs {
			host: "127.0.0.1".to_string(),
			shutdown_port: 0,
			shutdown_string: "shutdown".to_string(),
			token: None,
			zoocfg: None,
			log_dir: None,
			grace: DEFAULT_GRACE_PERIOD,
			service_name: "ZooKeeper".to_string(),
			command: Vec::new(),
		}
	}
}

impl LaunchArgs {
	pub fn shutdown_endpoint(&self) -> Endpoint {
		Endpoint::new(self.host.clone(), self.shutdown_port)
	}
}

/// Install the process-wide fault handler.
///
/// A panic on any thread is logged and ends the process with
/// [`EXIT_FAULT`]; a service with no way to stop it, or a listener with no
/// service, must not linger.
pub fn install_fault_handler() {
	std::panic::set_hook(Box::new(|info| {
		let thread = std::thread::current();
		let name = thread.name().unwrap_or("<unnamed>");
		let location = info.location().map(|l| l.to_string()).unwrap_or_default();
		error!("Uncaught panic in thread {} at {}: {}", name, location, panic_message(info.payload()));
		let _ = writeln!(std::io::stderr(), "zkharness: uncaught panic in thread {}: {}", name, panic_message(info.payload()));
		std::process::exit(EXIT_FAULT);
	}));
}

/// Future resolving on SIGTERM or SIGINT.
///
/// The handlers are registered before this returns, so a signal sent right
/// after the launch token line is not lost. Pends forever if they can't be
/// installed.
pub fn termination_signal() -> Pin<Box<dyn Future<Output = ()> + Send>> {
	#[cfg(unix)]
	{
		use tokio::signal::unix::{signal, SignalKind};

		let mut sigterm = match signal(SignalKind::terminate()) {
			Ok(stream) => stream,
			Err(e) => {
				warn!("Failed to setup SIGTERM handler: {}", e);
				return Box::pin(std::future::pending());
			}
		};
		let mut sigint = match signal(SignalKind::interrupt()) {
			Ok(stream) => stream,
			Err(e) => {
				warn!("Failed to setup SIGINT handler: {}", e);
				return Box::pin(std::future::pending());
			}
		};
		Box::pin(async move {
			tokio::select! {
				_ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
				_ = sigint.recv() => info!("Received SIGINT, shutting down"),
			}
		})
	}

	#[cfg(not(unix))]
	{
		Box::pin(async {
			if tokio::signal::ctrl_c().await.is_err() {
				std::future::pending::<()>().await;
			}
			info!("Received Ctrl+C, shutting down");
		})
	}
}

enum Event {
	Listener(Result<Result<(), SupervisorError>, tokio::task::JoinError>),
	ServiceEnded(Result<(), String>),
	Signal,
}

/// Service thread plus shutdown listener, run to completion
pub struct Supervisor {
	listener: ShutdownListener,
	runner: ServiceRunner,
	service_name: String,
	grace: Duration,
	token: Option<String>,
	handle_signals: bool,
}

impl Supervisor {
	pub fn new(listener: ShutdownListener, service: Arc<dyn Service>) -> Self {
		Supervisor {
			listener,
			service_name: service.name().to_string(),
			runner: ServiceRunner::new(service),
			grace: DEFAULT_GRACE_PERIOD,
			token: None,
			handle_signals: false,
		}
	}

	pub fn grace_period(mut self, grace: Duration) -> Self {
		self.grace = grace;
		self
	}

	pub fn token(mut self, token: Option<String>) -> Self {
		self.token = token;
		self
	}

	/// Treat SIGTERM/SIGINT like a shutdown request
	pub fn handle_signals(mut self, enabled: bool) -> Self {
		self.handle_signals = enabled;
		self
	}

	/// Run until shut down. The launch token line goes to `token_out` once
	/// the service thread is running.
	pub async fn run<W: Write>(self, mut token_out: W) -> StopResult {
		let Supervisor { listener, mut runner, service_name, grace, token, handle_signals } = self;

		if let Err(e) = runner.start() {
			error!("Cannot start {}: {}", service_name, e);
			return StopResult::Faulted(e.to_string());
		}
		let mut listener_task = tokio::spawn(listener.run());
		let mut signal: Pin<Box<dyn Future<Output = ()> + Send>> =
			if handle_signals { termination_signal() } else { Box::pin(std::future::pending()) };

		// let the controller know the task began executing
		if let Some(token) = &token {
			let _ = writeln!(token_out, "Started {} (Token: {})", service_name, token);
			let _ = token_out.flush();
		}

		let mut service_ended = false;
		let mut fault = None;
		loop {
			let event = tokio::select! {
				res = &mut listener_task => Event::Listener(res),
				done = runner.finished(), if !service_ended => Event::ServiceEnded(done),
				_ = &mut signal => Event::Signal,
			};
			match event {
				Event::Listener(Ok(Ok(()))) => break,
				Event::Listener(Ok(Err(e))) => {
					error!("Shutdown listener failed: {}", e);
					fault = Some(e.to_string());
					break;
				}
				Event::Listener(Err(e)) => {
					error!("Shutdown listener crashed: {}", e);
					fault = Some(e.to_string());
					break;
				}
				Event::ServiceEnded(Ok(())) => {
					warn!("{} exited on its own; waiting for shutdown request", service_name);
					service_ended = true;
				}
				Event::ServiceEnded(Err(message)) => {
					error!("{} failed: {}", service_name, message);
					listener_task.abort();
					let _ = runner.mark_exited(EXIT_FAULT);
					return StopResult::Faulted(message);
				}
				Event::Signal => {
					listener_task.abort();
					break;
				}
			}
		}

		// also reached on listener failure: the service must not outlive it
		let result = match runner.stop(grace).await {
			Ok(result) => result,
			Err(e) => StopResult::Faulted(e.to_string()),
		};
		match fault {
			Some(message) => StopResult::Faulted(message),
			None => result,
		}
	}
}

/// Bind the listener, build the command service and supervise it
pub async fn launch<W: Write>(args: &LaunchArgs, token_out: W) -> StopResult {
	let endpoint = args.shutdown_endpoint();
	let listener = match ShutdownListener::bind(&endpoint, args.shutdown_string.clone()).await {
		Ok(listener) => listener,
		Err(e) => {
			error!("{}", e);
			return StopResult::Faulted(e.to_string());
		}
	};

	let service = match CommandService::new(args.service_name.clone(), &args.command, args.zoocfg.clone()) {
		Ok(service) => service.with_log_dir(args.log_dir.clone()),
		Err(e) => {
			error!("{}", e);
			return StopResult::Faulted(e.to_string());
		}
	};

	let result = Supervisor::new(listener, Arc::new(service))
		.grace_period(args.grace)
		.token(args.token.clone())
		.handle_signals(true)
		.run(token_out)
		.await;

	match &result {
		StopResult::Clean => info!("{} shut down successfully", args.service_name),
		StopResult::Forced => warn!("{} did not shut down within {}s", args.service_name, args.grace.as_secs()),
		StopResult::Faulted(message) => error!("{} faulted: {}", args.service_name, message),
	}
	result
}

// vim: ts=4
