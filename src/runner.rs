//! Runs the wrapped service on a dedicated thread with a bounded stop
//!
//! The service itself is opaque: anything implementing [`Service`] can be
//! supervised. [`ServiceRunner`] owns the [`ServiceState`] machine and the
//! thread, and turns a stop request into one of the [`StopResult`] outcomes.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::{StateError, SupervisorError};
use crate::logging::*;

/// Grace period granted to a service before it is forcibly torn down
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Exit status recorded for a clean stop
pub const EXIT_CLEAN: i32 = 0;
/// Exit status recorded when the grace period expired
pub const EXIT_FORCED: i32 = 1;
/// Exit status recorded for a service failure or panic
pub const EXIT_FAULT: i32 = 2;

/// A long-running task with cooperative stop semantics
pub trait Service: Send + Sync + 'static {
	/// Human readable name used in logs and the launch token line
	fn name(&self) -> &str;

	/// Run until stopped or failed. Blocks the calling thread.
	fn run(&self) -> Result<(), SupervisorError>;

	/// Ask `run` to return. Must not block indefinitely.
	fn stop(&self);

	/// Tear down whatever `run` left behind after the grace period expired
	fn kill(&self) {}
}

/// Lifecycle of a supervised service. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
	NotStarted,
	Starting,
	Running,
	ShuttingDown,
	Stopped(i32),
}

impl ServiceState {
	fn rank(self) -> u8 {
		match self {
			ServiceState::NotStarted => 0,
			ServiceState::Starting => 1,
			ServiceState::Running => 2,
			ServiceState::ShuttingDown => 3,
			ServiceState::Stopped(_) => 4,
		}
	}

	pub fn is_stopped(self) -> bool {
		matches!(self, ServiceState::Stopped(_))
	}
}

impl fmt::Display for ServiceState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ServiceState::NotStarted => write!(f, "not-started"),
			ServiceState::Starting => write!(f, "starting"),
			ServiceState::Running => write!(f, "running"),
			ServiceState::ShuttingDown => write!(f, "shutting-down"),
			ServiceState::Stopped(code) => write!(f, "stopped({})", code),
		}
	}
}

/// Shared, monotonic holder for a [`ServiceState`]
#[derive(Debug, Clone)]
pub struct StateCell {
	inner: Arc<Mutex<ServiceState>>,
}

impl Default for StateCell {
	fn default() -> Self {
		StateCell { inner: Arc::new(Mutex::new(ServiceState::NotStarted)) }
	}
}

impl StateCell {
	pub fn get(&self) -> ServiceState {
		*self.lock()
	}

	/// Move to `next`, rejecting any transition that is not strictly forward
	pub fn advance(&self, next: ServiceState) -> Result<(), StateError> {
		let mut state = self.lock();
		if next.rank() <= state.rank() {
			return Err(StateError { from: *state, to: next });
		}
		debug!("Service state {} -> {}", *state, next);
		*state = next;
		Ok(())
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, ServiceState> {
		// a poisoned lock still holds a valid state value
		self.inner.lock().unwrap_or_else(|e| e.into_inner())
	}
}

/// How a stop request ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopResult {
	/// The task thread finished within the grace period
	Clean,
	/// The grace period expired with the task thread still running
	Forced,
	/// The task thread failed or panicked
	Faulted(String),
}

impl StopResult {
	pub fn exit_code(&self) -> i32 {
		match self {
			StopResult::Clean => EXIT_CLEAN,
			StopResult::Forced => EXIT_FORCED,
			StopResult::Faulted(_) => EXIT_FAULT,
		}
	}
}

type Completion = Result<(), String>;

/// Owns the service thread and its state
pub struct ServiceRunner {
	service: Arc<dyn Service>,
	state: StateCell,
	done: Option<oneshot::Receiver<Completion>>,
	finished: Option<Completion>,
	thread: Option<thread::JoinHandle<()>>,
}

impl ServiceRunner {
	pub fn new(service: Arc<dyn Service>) -> Self {
		ServiceRunner {
			service,
			state: StateCell::default(),
			done: None,
			finished: None,
			thread: None,
		}
	}

	pub fn state(&self) -> ServiceState {
		self.state.get()
	}

	pub fn state_cell(&self) -> StateCell {
		self.state.clone()
	}

	/// Spawn `Service::run` on its own thread.
	///
	/// A panic inside `run` is reported as a failure through the completion
	/// channel rather than unwinding into the runtime.
	pub fn start(&mut self) -> Result<(), SupervisorError> {
		self.state.advance(ServiceState::Starting)?;

		let (tx, rx) = oneshot::channel();
		let service = self.service.clone();
		let handle = thread::Builder::new()
			.name(format!("{}-service", self.service.name()))
			.spawn(move || {
				let result = panic::catch_unwind(AssertUnwindSafe(|| service.run()));
				let completion = match result {
					Ok(Ok(())) => Ok(()),
					Ok(Err(e)) => Err(e.to_string()),
					Err(panic) => Err(panic_message(panic.as_ref())),
				};
				let _ = tx.send(completion);
			})
			.map_err(|e| SupervisorError::ServiceFailed {
				message: format!("cannot spawn service thread: {}", e),
			})?;

		self.thread = Some(handle);
		self.done = Some(rx);
		self.state.advance(ServiceState::Running)?;
		info!("Service {} is running", self.service.name());
		Ok(())
	}

	/// Wait until the task thread finishes on its own.
	///
	/// Resolves immediately with the stored result when the thread already
	/// finished; pends forever if the runner was never started.
	pub async fn finished(&mut self) -> Completion {
		if let Some(done) = &self.finished {
			return done.clone();
		}
		let completion = match self.done.as_mut() {
			Some(rx) => rx.await.unwrap_or_else(|_| Err("service thread vanished".to_string())),
			None => std::future::pending().await,
		};
		self.done = None;
		self.finished = Some(completion.clone());
		completion
	}

	/// Request a cooperative stop and wait at most `grace` for the thread.
	pub async fn stop(&mut self, grace: Duration) -> Result<StopResult, SupervisorError> {
		self.state.advance(ServiceState::ShuttingDown)?;
		info!("Stopping service {} (grace period {}s)", self.service.name(), grace.as_secs());
		self.service.stop();

		let result = match tokio::time::timeout(grace, self.finished()).await {
			Ok(Ok(())) => {
				if let Some(handle) = self.thread.take() {
					let _ = handle.join();
				}
				info!("Service {} shut down successfully", self.service.name());
				StopResult::Clean
			}
			Ok(Err(message)) => {
				error!("Service {} failed while stopping: {}", self.service.name(), message);
				StopResult::Faulted(message)
			}
			Err(_) => {
				warn!(
					"Service {} did not shut down for {}s, forcing exit",
					self.service.name(),
					grace.as_secs()
				);
				self.service.kill();
				StopResult::Forced
			}
		};

		self.state.advance(ServiceState::Stopped(result.exit_code()))?;
		Ok(result)
	}

	/// Record the terminal state after the service ended without a stop request
	pub fn mark_exited(&mut self, code: i32) -> Result<(), SupervisorError> {
		if let Some(handle) = self.thread.take() {
			let _ = handle.join();
		}
		self.state.advance(ServiceState::Stopped(code))?;
		Ok(())
	}
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
	if let Some(s) = panic.downcast_ref::<&str>() {
		s.to_string()
	} else if let Some(s) = panic.downcast_ref::<String>() {
		s.clone()
	} else {
		"panic with non-string payload".to_string()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicBool, Ordering};
	use std::sync::Condvar;

	/// Blocks in `run` until `stop` flips the flag
	struct Cooperative {
		stopped: Mutex<bool>,
		cvar: Condvar,
	}

	impl Cooperative {
		fn new() -> Self {
			Cooperative { stopped: Mutex::new(false), cvar: Condvar::new() }
		}
	}

	impl Service for Cooperative {
		fn name(&self) -> &str {
			"cooperative"
		}

		fn run(&self) -> Result<(), SupervisorError> {
			let mut stopped = self.stopped.lock().unwrap();
			while !*stopped {
				stopped = self.cvar.wait(stopped).unwrap();
			}
			Ok(())
		}

		fn stop(&self) {
			*self.stopped.lock().unwrap() = true;
			self.cvar.notify_all();
		}
	}

	/// Ignores `stop` for a fixed time
	struct Stubborn {
		linger: Duration,
		killed: AtomicBool,
	}

	impl Service for Stubborn {
		fn name(&self) -> &str {
			"stubborn"
		}

		fn run(&self) -> Result<(), SupervisorError> {
			thread::sleep(self.linger);
			Ok(())
		}

		fn stop(&self) {}

		fn kill(&self) {
			self.killed.store(true, Ordering::SeqCst);
		}
	}

	struct Failing;

	impl Service for Failing {
		fn name(&self) -> &str {
			"failing"
		}

		fn run(&self) -> Result<(), SupervisorError> {
			Err(SupervisorError::ServiceFailed { message: "bad config".to_string() })
		}

		fn stop(&self) {}
	}

	struct Panicking;

	impl Service for Panicking {
		fn name(&self) -> &str {
			"panicking"
		}

		fn run(&self) -> Result<(), SupervisorError> {
			panic!("boom");
		}

		fn stop(&self) {}
	}

	#[test]
	fn test_state_transitions_are_monotonic() {
		let cell = StateCell::default();
		assert_eq!(cell.get(), ServiceState::NotStarted);
		cell.advance(ServiceState::Starting).unwrap();
		cell.advance(ServiceState::Running).unwrap();

		let err = cell.advance(ServiceState::Starting).unwrap_err();
		assert_eq!(err.from, ServiceState::Running);
		assert_eq!(cell.get(), ServiceState::Running);

		// skipping ahead is allowed
		cell.advance(ServiceState::Stopped(0)).unwrap();
		assert!(cell.advance(ServiceState::Stopped(1)).is_err());
		assert_eq!(cell.get(), ServiceState::Stopped(0));
	}

	#[tokio::test]
	async fn test_clean_stop() {
		let mut runner = ServiceRunner::new(Arc::new(Cooperative::new()));
		runner.start().unwrap();
		assert_eq!(runner.state(), ServiceState::Running);

		let result = runner.stop(Duration::from_secs(5)).await.unwrap();
		assert_eq!(result, StopResult::Clean);
		assert_eq!(runner.state(), ServiceState::Stopped(EXIT_CLEAN));
	}

	#[tokio::test]
	async fn test_forced_stop_after_grace_period() {
		let service = Arc::new(Stubborn { linger: Duration::from_secs(3), killed: AtomicBool::new(false) });
		let mut runner = ServiceRunner::new(service.clone());
		runner.start().unwrap();

		let result = runner.stop(Duration::from_millis(200)).await.unwrap();
		assert_eq!(result, StopResult::Forced);
		assert_ne!(result.exit_code(), 0);
		assert!(service.killed.load(Ordering::SeqCst));
		assert_eq!(runner.state(), ServiceState::Stopped(EXIT_FORCED));
	}

	#[tokio::test]
	async fn test_failure_is_reported() {
		let mut runner = ServiceRunner::new(Arc::new(Failing));
		runner.start().unwrap();
		let completion = runner.finished().await;
		assert!(completion.unwrap_err().contains("bad config"));

		// stop still resolves, from the stored completion
		let result = runner.stop(Duration::from_secs(1)).await.unwrap();
		assert!(matches!(result, StopResult::Faulted(_)));
		assert_eq!(runner.state(), ServiceState::Stopped(EXIT_FAULT));
	}

	#[tokio::test]
	async fn test_panic_is_captured() {
		let mut runner = ServiceRunner::new(Arc::new(Panicking));
		runner.start().unwrap();
		let completion = runner.finished().await;
		assert_eq!(completion.unwrap_err(), "boom");
	}

	#[tokio::test]
	async fn test_stop_twice_is_rejected() {
		let mut runner = ServiceRunner::new(Arc::new(Cooperative::new()));
		runner.start().unwrap();
		runner.stop(Duration::from_secs(5)).await.unwrap();
		assert!(matches!(runner.stop(Duration::from_secs(1)).await, Err(SupervisorError::State(_))));
	}
}

// vim: ts=4
