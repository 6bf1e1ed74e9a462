//! Process runner: spawns the interpreter bound to the session, streams its
//! stdio back through the broker, and drives the bounded dependency-recovery
//! retry loop.
//!
//! The runner never holds a full back-reference to the broker; it talks to
//! the session exclusively through the narrow [`RunnerSink`] interface.

pub mod process;
pub mod python;
pub mod retry;

use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::install::DependencyInstaller;
use crate::session::SessionState;
use python::PythonLocator;

/// Event-sink interface the runner holds instead of a broker back-reference.
pub trait RunnerSink: Send + Sync + 'static {
    /// Forward a chunk of program output (stderr when `is_err`).
    fn send_output<'a>(
        &'a self,
        chunk: &'a str,
        is_err: bool,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

    /// Report a terminal failure; forces the session back to WAIT.
    fn send_terminal_error<'a>(
        &'a self,
        message: &'a str,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

    /// Report successful run completion.
    fn send_run_complete(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Pop the oldest completed input line, if any.
    fn fetch_next_input(&self) -> Pin<Box<dyn Future<Output = Option<String>> + Send + '_>>;

    /// Current session readiness.
    fn session_state(&self) -> Pin<Box<dyn Future<Output = SessionState> + Send + '_>>;

    /// Code payload and working-directory key once both are present.
    fn code_and_work_key(
        &self,
    ) -> Pin<Box<dyn Future<Output = Option<(String, String)>> + Send + '_>>;

    /// Re-arm the session's enabled flag while idle.
    fn mark_idle(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Phases of one run, retry modeled as a first-class transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    /// No run in flight.
    Idle,
    /// Resolving the interpreter and spawning the child.
    Starting,
    /// Child alive, stdio streaming.
    Streaming,
    /// Missing-dependency install in progress before a re-spawn.
    Retrying,
    /// Run finished cleanly.
    Done,
    /// Run ended in a terminal error.
    Errored,
}

/// Process runner bound to the single session.
pub struct Runner {
    sink: Arc<dyn RunnerSink>,
    python: PythonLocator,
    installer: Arc<dyn DependencyInstaller>,
    asset_dir: PathBuf,
    stdin_slot: Mutex<Option<ChildStdin>>,
    pending_inputs: Mutex<VecDeque<String>>,
    process_ready: AtomicBool,
    running: AtomicBool,
    kill: Mutex<Option<CancellationToken>>,
    phase: std::sync::Mutex<RunPhase>,
}

impl Runner {
    /// Create a runner. `asset_dir` is the root of per-project directories.
    #[must_use]
    pub fn new(
        sink: Arc<dyn RunnerSink>,
        python: PythonLocator,
        installer: Arc<dyn DependencyInstaller>,
        asset_dir: PathBuf,
    ) -> Self {
        Self {
            sink,
            python,
            installer,
            asset_dir,
            stdin_slot: Mutex::new(None),
            pending_inputs: Mutex::new(VecDeque::new()),
            process_ready: AtomicBool::new(false),
            running: AtomicBool::new(false),
            kill: Mutex::new(None),
            phase: std::sync::Mutex::new(RunPhase::Idle),
        }
    }

    /// Current phase of the run state machine.
    #[must_use]
    pub fn phase(&self) -> RunPhase {
        self.phase
            .lock()
            .map_or(RunPhase::Idle, |guard| *guard)
    }

    pub(crate) fn set_phase(&self, phase: RunPhase) {
        if let Ok(mut guard) = self.phase.lock() {
            *guard = phase;
        }
    }

    /// Write `line` to the live child's stdin, or queue it when the child is
    /// still spawning. Queued lines are flushed in submission order once the
    /// process is live; a write to a dead process is a terminal failure.
    pub async fn send_input(&self, line: &str) {
        let mut guard = self.stdin_slot.lock().await;
        if let Some(stdin) = guard.as_mut() {
            let mut bytes = line.as_bytes().to_vec();
            bytes.push(b'\n');
            if let Err(err) = stdin.write_all(&bytes).await {
                drop(guard);
                self.sink
                    .send_terminal_error(&format!("failed to write program input: {err}"))
                    .await;
            }
        } else if !self.process_ready.load(Ordering::SeqCst) {
            self.pending_inputs.lock().await.push_back(line.to_owned());
        }
    }

    /// Kill the current child process. Idempotent, safe with no live child.
    pub async fn interrupt(&self) {
        if let Some(token) = self.kill.lock().await.as_ref() {
            debug!("interrupt requested, killing child");
            token.cancel();
        }
    }
}

/// Start the fixed-interval poll loop driving the runner.
///
/// Each tick observes the session state: a WAIT→READY edge starts exactly
/// one run (re-entrant starts are guarded while already streaming); READY
/// ticks with a live child drain queued input lines in order; a READY→WAIT
/// edge kills the child, and every WAIT tick re-arms the session's enabled
/// flag.
#[must_use]
pub fn spawn_poll_loop(
    runner: Arc<Runner>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("runner poll loop started");
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last = SessionState::Wait;

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    runner.interrupt().await;
                    info!("runner poll loop stopped");
                    break;
                }

                _ = tick.tick() => {}
            }

            let state = runner.sink.session_state().await;
            if state == SessionState::Ready {
                if runner.running.swap(true, Ordering::SeqCst) {
                    if runner.process_ready.load(Ordering::SeqCst) {
                        while let Some(line) = runner.sink.fetch_next_input().await {
                            runner.send_input(&line).await;
                        }
                    }
                } else {
                    runner.process_ready.store(false, Ordering::SeqCst);
                    let run = Arc::clone(&runner);
                    tokio::spawn(async move {
                        run.run_submission().await;
                    });
                }
            } else {
                if last == SessionState::Ready {
                    runner.interrupt().await;
                }
                runner.sink.mark_idle().await;
            }
            last = state;
        }
    })
}
