//! One run of the interpreter: materialize, spawn, stream, classify exit.
//!
//! Stdout and stderr drain concurrently; each chunk is forwarded through the
//! sink as it arrives, so there is no ordering guarantee between the two
//! streams, only within each. Stderr is additionally accumulated for exit
//! classification by the retry policy.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::runner::{retry, RunPhase, Runner, RunnerSink};
use crate::session::SessionState;
use crate::{AppError, Result};

/// File name the code payload is materialized under.
pub const ENTRY_FILE: &str = "main.py";

struct RunOutcome {
    status: ExitStatus,
    stderr: String,
    killed: bool,
}

impl Runner {
    /// Execute the session's current submission to completion, including the
    /// bounded dependency retry. Exactly one of `send_run_complete` /
    /// `send_terminal_error` fires per submission unless the run was killed
    /// because the session left READY.
    pub async fn run_submission(self: Arc<Self>) {
        self.try_run().await;
        self.set_phase(RunPhase::Idle);
        // `process_ready` drops first so a racing `send_input` queues the
        // line instead of finding the slot empty while the flag still reads
        // live.
        self.process_ready
            .store(false, std::sync::atomic::Ordering::SeqCst);
        *self.stdin_slot.lock().await = None;
        self.running
            .store(false, std::sync::atomic::Ordering::SeqCst);
    }

    async fn try_run(&self) {
        if self.sink.session_state().await != SessionState::Ready {
            return;
        }
        let Some((code, work_key)) = self.sink.code_and_work_key().await else {
            return;
        };

        self.set_phase(RunPhase::Starting);
        let project_dir = self.asset_dir.join(&work_key);
        if let Err(err) = materialize(&project_dir, &code).await {
            warn!(%err, dir = %project_dir.display(), "failed to materialize entry file");
            self.sink
                .send_terminal_error("failed to prepare program file; refresh and retry")
                .await;
            self.set_phase(RunPhase::Errored);
            return;
        }

        self.run_with_retry(&project_dir).await;
    }

    async fn run_with_retry(&self, project_dir: &Path) {
        let mut retry_ctx = retry::RetryContext::new();

        loop {
            self.set_phase(RunPhase::Starting);
            let python = match self.python.resolve().await {
                Ok(python) => python,
                Err(err) => {
                    self.sink
                        .send_terminal_error(&format!("no usable interpreter: {err}"))
                        .await;
                    self.set_phase(RunPhase::Errored);
                    return;
                }
            };

            let outcome = match self.stream_one_run(&python, project_dir).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    self.sink.send_terminal_error(&err.to_string()).await;
                    self.set_phase(RunPhase::Errored);
                    return;
                }
            };

            if outcome.killed {
                // Session left READY mid-run; the interrupt path owns cleanup
                // and completion handlers must not fire.
                debug!("run killed before completion");
                self.set_phase(RunPhase::Done);
                return;
            }

            if outcome.status.success() {
                info!("program exited cleanly");
                self.sink.send_run_complete().await;
                self.set_phase(RunPhase::Done);
                return;
            }

            if !retry_ctx.exhausted() {
                if let Some(module) = retry::match_missing_module(&outcome.stderr) {
                    let package = retry::package_for(&module);
                    self.sink
                        .send_output(
                            &format!("installing missing module: {package}...\r\n"),
                            true,
                        )
                        .await;
                    self.set_phase(RunPhase::Retrying);
                    match self.run_install(&python, &package).await {
                        Ok(true) => {
                            retry_ctx.record_attempt();
                            self.process_ready
                                .store(false, std::sync::atomic::Ordering::SeqCst);
                            self.sink
                                .send_output(
                                    &format!("module {package} installed, rerunning...\r\n"),
                                    true,
                                )
                                .await;
                            continue;
                        }
                        Ok(false) => {
                            self.sink
                                .send_output(
                                    &format!("failed to auto-install {package}\r\n"),
                                    true,
                                )
                                .await;
                        }
                        Err(err) => {
                            self.sink
                                .send_output(
                                    &format!("failed to auto-install {package}: {err}\r\n"),
                                    true,
                                )
                                .await;
                        }
                    }
                }
            }

            let code = outcome.status.code().unwrap_or(-1);
            self.sink
                .send_terminal_error(&format!("process exited with code {code}"))
                .await;
            self.set_phase(RunPhase::Errored);
            return;
        }
    }

    /// Spawn one child, flush queued inputs, stream stdio until exit or kill.
    async fn stream_one_run(&self, python: &str, project_dir: &Path) -> Result<RunOutcome> {
        let cancel = CancellationToken::new();
        *self.kill.lock().await = Some(cancel.clone());

        let mut child = Command::new(python)
            .arg("-u")
            .arg(ENTRY_FILE)
            .current_dir(project_dir)
            .env("PYTHONIOENCODING", "utf-8")
            .env("PYTHONUTF8", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| AppError::Spawn(format!("failed to spawn interpreter: {err}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::Spawn("failed to capture child stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Spawn("failed to capture child stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::Spawn("failed to capture child stderr".into()))?;

        *self.stdin_slot.lock().await = Some(stdin);
        self.process_ready
            .store(true, std::sync::atomic::Ordering::SeqCst);
        self.set_phase(RunPhase::Streaming);

        // Inputs submitted while spawning was in flight, in submission order.
        loop {
            let queued = self.pending_inputs.lock().await.pop_front();
            match queued {
                Some(line) => self.send_input(&line).await,
                None => break,
            }
        }

        let stderr_acc = Arc::new(Mutex::new(String::new()));
        let out_task = tokio::spawn(stream_output(stdout, false, Arc::clone(&self.sink), None));
        let err_task = tokio::spawn(stream_output(
            stderr,
            true,
            Arc::clone(&self.sink),
            Some(Arc::clone(&stderr_acc)),
        ));

        let (status, killed) = tokio::select! {
            result = child.wait() => {
                let status = result
                    .map_err(|err| AppError::Runtime(format!("wait failed: {err}")))?;
                (status, false)
            }
            () = cancel.cancelled() => {
                child.start_kill().ok();
                let status = child
                    .wait()
                    .await
                    .map_err(|err| AppError::Runtime(format!("wait failed: {err}")))?;
                (status, true)
            }
        };

        let _ = out_task.await;
        let _ = err_task.await;

        self.process_ready
            .store(false, std::sync::atomic::Ordering::SeqCst);
        *self.stdin_slot.lock().await = None;
        *self.kill.lock().await = None;

        let stderr_text = stderr_acc.lock().await.clone();
        debug!(code = ?status.code(), killed, "child exited");
        Ok(RunOutcome {
            status,
            stderr: stderr_text,
            killed,
        })
    }

    /// Run one dependency install, forwarding progress lines as stderr output.
    async fn run_install(&self, python: &str, package: &str) -> Result<bool> {
        let (tx, mut rx) = mpsc::channel::<String>(32);
        let sink = Arc::clone(&self.sink);
        let forward = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                sink.send_output(&format!("{line}\r\n"), true).await;
            }
        });

        let result = self.installer.install(python, package, tx).await;
        let _ = forward.await;
        result
    }
}

/// Write the code payload as the entry file, skipping the write when the
/// on-disk content already matches.
async fn materialize(project_dir: &Path, code: &str) -> Result<PathBuf> {
    tokio::fs::create_dir_all(project_dir).await?;
    let path = project_dir.join(ENTRY_FILE);
    let current = tokio::fs::read_to_string(&path).await.ok();
    if current.as_deref() != Some(code) {
        tokio::fs::write(&path, code).await?;
    }
    Ok(path)
}

/// Forward one child stream chunk-by-chunk through the sink.
///
/// Reads split on byte counts, not character boundaries, so a multibyte
/// character cut by a read is carried in the buffer and decoded together
/// with the next chunk.
async fn stream_output<R>(
    mut stream: R,
    is_err: bool,
    sink: Arc<dyn RunnerSink>,
    accumulate: Option<Arc<Mutex<String>>>,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        match stream.read_buf(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let complete = complete_utf8_len(&buf);
                if complete == 0 {
                    continue;
                }
                let chunk = buf.split_to(complete);
                forward_chunk(&chunk, is_err, &sink, accumulate.as_ref()).await;
            }
        }
    }
    // Bytes still held at EOF can never complete a sequence.
    if !buf.is_empty() {
        forward_chunk(&buf, is_err, &sink, accumulate.as_ref()).await;
    }
}

async fn forward_chunk(
    bytes: &[u8],
    is_err: bool,
    sink: &Arc<dyn RunnerSink>,
    accumulate: Option<&Arc<Mutex<String>>>,
) {
    let text = String::from_utf8_lossy(bytes).into_owned();
    if let Some(acc) = accumulate {
        acc.lock().await.push_str(&text);
    }
    sink.send_output(&text, is_err).await;
}

/// Length of the longest prefix ending on a complete UTF-8 sequence.
///
/// Only the final partial sequence is withheld; malformed bytes elsewhere
/// pass through to the lossy decode.
fn complete_utf8_len(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte < 0x80 {
            // ASCII tail, nothing pending.
            break;
        }
        if byte >= 0xc0 {
            let width = match byte {
                0xf0.. => 4,
                0xe0.. => 3,
                _ => 2,
            };
            if width > back {
                return bytes.len() - back;
            }
            break;
        }
        // Continuation byte, keep scanning backwards for its lead.
    }
    bytes.len()
}
