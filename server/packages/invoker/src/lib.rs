//! Supervised invocation of the external document generation tool.
//!
//! The tool is slow and unreliable: it may hang, crash, or exit with partial
//! output. Each call spawns it as a child process, feeds the prompt over
//! stdin (never argv), aggregates stdout incrementally, and enforces three
//! boundaries per attempt: a hard timeout with SIGTERM-then-SIGKILL
//! escalation, a non-zero-exit check, and an output byte ceiling. Failed
//! attempts are retried with linear backoff; a single invocation never has
//! two children alive at once.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_TERM_GRACE: Duration = Duration::from_secs(5);
const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_secs(2);
const DEFAULT_MAX_RETRIES: u32 = 2;
const DEFAULT_MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;
const READ_CHUNK_SIZE: usize = 8 * 1024;
const MAX_STDERR_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct InvokerConfig {
    /// Generation tool binary.
    pub program: PathBuf,
    /// Arguments passed verbatim; the prompt itself always goes over stdin.
    pub args: Vec<String>,
    /// Extra environment applied over the inherited one. The child always
    /// inherits the parent environment, so PATH/HOME/USER are present.
    pub env: HashMap<String, String>,
    /// Per-attempt deadline.
    pub timeout: Duration,
    /// Wait between SIGTERM and SIGKILL on timeout.
    pub term_grace: Duration,
    /// Additional attempts after the first.
    pub max_retries: u32,
    /// Backoff is `retry_base_delay * attempt_number` (linear, not
    /// exponential: tool latency is roughly constant per attempt).
    pub retry_base_delay: Duration,
    /// Accumulated stdout beyond this kills the child.
    pub max_output_bytes: usize,
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("scribe-tool"),
            args: vec!["-p".to_string()],
            env: HashMap::new(),
            timeout: DEFAULT_TIMEOUT,
            term_grace: DEFAULT_TERM_GRACE,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

/// Progress notifications emitted while an invocation runs. The caller
/// forwards these into the job broker; the invoker itself knows nothing
/// about subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvokerEvent {
    AttemptStarted { attempt: u32 },
    Progress { bytes_received: u64 },
}

/// Successful generation result.
#[derive(Debug, Clone)]
pub struct Generated {
    pub output: String,
    pub duration: Duration,
    pub attempts: u32,
}

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("generation tool timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },
    #[error("failed to spawn generation tool `{program}`: {error}")]
    SpawnFailed {
        program: String,
        #[source]
        error: std::io::Error,
    },
    #[error("generation tool exited with code {exit_code:?}")]
    ExitedNonZero {
        exit_code: Option<i32>,
        stderr: String,
    },
    #[error("generation output exceeded {limit_bytes} bytes")]
    OutputTooLarge { limit_bytes: usize },
    #[error("i/o error talking to generation tool: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of one attempt, free of retry policy. `run` decides what to do
/// with each variant.
#[derive(Debug)]
enum AttemptOutcome {
    Completed { output: String },
    Timeout,
    SpawnFailed(std::io::Error),
    Failed {
        exit_code: Option<i32>,
        stderr: String,
    },
    OutputTooLarge,
    Io(std::io::Error),
}

#[derive(Debug, Clone)]
pub struct Invoker {
    config: InvokerConfig,
}

impl Invoker {
    pub fn new(config: InvokerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &InvokerConfig {
        &self.config
    }

    /// Run the tool to completion, retrying failed attempts. Emits
    /// [`InvokerEvent`]s on `events` without ever blocking on the receiver;
    /// a closed or full channel drops the event rather than failing the run.
    pub async fn run(
        &self,
        prompt: &str,
        events: mpsc::Sender<InvokerEvent>,
    ) -> Result<Generated, InvokeError> {
        let started = Instant::now();
        let total_attempts = self.config.max_retries + 1;
        let mut last_error = None;

        for attempt in 1..=total_attempts {
            if attempt > 1 {
                // Linear backoff keyed on the attempt we are about to make.
                let delay = self.config.retry_base_delay * (attempt - 1);
                tracing::info!(
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying generation after backoff"
                );
                tokio::time::sleep(delay).await;
            }

            let _ = events.try_send(InvokerEvent::AttemptStarted { attempt });

            match self.run_attempt(prompt, &events).await {
                AttemptOutcome::Completed { output } => {
                    let duration = started.elapsed();
                    tracing::info!(
                        attempt = attempt,
                        output_bytes = output.len(),
                        duration_ms = duration.as_millis() as u64,
                        "generation completed"
                    );
                    return Ok(Generated {
                        output,
                        duration,
                        attempts: attempt,
                    });
                }
                AttemptOutcome::OutputTooLarge => {
                    // Runaway output is never retried: a tool that floods
                    // once will flood again and the ceiling exists to
                    // protect memory.
                    tracing::warn!(
                        attempt = attempt,
                        limit_bytes = self.config.max_output_bytes,
                        "generation output exceeded ceiling, not retrying"
                    );
                    return Err(InvokeError::OutputTooLarge {
                        limit_bytes: self.config.max_output_bytes,
                    });
                }
                AttemptOutcome::Timeout => {
                    tracing::warn!(attempt = attempt, "generation attempt timed out");
                    last_error = Some(InvokeError::Timeout {
                        after_ms: self.config.timeout.as_millis() as u64,
                    });
                }
                AttemptOutcome::SpawnFailed(error) => {
                    tracing::error!(
                        program = %self.config.program.display(),
                        error = %error,
                        "failed to spawn generation tool"
                    );
                    last_error = Some(InvokeError::SpawnFailed {
                        program: self.config.program.display().to_string(),
                        error,
                    });
                }
                AttemptOutcome::Failed { exit_code, stderr } => {
                    tracing::warn!(
                        attempt = attempt,
                        exit_code = ?exit_code,
                        stderr_bytes = stderr.len(),
                        "generation tool exited non-zero"
                    );
                    last_error = Some(InvokeError::ExitedNonZero { exit_code, stderr });
                }
                AttemptOutcome::Io(error) => {
                    tracing::warn!(attempt = attempt, error = %error, "i/o error during attempt");
                    last_error = Some(InvokeError::Io(error));
                }
            }
        }

        Err(last_error.unwrap_or(InvokeError::Timeout {
            after_ms: self.config.timeout.as_millis() as u64,
        }))
    }

    /// One subprocess attempt. Pure mechanism: spawns, feeds the prompt,
    /// drains stdout against the deadline and the byte ceiling, and reports
    /// a tagged outcome. No retry decisions are made here.
    async fn run_attempt(
        &self,
        prompt: &str,
        events: &mpsc::Sender<InvokerEvent>,
    ) -> AttemptOutcome {
        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.config.env {
            command.env(key, value);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(error) => return AttemptOutcome::SpawnFailed(error),
        };

        let Some(mut stdin) = child.stdin.take() else {
            return AttemptOutcome::Io(std::io::Error::other("child stdin not captured"));
        };
        let Some(mut stdout) = child.stdout.take() else {
            return AttemptOutcome::Io(std::io::Error::other("child stdout not captured"));
        };
        let Some(mut stderr) = child.stderr.take() else {
            return AttemptOutcome::Io(std::io::Error::other("child stderr not captured"));
        };

        tracing::debug!(
            pid = child.id().unwrap_or(0),
            prompt_bytes = prompt.len(),
            "generation tool spawned"
        );

        // The tool may exit before consuming stdin; a broken pipe here is
        // its failure to report, not ours.
        let _ = stdin.write_all(prompt.as_bytes()).await;
        let _ = stdin.shutdown().await;
        drop(stdin);

        // Keep draining past the cap so a chatty tool never blocks on a
        // full stderr pipe; only the first MAX_STDERR_BYTES are kept.
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let mut chunk = [0u8; READ_CHUNK_SIZE];
            loop {
                match stderr.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if buf.len() < MAX_STDERR_BYTES {
                            let take = n.min(MAX_STDERR_BYTES - buf.len());
                            buf.extend_from_slice(&chunk[..take]);
                        }
                    }
                }
            }
            buf
        });

        let deadline = Instant::now() + self.config.timeout;
        let mut output: Vec<u8> = Vec::new();
        let mut chunk = [0u8; READ_CHUNK_SIZE];

        loop {
            match tokio::time::timeout_at(deadline, stdout.read(&mut chunk)).await {
                Err(_) => {
                    stderr_task.abort();
                    self.terminate(&mut child).await;
                    return AttemptOutcome::Timeout;
                }
                Ok(Err(error)) => {
                    stderr_task.abort();
                    self.terminate(&mut child).await;
                    return AttemptOutcome::Io(error);
                }
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => {
                    output.extend_from_slice(&chunk[..n]);
                    if output.len() > self.config.max_output_bytes {
                        stderr_task.abort();
                        self.terminate(&mut child).await;
                        return AttemptOutcome::OutputTooLarge;
                    }
                    // Progress is advisory; a full buffer drops the sample
                    // rather than letting a stalled consumer suspend the
                    // attempt past its deadline.
                    let _ = events.try_send(InvokerEvent::Progress {
                        bytes_received: output.len() as u64,
                    });
                }
            }
        }

        // Stdout closed; the process still has to exit within the deadline.
        let status = match tokio::time::timeout_at(deadline, child.wait()).await {
            Err(_) => {
                stderr_task.abort();
                self.terminate(&mut child).await;
                return AttemptOutcome::Timeout;
            }
            Ok(Err(error)) => {
                stderr_task.abort();
                return AttemptOutcome::Io(error);
            }
            Ok(Ok(status)) => status,
        };

        if status.success() {
            AttemptOutcome::Completed {
                output: String::from_utf8_lossy(&output).into_owned(),
            }
        } else {
            let stderr_bytes = stderr_task.await.unwrap_or_default();
            AttemptOutcome::Failed {
                exit_code: status.code(),
                stderr: String::from_utf8_lossy(&stderr_bytes).into_owned(),
            }
        }
    }

    /// Graceful termination: SIGTERM, wait `term_grace`, then SIGKILL.
    async fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
            if tokio::time::timeout(self.config.term_grace, child.wait())
                .await
                .is_ok()
            {
                return;
            }
            tracing::warn!(pid = pid, "generation tool ignored SIGTERM, killing");
        }

        let _ = child.kill().await;
        let _ = child.wait().await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell_invoker(script: &str, config: InvokerConfig) -> Invoker {
        Invoker::new(InvokerConfig {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            ..config
        })
    }

    fn fast_config() -> InvokerConfig {
        InvokerConfig {
            timeout: Duration::from_secs(5),
            term_grace: Duration::from_millis(200),
            retry_base_delay: Duration::from_millis(10),
            ..InvokerConfig::default()
        }
    }

    async fn drain(mut rx: mpsc::Receiver<InvokerEvent>) -> Vec<InvokerEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn echoes_prompt_through_stdin() {
        let invoker = shell_invoker("cat", fast_config());
        let (tx, rx) = mpsc::channel(64);
        let generated = invoker.run("hello generator", tx).await.unwrap();
        assert_eq!(generated.output, "hello generator");
        assert_eq!(generated.attempts, 1);

        let events = drain(rx).await;
        assert_eq!(events[0], InvokerEvent::AttemptStarted { attempt: 1 });
        assert!(events
            .iter()
            .any(|e| matches!(e, InvokerEvent::Progress { .. })));
    }

    #[tokio::test]
    async fn nonzero_exit_retries_then_fails() {
        let config = InvokerConfig {
            max_retries: 2,
            ..fast_config()
        };
        let invoker = shell_invoker("echo nope >&2; exit 3", config);
        let (tx, rx) = mpsc::channel(64);
        let err = invoker.run("prompt", tx).await.unwrap_err();

        match err {
            InvokeError::ExitedNonZero { exit_code, stderr } => {
                assert_eq!(exit_code, Some(3));
                assert!(stderr.contains("nope"));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        // 1 initial + 2 retries, attempt numbers strictly increasing.
        let attempts: Vec<u32> = drain(rx)
            .await
            .into_iter()
            .filter_map(|e| match e {
                InvokerEvent::AttemptStarted { attempt } => Some(attempt),
                _ => None,
            })
            .collect();
        assert_eq!(attempts, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn output_ceiling_kills_without_retry() {
        let config = InvokerConfig {
            max_retries: 2,
            max_output_bytes: 1000,
            ..fast_config()
        };
        // Streams 1500 bytes then sleeps so the kill is observable.
        let invoker = shell_invoker("head -c 1500 /dev/zero; sleep 30", config);
        let (tx, rx) = mpsc::channel(64);
        let err = invoker.run("prompt", tx).await.unwrap_err();

        assert!(matches!(
            err,
            InvokeError::OutputTooLarge { limit_bytes: 1000 }
        ));
        let attempts = drain(rx)
            .await
            .into_iter()
            .filter(|e| matches!(e, InvokerEvent::AttemptStarted { .. }))
            .count();
        assert_eq!(attempts, 1, "runaway output must not be retried");
    }

    #[tokio::test]
    async fn hanging_tool_times_out() {
        let config = InvokerConfig {
            timeout: Duration::from_millis(200),
            max_retries: 0,
            ..fast_config()
        };
        let invoker = shell_invoker("sleep 30", config);
        let (tx, _rx) = mpsc::channel(64);
        let started = std::time::Instant::now();
        let err = invoker.run("prompt", tx).await.unwrap_err();

        assert!(matches!(err, InvokeError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn missing_binary_reports_spawn_failure() {
        let invoker = Invoker::new(InvokerConfig {
            program: PathBuf::from("/nonexistent/scribe-tool"),
            max_retries: 1,
            ..fast_config()
        });
        let (tx, _rx) = mpsc::channel(64);
        let err = invoker.run("prompt", tx).await.unwrap_err();
        assert!(matches!(err, InvokeError::SpawnFailed { .. }));
    }

    #[tokio::test]
    async fn captured_stderr_is_capped() {
        let config = InvokerConfig {
            max_retries: 0,
            ..fast_config()
        };
        // Writes well past the cap before failing.
        let invoker = shell_invoker("head -c 200000 /dev/zero >&2; exit 5", config);
        let (tx, _rx) = mpsc::channel(64);
        let err = invoker.run("prompt", tx).await.unwrap_err();

        match err {
            InvokeError::ExitedNonZero { exit_code, stderr } => {
                assert_eq!(exit_code, Some(5));
                assert_eq!(stderr.len(), MAX_STDERR_BYTES);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn stalled_event_consumer_does_not_stall_the_deadline() {
        let config = InvokerConfig {
            timeout: Duration::from_millis(200),
            max_retries: 0,
            ..fast_config()
        };
        let invoker = shell_invoker("head -c 100000 /dev/zero; sleep 30", config);
        // Capacity 1 and a receiver that never reads: progress events must
        // be dropped, not awaited.
        let (tx, _rx) = mpsc::channel(1);
        let started = std::time::Instant::now();
        let err = invoker.run("prompt", tx).await.unwrap_err();

        assert!(matches!(err, InvokeError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn progress_counter_is_monotonic() {
        let invoker = shell_invoker(
            "cat >/dev/null; head -c 100 /dev/zero; sleep 0.05; head -c 100 /dev/zero",
            fast_config(),
        );
        let (tx, rx) = mpsc::channel(64);
        invoker.run("prompt", tx).await.unwrap();

        let mut last = 0u64;
        for event in drain(rx).await {
            if let InvokerEvent::Progress { bytes_received } = event {
                assert!(bytes_received > last);
                last = bytes_received;
            }
        }
        assert_eq!(last, 200);
    }
}
