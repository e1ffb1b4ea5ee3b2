//! One subprocess and its standard streams.
//!
//! The child is owned by a waiter task that publishes its exit status on a
//! watch channel; everything else talks to the process through stdin, the
//! framed stdout reader and the stderr line reader.

use serde_json::Value;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::{ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{watch, Mutex};
use tokio_util::codec::{AnyDelimiterCodec, FramedRead};
use tokio_util::sync::CancellationToken;

#[cfg(target_os = "windows")]
use std::os::windows::process::CommandExt;

#[cfg(target_os = "windows")]
use super::utils::CREATE_NO_WINDOW;

use super::codec::{diagnostic_codec, RecordCodec};
use super::error::SessionError;

/// What to run and where.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            cwd: cwd.into(),
            ..Default::default()
        }
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
}

/// Exit status of a channel's process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    /// Terminating signal, when the platform reports one.
    pub signal: Option<i32>,
    /// Set when the termination was requested through [`ProcessChannel::kill`].
    pub killed: bool,
}

impl ProcessExit {
    fn from_status(status: ExitStatus, killed: bool) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
            killed,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }

    /// Success, or a termination this side asked for.
    pub fn is_expected(&self) -> bool {
        self.is_success() || self.killed
    }
}

impl std::fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code)?,
            (None, Some(signal)) => write!(f, "terminated by signal {}", signal)?,
            (None, None) => write!(f, "unknown exit status")?,
        }
        if self.killed {
            write!(f, ", killed")?;
        }
        Ok(())
    }
}

/// Owns exactly one OS process.
pub struct ProcessChannel {
    label: String,
    pid: Option<u32>,
    stdin: Mutex<Option<ChildStdin>>,
    stdout: parking_lot::Mutex<Option<ChildStdout>>,
    stderr: parking_lot::Mutex<Option<ChildStderr>>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
    kill_token: CancellationToken,
    killed: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl ProcessChannel {
    /// Spawns the process with piped stdio. Must be called inside a tokio runtime.
    pub fn start(spec: &LaunchSpec) -> Result<Self, SessionError> {
        let program = spec.program.display().to_string();

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        #[cfg(target_os = "windows")]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let mut child = cmd.spawn().map_err(|e| SessionError::Spawn {
            program: program.clone(),
            reason: e.to_string(),
        })?;

        let missing = |stream: &str| SessionError::Spawn {
            program: program.clone(),
            reason: format!("failed to capture {}", stream),
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let pid = child.id();
        let label = spec
            .program
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.clone());
        log::info!("[{label}] Spawned pid {:?} in {}", pid, spec.cwd.display());

        let (exit_tx, exit_rx) = watch::channel(None);
        let kill_token = CancellationToken::new();
        let killed = Arc::new(AtomicBool::new(false));

        let token = kill_token.clone();
        let killed_flag = killed.clone();
        let task_label = label.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = token.cancelled() => {
                    if let Err(err) = child.start_kill() {
                        log::debug!("[{task_label}] start_kill: {}", err);
                    }
                    child.wait().await
                }
            };

            let killed = killed_flag.load(Ordering::SeqCst);
            let exit = match status {
                Ok(status) => ProcessExit::from_status(status, killed),
                Err(err) => {
                    log::warn!("[{task_label}] Failed to wait for process: {}", err);
                    ProcessExit {
                        code: None,
                        signal: None,
                        killed,
                    }
                }
            };
            log::info!("[{task_label}] Process exited ({})", exit);
            let _ = exit_tx.send(Some(exit));
        });

        Ok(Self {
            label,
            pid,
            stdin: Mutex::new(Some(stdin)),
            stdout: parking_lot::Mutex::new(Some(stdout)),
            stderr: parking_lot::Mutex::new(Some(stderr)),
            exit_rx,
            kill_token,
            killed,
            closed: AtomicBool::new(false),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Serializes one record and writes it as a single line.
    pub async fn write_record(&self, record: &Value) -> Result<(), SessionError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut guard = self.stdin.lock().await;
        if self.closed.load(Ordering::SeqCst) || self.exit_status().is_some() {
            guard.take();
            return Err(SessionError::ChannelClosed);
        }
        let stdin = guard.as_mut().ok_or(SessionError::ChannelClosed)?;

        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        }
        .await;

        match written {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => {
                guard.take();
                Err(SessionError::ChannelClosed)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Framed stdout records. Yields `None` once the reader has been taken.
    pub fn records(&self) -> Option<FramedRead<ChildStdout, RecordCodec>> {
        self.stdout
            .lock()
            .take()
            .map(|stdout| FramedRead::new(stdout, RecordCodec::new()))
    }

    /// Raw stderr lines. Yields `None` once the reader has been taken.
    pub fn diagnostics(&self) -> Option<FramedRead<ChildStderr, AnyDelimiterCodec>> {
        self.stderr
            .lock()
            .take()
            .map(|stderr| FramedRead::new(stderr, diagnostic_codec()))
    }

    /// Resolves with the exit status once the process is gone.
    pub async fn terminated(&self) -> ProcessExit {
        self.exit_signal().wait().await
    }

    /// Detached handle on the exit status that does not keep the channel alive.
    pub fn exit_signal(&self) -> ExitSignal {
        ExitSignal {
            rx: self.exit_rx.clone(),
            killed: self.killed.clone(),
        }
    }

    pub fn exit_status(&self) -> Option<ProcessExit> {
        *self.exit_rx.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.exit_status().is_some()
    }

    /// Requests termination. Safe to call repeatedly and after the process exited.
    pub fn kill(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.exit_status().is_none() {
            self.killed.store(true, Ordering::SeqCst);
            log::debug!("[{}] Killing pid {:?}", self.label, self.pid);
        }
        self.kill_token.cancel();
        if let Ok(mut stdin) = self.stdin.try_lock() {
            stdin.take();
        }
    }
}

#[derive(Clone)]
pub struct ExitSignal {
    rx: watch::Receiver<Option<ProcessExit>>,
    killed: Arc<AtomicBool>,
}

impl ExitSignal {
    pub async fn wait(mut self) -> ProcessExit {
        loop {
            if let Some(exit) = *self.rx.borrow_and_update() {
                return exit;
            }
            if self.rx.changed().await.is_err() {
                // Waiter task gone without reporting, e.g. runtime shutdown.
                return (*self.rx.borrow()).unwrap_or(ProcessExit {
                    code: None,
                    signal: None,
                    killed: self.killed.load(Ordering::SeqCst),
                });
            }
        }
    }
}

impl Drop for ProcessChannel {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;
    use std::time::Duration;

    fn sh(script: &str) -> LaunchSpec {
        LaunchSpec::new("sh", std::env::temp_dir()).args(["-c", script])
    }

    #[tokio::test]
    async fn reports_exit_code() {
        let channel = ProcessChannel::start(&sh("exit 3")).unwrap();
        let exit = channel.terminated().await;
        assert_eq!(exit.code, Some(3));
        assert!(!exit.killed);
        assert!(!exit.is_expected());
        assert_eq!(channel.exit_status(), Some(exit));
    }

    #[tokio::test]
    async fn external_sigterm_is_not_expected() {
        let channel = ProcessChannel::start(&sh("kill -TERM $$")).unwrap();
        let exit = channel.terminated().await;
        assert_eq!(exit.code, None);
        assert_eq!(exit.signal, Some(15));
        assert!(!exit.is_expected());
    }

    #[tokio::test]
    async fn kill_is_idempotent_and_expected() {
        let channel = ProcessChannel::start(&sh("sleep 30")).unwrap();
        channel.kill();
        channel.kill();
        let exit = tokio::time::timeout(Duration::from_secs(5), channel.terminated())
            .await
            .unwrap();
        assert!(exit.killed);
        assert!(exit.is_expected());
        channel.kill();

        let err = channel.write_record(&json!({"type": "user"})).await.unwrap_err();
        assert!(matches!(err, SessionError::ChannelClosed));
    }

    #[tokio::test]
    async fn kill_after_exit_does_not_mark_killed() {
        let channel = ProcessChannel::start(&sh("exit 0")).unwrap();
        let exit = channel.terminated().await;
        channel.kill();
        assert!(!exit.killed);
        assert!(exit.is_success());
    }

    #[tokio::test]
    async fn echoes_records_through_cat() {
        let channel = ProcessChannel::start(&LaunchSpec::new("cat", std::env::temp_dir())).unwrap();
        let mut records = channel.records().unwrap();
        assert!(channel.records().is_none());

        channel.write_record(&json!({"type": "ping", "n": 1})).await.unwrap();
        let record = records.next().await.unwrap().unwrap();
        assert_eq!(record, json!({"type": "ping", "n": 1}));

        channel.kill();
        channel.terminated().await;
        assert!(records.next().await.is_none());
    }

    #[tokio::test]
    async fn stderr_lines_are_not_parsed() {
        let channel = ProcessChannel::start(&sh("echo '{\"a\":1}' >&2; echo plain >&2")).unwrap();
        let lines: Vec<String> = channel
            .diagnostics()
            .unwrap()
            .filter_map(|line| async move { line.ok().map(|b| String::from_utf8_lossy(&b).into_owned()) })
            .collect()
            .await;
        assert_eq!(lines, vec!["{\"a\":1}".to_string(), "plain".to_string()]);
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let spec = LaunchSpec::new("/nonexistent/agent-cli", std::env::temp_dir());
        let err = ProcessChannel::start(&spec).err().unwrap();
        assert!(matches!(err, SessionError::Spawn { .. }));
    }
}
