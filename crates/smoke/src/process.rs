//! Server process management - spawning, output capture and guaranteed termination

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::error::{SmokeError, SmokeResult};
use crate::terminator::ProcessTerminator;

/// How long to wait for a force-killed child to be reaped
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// How long output readers get to flush after the child is gone
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

/// What to launch
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,

    /// Port the process is expected to bind, used as a kill fallback
    pub port: Option<u16>,
}

impl ProcessSpec {
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    NotStarted,
    Running,
    Terminating,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputStream::Stdout => write!(f, "stdout"),
            OutputStream::Stderr => write!(f, "stderr"),
        }
    }
}

/// Receives every captured output line as it arrives
pub type OutputSink = Arc<dyn Fn(OutputStream, &str) + Send + Sync>;

/// Sink that forwards server output to the log
pub fn log_sink() -> OutputSink {
    Arc::new(|stream: OutputStream, line: &str| match stream {
        OutputStream::Stdout => info!("CLI Output: {}", line),
        OutputStream::Stderr => warn!("CLI Error: {}", line),
    })
}

#[derive(Debug, Default)]
struct CapturedOutput {
    stdout: String,
    stderr: String,
}

impl CapturedOutput {
    fn append(&mut self, stream: OutputStream, line: &str) {
        let buf = match stream {
            OutputStream::Stdout => &mut self.stdout,
            OutputStream::Stderr => &mut self.stderr,
        };
        buf.push_str(line);
        buf.push('\n');
    }
}

/// Handle to the server process and everything it spawns
pub struct ManagedProcess {
    pid: Option<u32>,
    port: Option<u16>,
    child: Option<Child>,
    state: ProcessState,
    output: Arc<Mutex<CapturedOutput>>,
    readers: Vec<JoinHandle<()>>,
    terminator: Arc<dyn ProcessTerminator>,
    grace_period: Duration,
}

impl ManagedProcess {
    pub fn new(terminator: Arc<dyn ProcessTerminator>, grace_period: Duration) -> Self {
        Self {
            pid: None,
            port: None,
            child: None,
            state: ProcessState::NotStarted,
            output: Arc::new(Mutex::new(CapturedOutput::default())),
            readers: Vec::new(),
            terminator,
            grace_period,
        }
    }

    /// Spawn the process with stdout and stderr captured
    pub fn start(&mut self, spec: &ProcessSpec, sink: OutputSink) -> SmokeResult<()> {
        let command_line = spec.command_line();

        if self.state != ProcessState::NotStarted {
            return Err(SmokeError::Spawn {
                command: command_line,
                source: std::io::Error::new(std::io::ErrorKind::AlreadyExists, "process was already started"),
            });
        }

        info!("Spawning `{}` in {}", command_line, spec.working_dir.display());

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group so the whole tree can be signalled at once
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| SmokeError::Spawn {
            command: command_line.clone(),
            source,
        })?;

        let pid = child.id();
        info!("Server started (pid: {})", pid.map(|p| p.to_string()).unwrap_or_else(|| "?".to_string()));

        if let Some(stdout) = child.stdout.take() {
            self.readers
                .push(spawn_reader(stdout, OutputStream::Stdout, self.output.clone(), sink.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            self.readers
                .push(spawn_reader(stderr, OutputStream::Stderr, self.output.clone(), sink));
        }

        self.pid = pid;
        self.port = spec.port;
        self.child = Some(child);
        self.state = ProcessState::Running;
        Ok(())
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Everything the process wrote to stdout so far
    pub fn stdout(&self) -> String {
        self.output.lock().stdout.clone()
    }

    /// Everything the process wrote to stderr so far
    pub fn stderr(&self) -> String {
        self.output.lock().stderr.clone()
    }

    /// Exit status if the process already exited, without blocking
    pub fn has_exited(&mut self) -> Option<ExitStatus> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(status) => status,
            Err(e) => {
                debug!("try_wait failed: {}", e);
                None
            }
        }
    }

    /// Stop the process tree. Never fails and is a no-op once terminated.
    ///
    /// Every strategy runs even if an earlier one looked successful, because
    /// the dev server forks workers that outlive a signal to the parent.
    pub async fn terminate(&mut self) {
        match self.state {
            ProcessState::Terminated => return,
            ProcessState::NotStarted => {
                self.state = ProcessState::Terminated;
                return;
            }
            ProcessState::Running | ProcessState::Terminating => {}
        }

        self.state = ProcessState::Terminating;

        if let Some(pid) = self.pid {
            info!("Killing server process (pid: {})...", pid);
            if let Err(e) = self.terminator.signal_graceful(pid).await {
                warn!("Graceful stop of pid {} failed: {}", pid, e);
            }

            info!("Killing process tree for PID {}...", pid);
            if let Err(e) = self.terminator.kill_descendants(pid).await {
                warn!("Killing children of pid {} failed: {}", pid, e);
            }
        }

        if let Some(port) = self.port {
            match self.terminator.kill_port_listeners(port).await {
                Ok(pids) if !pids.is_empty() => info!("Killed {} process(es) on port {}", pids.len(), port),
                Ok(_) => debug!("Nothing left listening on port {}", port),
                Err(e) => warn!("Port {} cleanup failed: {}", port, e),
            }
        }

        if let Some(child) = self.child.as_mut() {
            match timeout(self.grace_period, child.wait()).await {
                Ok(Ok(status)) => info!("Server process exited: {}", status),
                Ok(Err(e)) => warn!("Waiting for server process failed: {}", e),
                Err(_) => {
                    warn!("Process still running, force killing...");
                    if let Err(e) = child.start_kill() {
                        error!("Error force killing process: {}", e);
                    }
                    match timeout(REAP_TIMEOUT, child.wait()).await {
                        Ok(Ok(status)) => info!("Server process exited: {}", status),
                        Ok(Err(e)) => warn!("Reaping server process failed: {}", e),
                        Err(_) => error!("Server process did not exit after SIGKILL"),
                    }
                }
            }
        }

        for mut reader in self.readers.drain(..) {
            if timeout(READER_DRAIN_TIMEOUT, &mut reader).await.is_err() {
                // a detached grandchild still holds the pipe open
                reader.abort();
            }
        }

        self.child = None;
        self.state = ProcessState::Terminated;
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            warn!("Server process dropped before terminate(), killing it");
            let _ = child.start_kill();
        }
        for reader in &self.readers {
            reader.abort();
        }
    }
}

fn spawn_reader<R>(
    reader: R,
    stream: OutputStream,
    output: Arc<Mutex<CapturedOutput>>,
    sink: OutputSink,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\r', '\n']);
                    output.lock().append(stream, line);
                    sink(stream, line);
                }
                Err(e) => {
                    debug!("Reading server {} failed: {}", stream, e);
                    break;
                }
            }
        }
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::terminator::platform_terminator;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingTerminator {
        graceful: AtomicUsize,
        descendants: AtomicUsize,
        port: AtomicUsize,
        calls: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl ProcessTerminator for RecordingTerminator {
        async fn signal_graceful(&self, _pid: u32) -> std::io::Result<()> {
            self.graceful.fetch_add(1, Ordering::SeqCst);
            self.calls.lock().push("graceful");
            Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "refused"))
        }

        async fn kill_descendants(&self, _pid: u32) -> std::io::Result<()> {
            self.descendants.fetch_add(1, Ordering::SeqCst);
            self.calls.lock().push("descendants");
            Ok(())
        }

        async fn kill_port_listeners(&self, _port: u16) -> std::io::Result<Vec<u32>> {
            self.port.fetch_add(1, Ordering::SeqCst);
            self.calls.lock().push("port");
            Ok(vec![])
        }
    }

    fn sh(script: &str, port: Option<u16>) -> ProcessSpec {
        ProcessSpec {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            working_dir: PathBuf::from("."),
            port,
        }
    }

    fn quiet_sink() -> OutputSink {
        Arc::new(|_: OutputStream, _: &str| {})
    }

    #[tokio::test]
    async fn test_captures_stdout_and_stderr() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let sink: OutputSink = Arc::new(move |stream: OutputStream, line: &str| sink_seen.lock().push((stream, line.to_string())));

        let mut process = ManagedProcess::new(platform_terminator(), Duration::from_secs(2));
        process
            .start(&sh("echo hello; echo oops 1>&2; sleep 30", None), sink)
            .unwrap();
        assert_eq!(process.state(), ProcessState::Running);
        assert!(process.pid().is_some());

        for _ in 0..100 {
            if process.stdout().contains("hello") && process.stderr().contains("oops") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(process.stdout(), "hello\n");
        assert_eq!(process.stderr(), "oops\n");
        assert!(seen.lock().contains(&(OutputStream::Stdout, "hello".to_string())));

        process.terminate().await;
        assert_eq!(process.state(), ProcessState::Terminated);
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let terminator = Arc::new(RecordingTerminator::default());
        let mut process = ManagedProcess::new(terminator.clone(), Duration::from_millis(100));
        process.start(&sh("sleep 30", Some(1)), quiet_sink()).unwrap();

        for _ in 0..3 {
            process.terminate().await;
            assert_eq!(process.state(), ProcessState::Terminated);
        }

        assert_eq!(terminator.graceful.load(Ordering::SeqCst), 1);
        assert_eq!(terminator.descendants.load(Ordering::SeqCst), 1);
        assert_eq!(terminator.port.load(Ordering::SeqCst), 1);
        assert_eq!(*terminator.calls.lock(), vec!["graceful", "descendants", "port"]);
        assert!(process.has_exited().is_none(), "handle is released after terminate");
    }

    #[tokio::test]
    async fn test_force_kill_after_grace_period() {
        // the recording terminator never signals, so only the force kill can stop `sleep`
        let terminator = Arc::new(RecordingTerminator::default());
        let mut process = ManagedProcess::new(terminator, Duration::from_millis(50));
        process.start(&sh("exec sleep 30", None), quiet_sink()).unwrap();
        let pid = process.pid().unwrap() as i32;

        process.terminate().await;

        let alive = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok();
        assert!(!alive, "pid {} should be gone", pid);
    }

    #[tokio::test]
    async fn test_terminate_without_start() {
        let terminator = Arc::new(RecordingTerminator::default());
        let mut process = ManagedProcess::new(terminator.clone(), Duration::from_millis(50));
        process.terminate().await;
        process.terminate().await;
        assert_eq!(process.state(), ProcessState::Terminated);
        assert!(terminator.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_error() {
        let mut process = ManagedProcess::new(platform_terminator(), Duration::from_millis(50));
        let spec = ProcessSpec {
            program: "definitely-not-a-real-binary-7f3a".to_string(),
            args: vec![],
            working_dir: PathBuf::from("."),
            port: None,
        };
        let err = process.start(&spec, quiet_sink()).unwrap_err();
        assert!(matches!(err, SmokeError::Spawn { .. }));
        assert_eq!(process.state(), ProcessState::NotStarted);
    }

    #[tokio::test]
    async fn test_has_exited_reports_status() {
        let mut process = ManagedProcess::new(platform_terminator(), Duration::from_millis(50));
        process.start(&sh("exit 3", None), quiet_sink()).unwrap();

        let mut status = None;
        for _ in 0..100 {
            status = process.has_exited();
            if status.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(status.and_then(|s| s.code()), Some(3));
        process.terminate().await;
    }
}
