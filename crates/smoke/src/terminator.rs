//! Platform process-tree termination strategies
//!
//! Descendant discovery is heuristic, so the contract is about the port: once
//! a [`ManagedProcess`](crate::process::ManagedProcess) has run every strategy,
//! nothing spawned by the run is still listening on the server port.

use async_trait::async_trait;
use std::io;
use std::process::{Output, Stdio};
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Termination strategies used by `ManagedProcess::terminate`
#[async_trait]
pub trait ProcessTerminator: Send + Sync {
    /// Ask the process to stop (catchable signal)
    async fn signal_graceful(&self, pid: u32) -> io::Result<()>;

    /// Stop processes spawned under `pid`
    async fn kill_descendants(&self, pid: u32) -> io::Result<()>;

    /// Kill whatever listens on `port`; returns the pids that were signalled
    async fn kill_port_listeners(&self, port: u16) -> io::Result<Vec<u32>>;
}

/// The terminator for the current platform
pub fn platform_terminator() -> Arc<dyn ProcessTerminator> {
    #[cfg(unix)]
    {
        Arc::new(UnixTerminator)
    }
    #[cfg(windows)]
    {
        Arc::new(WindowsTerminator)
    }
}

async fn run_quiet(program: &str, args: &[String]) -> io::Result<Output> {
    debug!("Running {} {}", program, args.join(" "));
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await
}

/// Parse one pid per line, skipping blanks, junk and our own pid
fn parse_pid_lines(output: &str) -> Vec<u32> {
    let own = std::process::id();
    let mut pids: Vec<u32> = output
        .lines()
        .filter_map(|line| line.trim().parse::<u32>().ok())
        .filter(|pid| *pid != 0 && *pid != own)
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

/// Kill every pid listening on `port`. A failed kill is logged and the rest still run.
async fn kill_each<F, Fut>(port: u16, pids: &[u32], mut kill: F)
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = io::Result<()>>,
{
    for pid in pids {
        info!("Killing process on port {}: {}", port, pid);
        if let Err(e) = kill(*pid).await {
            warn!("Failed to kill pid {} on port {}: {}", pid, port, e);
        }
    }
}

/// Unix: signals via nix, `pkill -P` for children, `lsof` for the port
#[cfg(unix)]
pub struct UnixTerminator;

#[cfg(unix)]
impl UnixTerminator {
    fn send(pid: i32, signal: nix::sys::signal::Signal) -> io::Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        match kill(Pid::from_raw(pid), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(io::Error::from(e)),
        }
    }
}

#[cfg(unix)]
#[async_trait]
impl ProcessTerminator for UnixTerminator {
    async fn signal_graceful(&self, pid: u32) -> io::Result<()> {
        Self::send(pid as i32, nix::sys::signal::Signal::SIGTERM)
    }

    async fn kill_descendants(&self, pid: u32) -> io::Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        // pkill exits 1 when nothing matched, which is fine here
        let output = run_quiet("pkill", &["-TERM".to_string(), "-P".to_string(), pid.to_string()]).await?;
        debug!("pkill -P {} exited with {}", pid, output.status);

        // The server runs in its own process group, so this reaches grandchildren too
        match killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(io::Error::from(e)),
        }
    }

    async fn kill_port_listeners(&self, port: u16) -> io::Result<Vec<u32>> {
        let output = run_quiet("lsof", &[format!("-ti:{}", port)]).await?;
        let pids = parse_pid_lines(&String::from_utf8_lossy(&output.stdout));

        kill_each(port, &pids, |pid| async move { Self::send(pid as i32, nix::sys::signal::Signal::SIGKILL) }).await;

        Ok(pids)
    }
}

/// Windows: `taskkill` for the tree, `netstat -ano` for the port
#[cfg(windows)]
pub struct WindowsTerminator;

#[cfg(windows)]
#[async_trait]
impl ProcessTerminator for WindowsTerminator {
    async fn signal_graceful(&self, pid: u32) -> io::Result<()> {
        run_quiet("taskkill", &["/pid".to_string(), pid.to_string()]).await?;
        Ok(())
    }

    async fn kill_descendants(&self, pid: u32) -> io::Result<()> {
        run_quiet(
            "taskkill",
            &["/pid".to_string(), pid.to_string(), "/f".to_string(), "/t".to_string()],
        )
        .await?;
        Ok(())
    }

    async fn kill_port_listeners(&self, port: u16) -> io::Result<Vec<u32>> {
        let output = run_quiet("netstat", &["-ano".to_string(), "-p".to_string(), "tcp".to_string()]).await?;
        let pids = parse_netstat_listeners(&String::from_utf8_lossy(&output.stdout), port);

        kill_each(port, &pids, |pid| async move {
            run_quiet("taskkill", &["/pid".to_string(), pid.to_string(), "/f".to_string()])
                .await
                .map(|_| ())
        })
        .await;

        Ok(pids)
    }
}

/// Pids from `netstat -ano` rows listening on `port`
#[cfg_attr(not(windows), allow(dead_code))]
fn parse_netstat_listeners(output: &str, port: u16) -> Vec<u32> {
    let suffix = format!(":{}", port);
    let pids: String = output
        .lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            match cols.as_slice() {
                [_proto, local, _remote, state, pid] if local.ends_with(&suffix) && *state == "LISTENING" => {
                    Some(format!("{}\n", pid))
                }
                _ => None,
            }
        })
        .collect();
    parse_pid_lines(&pids)
}
