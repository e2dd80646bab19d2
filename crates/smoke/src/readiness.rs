//! Server readiness probing
//!
//! A probe that runs out of time is not an error: the run carries on and the
//! first navigation reports the real failure. A server that dies while we wait
//! is an error.

use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::{ReadinessConfig, ReadinessStrategy, ServerConfig};
use crate::error::{SmokeError, SmokeResult};
use crate::process::ManagedProcess;

/// Upper bound for a single probe attempt
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// How much captured stderr to quote when the server dies
const STDERR_TAIL_LINES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The probe succeeded
    Ready { attempts: u32, elapsed: Duration },
    /// The fixed settle delay elapsed
    Settled,
    /// Max wait elapsed without a successful probe
    GaveUp { attempts: u32, elapsed: Duration },
}

/// Wait for the server according to `config`
pub async fn wait_until_ready(
    process: &mut ManagedProcess,
    server: &ServerConfig,
    config: &ReadinessConfig,
) -> SmokeResult<Readiness> {
    match config.strategy {
        ReadinessStrategy::Fixed => {
            info!("Waiting {:?} for the server to settle", config.settle());
            sleep(config.settle()).await;
            check_alive(process)?;
            Ok(Readiness::Settled)
        }
        ReadinessStrategy::Port => {
            let address = format!("{}:{}", server.host, server.port);
            info!("Waiting for {} to accept connections", address);
            let address = address.as_str();
            poll(process, config, move || port_is_open(address)).await
        }
        ReadinessStrategy::Http => {
            let client = reqwest::Client::builder().timeout(PROBE_TIMEOUT).build()?;
            let url = format!("{}{}", server.base_url(), config.http_path);
            info!("Waiting for {} to answer", url);
            let (client, url) = (&client, url.as_str());
            poll(process, config, move || http_is_ok(client, url)).await
        }
    }
}

async fn poll<F, Fut>(process: &mut ManagedProcess, config: &ReadinessConfig, mut probe: F) -> SmokeResult<Readiness>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = Instant::now();
    let mut attempts = 0;

    loop {
        check_alive(process)?;

        attempts += 1;
        if probe().await {
            let elapsed = start.elapsed();
            info!("Server ready after {} attempts ({:?})", attempts, elapsed);
            return Ok(Readiness::Ready { attempts, elapsed });
        }

        let elapsed = start.elapsed();
        if elapsed >= config.max_wait() {
            warn!(
                "Server not ready after {:?} ({} attempts), continuing anyway",
                elapsed, attempts
            );
            return Ok(Readiness::GaveUp { attempts, elapsed });
        }

        sleep(config.poll_interval()).await;
    }
}

fn check_alive(process: &mut ManagedProcess) -> SmokeResult<()> {
    match process.has_exited() {
        Some(status) => {
            let stderr = process.stderr();
            let lines: Vec<&str> = stderr.lines().collect();
            let tail = lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join("\n");
            Err(SmokeError::ServerExited(if tail.is_empty() {
                status.to_string()
            } else {
                format!("{}\n{}", status, tail)
            }))
        }
        None => Ok(()),
    }
}

/// Check if a TCP port accepts connections
async fn port_is_open(address: &str) -> bool {
    matches!(timeout(PROBE_TIMEOUT, TcpStream::connect(address)).await, Ok(Ok(_)))
}

async fn http_is_ok(client: &reqwest::Client, url: &str) -> bool {
    match client.get(url).send().await {
        Ok(resp) if resp.status().is_success() => true,
        Ok(resp) => {
            debug!("Readiness probe returned {}", resp.status());
            false
        }
        Err(e) => {
            // connection refused is expected while the server starts
            if !e.is_connect() {
                debug!("Readiness probe error: {}", e);
            }
            false
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::process::{OutputSink, OutputStream, ProcessSpec};
    use crate::terminator::platform_terminator;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    fn quiet_sink() -> OutputSink {
        Arc::new(|_stream: OutputStream, _line: &str| {})
    }

    fn shell(script: &str) -> ProcessSpec {
        ProcessSpec {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            working_dir: std::env::temp_dir(),
            port: None,
        }
    }

    fn readiness(strategy: ReadinessStrategy, max_wait_ms: u64) -> ReadinessConfig {
        ReadinessConfig {
            strategy,
            settle_ms: 50,
            max_wait_ms,
            poll_interval_ms: 20,
            http_path: "/ok".to_string(),
        }
    }

    fn server_on(port: u16) -> ServerConfig {
        ServerConfig { port, ..Default::default() }
    }

    async fn unused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_port_ready_when_listening() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut process = ManagedProcess::new(platform_terminator(), Duration::from_millis(200));
        process.start(&shell("sleep 30"), quiet_sink()).unwrap();

        let result = wait_until_ready(&mut process, &server_on(port), &readiness(ReadinessStrategy::Port, 2000))
            .await
            .unwrap();
        assert!(matches!(result, Readiness::Ready { attempts: 1, .. }));

        process.terminate().await;
    }

    #[tokio::test]
    async fn test_port_gives_up_after_max_wait() {
        let port = unused_port().await;
        let mut process = ManagedProcess::new(platform_terminator(), Duration::from_millis(200));
        process.start(&shell("sleep 30"), quiet_sink()).unwrap();

        let result = wait_until_ready(&mut process, &server_on(port), &readiness(ReadinessStrategy::Port, 150))
            .await
            .unwrap();
        match result {
            Readiness::GaveUp { attempts, elapsed } => {
                assert!(attempts >= 2);
                assert!(elapsed >= Duration::from_millis(150));
            }
            other => panic!("expected GaveUp, got {:?}", other),
        }

        process.terminate().await;
    }

    #[tokio::test]
    async fn test_server_exit_fails_readiness() {
        let port = unused_port().await;
        let mut process = ManagedProcess::new(platform_terminator(), Duration::from_millis(200));
        process.start(&shell("echo boom >&2; exit 7"), quiet_sink()).unwrap();

        let err = wait_until_ready(&mut process, &server_on(port), &readiness(ReadinessStrategy::Port, 5000))
            .await
            .unwrap_err();
        assert!(matches!(err, SmokeError::ServerExited(_)));

        process.terminate().await;
    }

    #[tokio::test]
    async fn test_fixed_settle() {
        let port = unused_port().await;
        let mut process = ManagedProcess::new(platform_terminator(), Duration::from_millis(200));
        process.start(&shell("sleep 30"), quiet_sink()).unwrap();

        let result = wait_until_ready(&mut process, &server_on(port), &readiness(ReadinessStrategy::Fixed, 0))
            .await
            .unwrap();
        assert_eq!(result, Readiness::Settled);

        process.terminate().await;
    }
}
