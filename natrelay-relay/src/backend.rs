//! The automation backend the relay multiplexes onto.

use crate::config::BackendConfig;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to spawn backend `{program}`: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("backend exited during startup ({0})")]
    ExitedEarly(String),
    #[error("backend did not provide a {0} pipe")]
    MissingPipe(&'static str),
    #[error("backend is not running")]
    NotRunning,
    #[error("backend io: {0}")]
    Io(#[from] std::io::Error),
}

/// The backend's protocol channel: one writer, one reader.
pub struct BackendIo {
    pub input: Box<dyn AsyncWrite + Send + Unpin>,
    pub output: Box<dyn AsyncRead + Send + Unpin>,
}

#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Launches the backend, authorized by `token`, and waits until it is usable.
    async fn start(&self, token: &str) -> Result<BackendIo, BackendError>;

    /// Cheap liveness check, run on the health interval.
    async fn is_healthy(&self) -> bool;

    /// Stops the backend, forcing it down if it outlives `grace`.
    async fn stop(&self, grace: Duration);
}

/// A backend running as a child process speaking over stdin/stdout.
pub struct ProcessBackend {
    config: BackendConfig,
    child: Mutex<Option<Child>>,
}

impl ProcessBackend {
    pub fn new(config: BackendConfig) -> Self {
        Self {
            config,
            child: Mutex::new(None),
        }
    }

    fn command(&self, token: &str) -> Command {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .arg("--token")
            .arg(token)
            .arg("--host")
            .arg(&self.config.host)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn wait_ready(&self, child: &mut Child) -> Result<(), BackendError> {
        let Some(addr) = self.config.health_addr else {
            tokio::time::sleep(self.config.startup_poll).await;
            return check_running(child);
        };
        for _ in 0..self.config.startup_attempts {
            check_running(child)?;
            if port_open(addr).await {
                log::info!("backend is accepting connections on {}", addr);
                return Ok(());
            }
            tokio::time::sleep(self.config.startup_poll).await;
        }
        check_running(child)?;
        log::warn!(
            "backend did not open {} within {:?}; continuing anyway",
            addr,
            self.config.startup_poll * self.config.startup_attempts
        );
        Ok(())
    }
}

fn check_running(child: &mut Child) -> Result<(), BackendError> {
    match child.try_wait()? {
        Some(status) => Err(BackendError::ExitedEarly(status.to_string())),
        None => Ok(()),
    }
}

async fn port_open(addr: SocketAddr) -> bool {
    matches!(
        tokio::time::timeout(Duration::from_millis(500), TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

#[async_trait]
impl Backend for ProcessBackend {
    async fn start(&self, token: &str) -> Result<BackendIo, BackendError> {
        let mut child = self
            .command(token)
            .spawn()
            .map_err(|source| BackendError::Spawn {
                program: self.config.program.clone(),
                source,
            })?;
        log::info!(
            "spawned backend `{}` pid={}",
            self.config.program,
            child.id().unwrap_or(0)
        );

        let input = child.stdin.take().ok_or(BackendError::MissingPipe("stdin"))?;
        let output = child
            .stdout
            .take()
            .ok_or(BackendError::MissingPipe("stdout"))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log::warn!("backend: {}", line);
                }
            });
        }

        self.wait_ready(&mut child).await?;
        *self.child.lock().await = Some(child);

        Ok(BackendIo {
            input: Box::new(input),
            output: Box::new(output),
        })
    }

    async fn is_healthy(&self) -> bool {
        let mut child = self.child.lock().await;
        let running = match child.as_mut().map(Child::try_wait) {
            Some(Ok(None)) => true,
            Some(Ok(Some(status))) => {
                log::warn!("backend exited: {}", status);
                false
            }
            Some(Err(e)) => {
                log::warn!("cannot query backend status: {}", e);
                false
            }
            None => false,
        };
        drop(child);
        match (running, self.config.health_addr) {
            (true, Some(addr)) => port_open(addr).await,
            (running, _) => running,
        }
    }

    async fn stop(&self, grace: Duration) {
        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };
        if let Ok(Some(status)) = child.try_wait() {
            log::info!("backend already exited: {}", status);
            return;
        }

        terminate(&mut child);
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => log::info!("backend stopped: {}", status),
            Ok(Err(e)) => log::warn!("waiting for backend failed: {}", e),
            Err(_) => {
                log::warn!("backend did not exit within {:?}; killing it", grace);
                if let Err(e) = child.kill().await {
                    log::error!("failed to kill backend: {}", e);
                }
            }
        }
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match child.id() {
        Some(pid) => {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                log::warn!("SIGTERM to backend pid={} failed: {}", pid, e);
            }
        }
        None => log::debug!("backend already reaped"),
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        log::warn!("failed to signal backend: {}", e);
    }
}
