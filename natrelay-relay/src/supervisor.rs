use crate::backend::{Backend, BackendError};
use bytes::Bytes;
use parking_lot::Mutex as SyncMutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

const READ_BUFFER_SIZE: usize = 64 * 1024;
const EVENT_BUFFER_SIZE: usize = 256;

/// What the backend's output pipe produced. `generation` identifies which
/// incarnation of the backend the event belongs to.
#[derive(Debug)]
pub enum BackendEvent {
    Output { generation: u64, bytes: Bytes },
    Exited { generation: u64 },
}

struct Reader {
    task: JoinHandle<()>,
    alive: Arc<AtomicBool>,
}

/// Owns the running backend: its input pipe, the task draining its output,
/// and the incarnation counter used to discard stale events.
pub struct BackendSupervisor {
    backend: Arc<dyn Backend>,
    token: SyncMutex<Option<String>>,
    input: Mutex<Option<Box<dyn AsyncWrite + Send + Unpin>>>,
    reader: SyncMutex<Option<Reader>>,
    generation: AtomicU64,
    events: mpsc::Sender<BackendEvent>,
}

impl BackendSupervisor {
    pub fn new(backend: Arc<dyn Backend>) -> (Self, mpsc::Receiver<BackendEvent>) {
        let (events, rx) = mpsc::channel(EVENT_BUFFER_SIZE);
        let supervisor = Self {
            backend,
            token: SyncMutex::new(None),
            input: Mutex::new(None),
            reader: SyncMutex::new(None),
            generation: AtomicU64::new(0),
            events,
        };
        (supervisor, rx)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Starts the backend for the first time.
    pub async fn start(&self, token: &str) -> Result<u64, BackendError> {
        *self.token.lock() = Some(token.to_string());
        self.launch(token).await
    }

    /// Starts a fresh backend with the token of the original start.
    pub async fn restart(&self, grace: Duration) -> Result<u64, BackendError> {
        self.stop(grace).await;
        let token = self.token.lock().clone().ok_or(BackendError::NotRunning)?;
        self.launch(&token).await
    }

    async fn launch(&self, token: &str) -> Result<u64, BackendError> {
        let io = self.backend.start(token).await?;
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let alive = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(read_output(
            io.output,
            generation,
            alive.clone(),
            self.events.clone(),
        ));
        *self.input.lock().await = Some(io.input);
        *self.reader.lock() = Some(Reader { task, alive });
        log::info!("backend generation {} running", generation);
        Ok(generation)
    }

    /// Writes one complete frame. Callers serialize through the write queue.
    pub async fn write(&self, payload: &[u8]) -> Result<(), BackendError> {
        let mut input = self.input.lock().await;
        let pipe = input.as_mut().ok_or(BackendError::NotRunning)?;
        pipe.write_all(payload).await?;
        pipe.flush().await?;
        Ok(())
    }

    /// Drops the input pipe after a write that may have left a partial frame
    /// on it. Later writes fail with `NotRunning` until the next restart.
    pub async fn discard_input(&self) {
        if self.input.lock().await.take().is_some() {
            log::warn!(
                "backend generation {} input discarded after a failed write",
                self.generation()
            );
        }
    }

    pub async fn is_alive(&self) -> bool {
        let reading = self
            .reader
            .lock()
            .as_ref()
            .is_some_and(|r| r.alive.load(Ordering::Acquire));
        reading && self.backend.is_healthy().await
    }

    /// Stops the current backend. Output of a deliberately stopped backend
    /// produces no `Exited` event.
    pub async fn stop(&self, grace: Duration) {
        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            reader.task.abort();
            let _ = reader.task.await;
        }
        if let Some(mut input) = self.input.lock().await.take() {
            let _ = input.shutdown().await;
        }
        self.backend.stop(grace).await;
    }
}

async fn read_output(
    mut output: Box<dyn AsyncRead + Send + Unpin>,
    generation: u64,
    alive: Arc<AtomicBool>,
    events: mpsc::Sender<BackendEvent>,
) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match output.read(&mut buf).await {
            Ok(0) => {
                log::warn!("backend generation {} closed its output", generation);
                break;
            }
            Ok(n) => {
                let event = BackendEvent::Output {
                    generation,
                    bytes: Bytes::copy_from_slice(&buf[..n]),
                };
                if events.send(event).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                log::error!("reading backend output failed: {}", e);
                break;
            }
        }
    }
    alive.store(false, Ordering::Release);
    let _ = events.send(BackendEvent::Exited { generation }).await;
}
