//! Scripted in-memory backend for tests.

use crate::backend::{Backend, BackendError, BackendIo};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

const PIPE_CAPACITY: usize = 1024 * 1024;

/// Backend double that answers requests the way the real one does:
///
/// * `createPage` / `createResource` reply with a fresh `pageId` / `resourceId`
/// * `closePage` is acknowledged and recorded
/// * `hold` is never answered
/// * anything else with an id is echoed back as `result`
///
/// Every write the relay performs is recorded verbatim, one entry per write.
#[derive(Clone, Default)]
pub struct FakeBackend {
    inner: Arc<FakeInner>,
}

#[derive(Default)]
struct FakeInner {
    writes: Mutex<Vec<Bytes>>,
    closed_pages: Mutex<Vec<String>>,
    tokens: Mutex<Vec<String>>,
    output: tokio::sync::Mutex<Option<DuplexStream>>,
    alive: AtomicBool,
    unresponsive: AtomicBool,
    fail_writes: AtomicBool,
    stall_writes: AtomicBool,
    fail_starts: AtomicUsize,
    starts: AtomicUsize,
    stops: AtomicUsize,
    next_resource: AtomicU64,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every write received, in order.
    pub fn writes(&self) -> Vec<Bytes> {
        self.inner.writes.lock().clone()
    }

    /// Writes that parsed as JSON.
    pub fn written_json(&self) -> Vec<Value> {
        self.writes()
            .iter()
            .filter_map(|w| serde_json::from_slice(w).ok())
            .collect()
    }

    pub fn closed_pages(&self) -> Vec<String> {
        self.inner.closed_pages.lock().clone()
    }

    pub fn tokens(&self) -> Vec<String> {
        self.inner.tokens.lock().clone()
    }

    pub fn start_count(&self) -> usize {
        self.inner.starts.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.inner.stops.load(Ordering::SeqCst)
    }

    /// Makes the next `n` starts fail.
    pub fn fail_starts(&self, n: usize) {
        self.inner.fail_starts.store(n, Ordering::SeqCst);
    }

    /// Makes writes fail (until cleared or the next start).
    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Makes the next write accept half its bytes and then hang (until the
    /// next start).
    pub fn stall_writes(&self) {
        self.inner.stall_writes.store(true, Ordering::SeqCst);
    }

    /// Makes health checks fail while the output pipe stays open (until the next
    /// start).
    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.inner.unresponsive.store(unresponsive, Ordering::SeqCst);
    }

    /// Sends an unsolicited message to the relay.
    pub async fn emit(&self, value: Value) {
        self.inner.emit(value).await;
    }

    pub async fn emit_raw(&self, bytes: &[u8]) {
        self.inner.emit_raw(bytes).await;
    }

    /// Simulates the backend dying: output hits EOF and health checks fail.
    pub async fn crash(&self) {
        self.inner.alive.store(false, Ordering::SeqCst);
        self.inner.output.lock().await.take();
    }
}

impl FakeInner {
    async fn emit(&self, value: Value) {
        let mut line = value.to_string().into_bytes();
        line.push(b'\n');
        self.emit_raw(&line).await;
    }

    async fn emit_raw(&self, bytes: &[u8]) {
        if let Some(out) = self.output.lock().await.as_mut() {
            let _ = out.write_all(bytes).await;
        }
    }

    fn reply_to(&self, msg: &Value) -> Option<Value> {
        let id = msg.get("id")?.clone();
        let method = msg.get("method")?.as_str()?;
        let result = match method {
            "hold" => return None,
            "createPage" => {
                let n = self.next_resource.fetch_add(1, Ordering::SeqCst) + 1;
                json!({ "pageId": format!("page-{n}") })
            }
            "createResource" => {
                let n = self.next_resource.fetch_add(1, Ordering::SeqCst) + 1;
                json!({ "resourceId": format!("res-{n}") })
            }
            "closePage" => {
                let page = msg
                    .pointer("/params/pageId")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                self.closed_pages.lock().push(page.to_string());
                json!({})
            }
            other => json!({ "method": other, "params": msg.get("params") }),
        };
        Some(json!({ "jsonrpc": "2.0", "id": id, "result": result }))
    }
}

async fn serve(inner: Arc<FakeInner>, mut writes: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(write) = writes.recv().await {
        inner.writes.lock().push(write.clone());
        let Ok(value) = serde_json::from_slice::<Value>(&write) else {
            continue;
        };
        let messages = match value {
            Value::Array(items) => items,
            other => vec![other],
        };
        for msg in messages {
            if let Some(reply) = inner.reply_to(&msg) {
                inner.emit(reply).await;
            }
        }
    }
}

/// Hands each `poll_write` buffer over whole, so one relay write is one entry.
struct RecordingWriter {
    inner: Arc<FakeInner>,
    tx: mpsc::UnboundedSender<Bytes>,
    stalled: bool,
}

impl AsyncWrite for RecordingWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.inner.fail_writes.load(Ordering::SeqCst) {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "scripted write failure",
            )));
        }
        let mut len = buf.len();
        if this.inner.stall_writes.load(Ordering::SeqCst) {
            if this.stalled {
                return Poll::Pending;
            }
            this.stalled = true;
            len = (len / 2).max(1);
        }
        match this.tx.send(Bytes::copy_from_slice(&buf[..len])) {
            Ok(()) => Poll::Ready(Ok(len)),
            Err(_) => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn start(&self, token: &str) -> Result<BackendIo, BackendError> {
        let inner = &self.inner;
        inner.starts.fetch_add(1, Ordering::SeqCst);
        inner.tokens.lock().push(token.to_string());
        let failing = inner
            .fail_starts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(BackendError::Io(io::Error::new(
                io::ErrorKind::Other,
                "scripted start failure",
            )));
        }

        let (relay_side, backend_side) = tokio::io::duplex(PIPE_CAPACITY);
        *inner.output.lock().await = Some(backend_side);
        inner.fail_writes.store(false, Ordering::SeqCst);
        inner.stall_writes.store(false, Ordering::SeqCst);
        inner.unresponsive.store(false, Ordering::SeqCst);
        inner.alive.store(true, Ordering::SeqCst);

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(serve(inner.clone(), rx));

        Ok(BackendIo {
            input: Box::new(RecordingWriter {
                inner: inner.clone(),
                tx,
                stalled: false,
            }),
            output: Box::new(relay_side),
        })
    }

    async fn is_healthy(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst) && !self.inner.unresponsive.load(Ordering::SeqCst)
    }

    async fn stop(&self, _grace: Duration) {
        self.inner.stops.fetch_add(1, Ordering::SeqCst);
        self.inner.alive.store(false, Ordering::SeqCst);
        self.inner.output.lock().await.take();
    }
}
