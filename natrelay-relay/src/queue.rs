//! Single-writer queue in front of the backend's input.
//!
//! Every frame bound for the backend, from any client or from the relay
//! itself, goes through one worker task. Writes therefore reach the backend
//! whole, one at a time, in the order they were enqueued. A write that fails
//! or times out takes the input pipe with it, so nothing is ever appended to
//! a partial frame.

use crate::error::RelayError;
use crate::state::{Lifecycle, RelayState};
use crate::supervisor::BackendSupervisor;
use crate::RecoveryReason;
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

struct WriteQueueItem {
    payload: Bytes,
    responder: oneshot::Sender<Result<(), RelayError>>,
    enqueued_at: Instant,
}

impl WriteQueueItem {
    fn respond(self, result: Result<(), RelayError>) {
        let _ = self.responder.send(result);
    }
}

#[derive(Clone)]
pub struct WriteQueue {
    tx: mpsc::UnboundedSender<WriteQueueItem>,
    lifecycle: Arc<Lifecycle>,
}

/// The consuming half of a [`WriteQueue`]; drive it with [`WriteWorker::run`].
pub struct WriteWorker {
    rx: mpsc::UnboundedReceiver<WriteQueueItem>,
    supervisor: Arc<BackendSupervisor>,
    lifecycle: Arc<Lifecycle>,
    write_timeout: Duration,
    failures: mpsc::UnboundedSender<RecoveryReason>,
}

impl WriteQueue {
    /// Write failures are reported on `failures`.
    pub fn new(
        supervisor: Arc<BackendSupervisor>,
        lifecycle: Arc<Lifecycle>,
        write_timeout: Duration,
        failures: mpsc::UnboundedSender<RecoveryReason>,
    ) -> (Self, WriteWorker) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = WriteWorker {
            rx,
            supervisor,
            lifecycle: lifecycle.clone(),
            write_timeout,
            failures,
        };
        (Self { tx, lifecycle }, worker)
    }

    /// Queues `payload` and waits until it has been written.
    pub async fn enqueue(&self, payload: Bytes) -> Result<(), RelayError> {
        if !self.lifecycle.is_open() {
            return Err(self.rejection());
        }
        let (responder, done) = oneshot::channel();
        self.tx
            .send(WriteQueueItem {
                payload,
                responder,
                enqueued_at: Instant::now(),
            })
            .map_err(|_| RelayError::Closing)?;
        done.await.unwrap_or(Err(RelayError::Closing))
    }

    fn rejection(&self) -> RelayError {
        match self.lifecycle.state() {
            RelayState::Closing | RelayState::Closed => RelayError::Closing,
            _ if self.lifecycle.is_shutting_down() => RelayError::Closing,
            _ if self.lifecycle.is_recovering() => RelayError::Recovering,
            state => RelayError::NotOpen(state),
        }
    }
}

impl WriteWorker {
    /// Writes queued frames until the relay starts closing, then rejects
    /// whatever is left.
    pub async fn run(self) {
        let WriteWorker {
            mut rx,
            supervisor,
            lifecycle,
            write_timeout,
            failures,
        } = self;
        let mut state = lifecycle.subscribe();
        loop {
            tokio::select! {
                item = rx.recv() => {
                    let Some(item) = item else { break };
                    if !lifecycle.is_open() {
                        let err = if lifecycle.is_recovering() {
                            RelayError::Recovering
                        } else {
                            RelayError::Closing
                        };
                        item.respond(Err(err));
                        continue;
                    }
                    log::trace!(
                        "writing {} bytes after {:?} in queue",
                        item.payload.len(),
                        item.enqueued_at.elapsed()
                    );
                    let write = supervisor.write(&item.payload);
                    let result = match tokio::time::timeout(write_timeout, write).await {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => Err(RelayError::Backend(e)),
                        Err(_) => Err(RelayError::WriteTimeout(write_timeout)),
                    };
                    if let Err(e) = &result {
                        log::error!("backend write failed: {}", e);
                        supervisor.discard_input().await;
                        let _ = failures.send(RecoveryReason::WriteFailed);
                    }
                    item.respond(result);
                }
                changed = state.changed() => {
                    if changed.is_err() || *state.borrow() >= RelayState::Closing {
                        break;
                    }
                }
            }
        }

        rx.close();
        let mut rejected = 0;
        while let Ok(item) = rx.try_recv() {
            item.respond(Err(RelayError::Closing));
            rejected += 1;
        }
        if rejected > 0 {
            log::info!("rejected {} queued writes on shutdown", rejected);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendError;
    use crate::fake::FakeBackend;
    use k9::assert_equal;

    struct OpenQueue {
        queue: WriteQueue,
        fake: FakeBackend,
        supervisor: Arc<BackendSupervisor>,
        lifecycle: Arc<Lifecycle>,
        failures: mpsc::UnboundedReceiver<RecoveryReason>,
    }

    async fn open_queue(write_timeout: Duration) -> OpenQueue {
        let fake = FakeBackend::new();
        let (supervisor, _events) = BackendSupervisor::new(Arc::new(fake.clone()));
        let supervisor = Arc::new(supervisor);
        supervisor.start("token").await.unwrap();

        let lifecycle = Arc::new(Lifecycle::new());
        lifecycle.advance(RelayState::Opened);
        let (failures, failures_rx) = mpsc::unbounded_channel();
        let (queue, worker) = WriteQueue::new(
            supervisor.clone(),
            lifecycle.clone(),
            write_timeout,
            failures,
        );
        tokio::spawn(worker.run());
        OpenQueue {
            queue,
            fake,
            supervisor,
            lifecycle,
            failures: failures_rx,
        }
    }

    #[tokio::test]
    async fn rejects_before_open() {
        let fake = FakeBackend::new();
        let (supervisor, _events) = BackendSupervisor::new(Arc::new(fake.clone()));
        let lifecycle = Arc::new(Lifecycle::new());
        let (failures, _rx) = mpsc::unbounded_channel();
        let (queue, worker) = WriteQueue::new(
            Arc::new(supervisor),
            lifecycle,
            Duration::from_secs(1),
            failures,
        );
        tokio::spawn(worker.run());

        let err = queue.enqueue(Bytes::from_static(b"{}\n")).await.unwrap_err();
        assert!(matches!(err, RelayError::NotOpen(RelayState::Pending)));
        assert!(fake.writes().is_empty());
    }

    #[tokio::test]
    async fn concurrent_writes_stay_whole_and_ordered_per_sender() {
        let OpenQueue { queue, fake, .. } = open_queue(Duration::from_secs(1)).await;

        let mut tasks = Vec::new();
        for sender in 0..8u64 {
            let queue = queue.clone();
            tasks.push(tokio::spawn(async move {
                for seq in 0..25u64 {
                    let frame = format!("{{\"id\":{},\"method\":\"hold\"}}\n", sender * 1000 + seq);
                    queue.enqueue(Bytes::from(frame)).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        let ids: Vec<u64> = fake
            .written_json()
            .iter()
            .map(|v| v["id"].as_u64().unwrap())
            .collect();
        assert_equal!(ids.len(), 200);
        assert_equal!(fake.writes().len(), 200);
        for sender in 0..8u64 {
            let mine: Vec<u64> = ids.iter().copied().filter(|id| id / 1000 == sender).collect();
            let expected: Vec<u64> = (0..25).map(|seq| sender * 1000 + seq).collect();
            assert_equal!(mine, expected);
        }
    }

    #[tokio::test]
    async fn failed_write_signals_recovery_and_disables_the_pipe() {
        let OpenQueue {
            queue,
            fake,
            supervisor,
            mut failures,
            ..
        } = open_queue(Duration::from_secs(1)).await;

        fake.set_fail_writes(true);
        let err = queue.enqueue(Bytes::from_static(b"{\"id\":1}\n")).await.unwrap_err();
        assert!(matches!(err, RelayError::Backend(_)));
        assert_equal!(failures.recv().await, Some(RecoveryReason::WriteFailed));

        fake.set_fail_writes(false);
        let err = queue.enqueue(Bytes::from_static(b"{\"id\":2}\n")).await.unwrap_err();
        assert!(matches!(err, RelayError::Backend(BackendError::NotRunning)));

        supervisor.restart(Duration::from_millis(10)).await.unwrap();
        queue.enqueue(Bytes::from_static(b"{\"id\":3}\n")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_equal!(fake.written_json(), vec![serde_json::json!({"id": 3})]);
    }

    #[tokio::test]
    async fn timed_out_write_leaves_no_frame_appended_to_it() {
        let OpenQueue {
            queue,
            fake,
            supervisor,
            mut failures,
            ..
        } = open_queue(Duration::from_millis(50)).await;

        let first: &[u8] = b"{\"id\":1,\"method\":\"AAAA\"}\n";
        fake.stall_writes();
        let err = queue
            .enqueue(Bytes::from_static(first))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::WriteTimeout(_)));
        assert_equal!(failures.recv().await, Some(RecoveryReason::WriteFailed));

        let err = queue
            .enqueue(Bytes::from_static(b"{\"id\":2,\"method\":\"BBBB\"}\n"))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Backend(BackendError::NotRunning)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        let written: Vec<u8> = fake.writes().concat();
        assert_equal!(written, first[..first.len() / 2].to_vec());

        supervisor.restart(Duration::from_millis(10)).await.unwrap();
        queue
            .enqueue(Bytes::from_static(b"{\"id\":3,\"method\":\"hold\"}\n"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_equal!(
            fake.writes().last().cloned(),
            Some(Bytes::from_static(b"{\"id\":3,\"method\":\"hold\"}\n"))
        );
    }

    #[tokio::test]
    async fn closing_rejects_queued_items() {
        let OpenQueue {
            queue, lifecycle, ..
        } = open_queue(Duration::from_secs(1)).await;
        lifecycle.begin_shutdown();
        lifecycle.advance(RelayState::Closing);

        let err = queue.enqueue(Bytes::from_static(b"{}\n")).await.unwrap_err();
        assert!(matches!(err, RelayError::Closing));
    }
}
