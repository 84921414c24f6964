use crate::backend::Backend;
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::health;
use crate::queue::{WriteQueue, WriteWorker};
use crate::registry::{ClientHandle, ClientId, ClientRegistry, DeliveryError};
use crate::router::{Dispatch, Router};
use crate::sessions::{SessionId, SessionPool};
use crate::state::{Lifecycle, RelayState};
use crate::status::{ClientStatus, RelayStatus};
use crate::supervisor::{BackendEvent, BackendSupervisor};
use crate::{RecoveryReason, CHANNEL_BUFFER_SIZE};
use bytes::Bytes;
use futures::future::join_all;
use natrelay_proto::envelope::{closed_resource, session_event, session_id, SessionEvent};
use natrelay_proto::{FrameAssembler, Keypair, ProtocolFrame, PublicKey};
use natrelay_transport::{Connection, Listener, PeerStream, Transport};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

const READ_BUFFER_SIZE: usize = 64 * 1024;
const ACCEPT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Where a started relay can be reached.
#[derive(Debug, Clone)]
pub struct StartInfo {
    pub public_key: PublicKey,
    pub local_addr: Option<SocketAddr>,
}

/// Where the last backend frame went, so whitespace finishing it can follow.
#[derive(Debug, Clone)]
enum Delivered {
    Client(ClientId),
    Everyone,
    Nowhere,
}

/// Pieces that only exist until the relay is started.
struct Startup {
    events: mpsc::Receiver<BackendEvent>,
    worker: WriteWorker,
    recovery: mpsc::UnboundedReceiver<RecoveryReason>,
}

/// Cheaply cloneable handle to a running relay.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<RelayInner>,
}

pub(crate) struct RelayInner {
    pub(crate) config: RelayConfig,
    transport: Arc<dyn Transport>,
    pub(crate) lifecycle: Arc<Lifecycle>,
    pub(crate) supervisor: Arc<BackendSupervisor>,
    queue: WriteQueue,
    router: Router,
    registry: ClientRegistry,
    sessions: SessionPool,
    recovery_tx: mpsc::UnboundedSender<RecoveryReason>,
    pub(crate) recovery_attempts: AtomicU32,
    public_key: Mutex<Option<PublicKey>>,
    startup: Mutex<Option<Startup>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Relay {
    pub fn new(
        config: RelayConfig,
        transport: Arc<dyn Transport>,
        backend: Arc<dyn Backend>,
    ) -> Self {
        let lifecycle = Arc::new(Lifecycle::new());
        let (supervisor, events) = BackendSupervisor::new(backend);
        let supervisor = Arc::new(supervisor);
        let (recovery_tx, recovery) = mpsc::unbounded_channel();
        let (queue, worker) = WriteQueue::new(
            supervisor.clone(),
            lifecycle.clone(),
            config.write_timeout,
            recovery_tx.clone(),
        );
        let inner = RelayInner {
            config,
            transport,
            lifecycle,
            supervisor,
            queue,
            router: Router::new(),
            registry: ClientRegistry::new(),
            sessions: SessionPool::new(),
            recovery_tx,
            recovery_attempts: AtomicU32::new(0),
            public_key: Mutex::new(None),
            startup: Mutex::new(Some(Startup {
                events,
                worker,
                recovery,
            })),
            accept_task: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Launches the backend and starts accepting peers under the key derived
    /// from `seed`, or from `token` when no seed is given.
    ///
    /// A relay can be started once. On failure everything that was brought
    /// up is torn down again and the relay ends up `Closed`.
    pub async fn start(&self, token: &str, seed: Option<&str>) -> Result<StartInfo, RelayError> {
        let inner = &self.inner;
        if !inner
            .lifecycle
            .advance_from(RelayState::Pending, RelayState::Opening)
        {
            return Err(RelayError::AlreadyStarted);
        }
        log::info!("relay starting");
        match inner.open(token, seed).await {
            Ok(info) => Ok(info),
            Err(e) => {
                log::error!("relay failed to start: {}", e);
                inner.lifecycle.begin_shutdown();
                inner.teardown().await;
                inner.lifecycle.advance(RelayState::Closed);
                Err(e)
            }
        }
    }

    /// Stops accepting, drops every client and stops the backend. Safe to
    /// call any number of times; every caller returns once the relay is
    /// closed.
    pub async fn shutdown(&self) {
        self.inner.shutdown().await
    }

    pub async fn wait_closed(&self) {
        self.inner.lifecycle.reached(RelayState::Closed).await
    }

    pub fn state(&self) -> RelayState {
        self.inner.lifecycle.state()
    }

    pub fn is_recovering(&self) -> bool {
        self.inner.lifecycle.is_recovering()
    }

    pub fn public_key(&self) -> Option<PublicKey> {
        *self.inner.public_key.lock()
    }

    pub fn client_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Connected clients, oldest first.
    pub fn client_ids(&self) -> Vec<ClientId> {
        self.inner
            .registry
            .snapshot()
            .iter()
            .map(|c| c.id.clone())
            .collect()
    }

    /// Backend resources currently owned by `client`.
    pub fn resources_of(&self, client: &str) -> Vec<String> {
        self.inner.router.resources_of(client)
    }

    pub fn session_of(&self, client: &str) -> Option<SessionId> {
        self.inner.sessions.session_of(client)
    }

    pub fn outstanding_requests(&self) -> usize {
        self.inner.router.outstanding()
    }

    pub fn backend_generation(&self) -> u64 {
        self.inner.supervisor.generation()
    }

    pub fn status(&self) -> RelayStatus {
        let inner = &self.inner;
        let clients = inner
            .registry
            .snapshot()
            .into_iter()
            .map(|c| ClientStatus {
                id: c.id.clone(),
                remote: c.remote.clone(),
                connected_at: c.connected_at,
                idle_ms: c.idle().as_millis() as u64,
                pending: c.pending_count(),
                resources: c.owned(),
                session: inner.sessions.session_of(&c.id),
            })
            .collect();
        RelayStatus {
            state: inner.lifecycle.state(),
            recovering: inner.lifecycle.is_recovering(),
            public_key: *inner.public_key.lock(),
            backend_generation: inner.supervisor.generation(),
            recovery_attempts: inner.recovery_attempts.load(Ordering::Acquire),
            sessions_available: inner.sessions.available_count(),
            outstanding_requests: inner.router.outstanding(),
            clients,
        }
    }
}

impl RelayInner {
    async fn open(self: &Arc<Self>, token: &str, seed: Option<&str>) -> Result<StartInfo, RelayError> {
        let material = seed.filter(|s| !s.is_empty()).unwrap_or(token);
        let keypair = Keypair::from_seed(material.as_bytes());
        let public_key = keypair.public_key();

        let Startup {
            events,
            worker,
            recovery,
        } = self.startup.lock().take().ok_or(RelayError::AlreadyStarted)?;
        self.track(tokio::spawn(worker.run()));
        self.track(tokio::spawn(pump_backend_output(self.clone(), events)));

        self.supervisor.start(token).await?;
        let listener = self.transport.listen(&keypair).await?;
        let local_addr = listener.local_addr();
        *self.public_key.lock() = Some(public_key);

        if !self.lifecycle.advance_from(RelayState::Opening, RelayState::Opened) {
            let mut listener = listener;
            listener.close().await;
            return Err(RelayError::Closing);
        }
        self.recovery_attempts.store(0, Ordering::Release);

        *self.accept_task.lock() = Some(tokio::spawn(accept_peers(self.clone(), listener)));
        self.track(tokio::spawn(health::monitor(self.clone())));
        self.track(tokio::spawn(health::recover(self.clone(), recovery)));

        log::info!(
            "relay open: public key {} ({})",
            public_key,
            local_addr.map_or_else(|| "in-process".to_string(), |a| a.to_string())
        );
        Ok(StartInfo {
            public_key,
            local_addr,
        })
    }

    fn track(&self, task: JoinHandle<()>) {
        self.tasks.lock().push(task);
    }

    pub(crate) async fn shutdown(self: &Arc<Self>) {
        if !self.lifecycle.begin_shutdown() {
            self.lifecycle.reached(RelayState::Closed).await;
            return;
        }
        if self.lifecycle.state() == RelayState::Pending {
            self.lifecycle.advance(RelayState::Closed);
            return;
        }
        log::info!("relay shutting down");
        self.lifecycle.advance(RelayState::Closing);
        self.teardown().await;
        self.lifecycle.advance(RelayState::Closed);
        log::info!("relay closed");
    }

    /// Runs [`RelayInner::shutdown`] from a task the shutdown does not abort.
    pub(crate) fn spawn_shutdown(self: &Arc<Self>) {
        let inner = self.clone();
        tokio::spawn(async move { inner.shutdown().await });
    }

    async fn teardown(self: &Arc<Self>) {
        let accept = self.accept_task.lock().take();
        if let Some(mut task) = accept {
            if tokio::time::timeout(ACCEPT_DRAIN_TIMEOUT, &mut task)
                .await
                .is_err()
            {
                log::warn!("listener did not close in time");
                task.abort();
            }
        }

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in &tasks {
            task.abort();
        }
        join_all(tasks).await;

        for client in self.registry.snapshot() {
            self.cleanup(&client.id);
        }
        self.supervisor.stop(self.config.shutdown_grace).await;
    }

    pub(crate) fn trigger_recovery(&self, reason: RecoveryReason) {
        let _ = self.recovery_tx.send(reason);
    }

    /// Forgets everything tied to the previous backend.
    pub(crate) fn reset_routing(&self) {
        self.router.reset();
        for client in self.registry.snapshot() {
            client.take_pending();
            client.take_owned();
        }
        let lost = self.sessions.invalidate();
        if !lost.is_empty() {
            log::warn!("{} clients lost their backend session", lost.len());
        }
    }

    fn accepting(&self) -> bool {
        self.lifecycle.state() == RelayState::Opened && !self.lifecycle.is_shutting_down()
    }

    fn admit(self: &Arc<Self>, conn: Connection) {
        if !self.accepting() {
            log::info!(
                "turning away {}: relay is {}",
                conn.remote,
                self.lifecycle.state()
            );
            return;
        }
        let id: ClientId = Uuid::new_v4().simple().to_string();
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let client = Arc::new(ClientHandle::new(id.clone(), conn.remote.clone(), tx));
        self.registry.register(client.clone());
        if !self.accepting() {
            self.cleanup(&id);
            return;
        }
        let session = self.sessions.assign(&id);
        log::info!(
            "client {} connected from {} (session {:?}, {} connected)",
            id,
            conn.remote,
            session,
            self.registry.len()
        );
        tokio::spawn(serve_client(self.clone(), client, conn.stream, rx));
    }

    async fn forward(&self, client: &Arc<ClientHandle>, frame: ProtocolFrame) {
        if client.is_closed() {
            return;
        }
        if let Some(resource) = frame.json().and_then(closed_resource) {
            if self.router.disown(&resource, &client.id) {
                client.disown(&resource);
            }
        }
        let ids = self.router.record_request(&client.id, &frame);
        client.add_pending(&ids);
        if let Err(e) = self.queue.enqueue(frame.into_raw()).await {
            log::warn!("dropping frame from client {}: {}", client.id, e);
            self.router.forget(&client.id, &ids);
            client.complete_all(&ids);
        }
    }

    fn dispatch(&self, frame: ProtocolFrame) -> Delivered {
        if let Some(event) = frame.json().and_then(session_event) {
            self.apply_session_event(event);
        }
        match self.router.route_response(&frame) {
            Dispatch::Reply {
                client,
                id,
                created,
            } => match self.registry.get(&client).filter(|c| !c.is_closed()) {
                Some(handle) => {
                    handle.complete(&id);
                    if let Some(resource) = created {
                        self.router.claim(&resource, &client);
                        handle.own(resource.clone());
                        if handle.is_closed() && self.router.disown(&resource, &client) {
                            self.release(resource);
                        }
                    }
                    self.deliver(&handle, frame.into_raw());
                    Delivered::Client(client)
                }
                None => {
                    log::debug!("client {} left before response {} arrived", client, id);
                    if let Some(resource) = created {
                        self.release(resource);
                    }
                    Delivered::Nowhere
                }
            },
            Dispatch::Internal(id) => {
                log::debug!("backend acknowledged {}", id);
                Delivered::Nowhere
            }
            Dispatch::Orphan { id, created } => {
                log::debug!("dropping response {} for a disconnected client", id);
                if let Some(resource) = created {
                    log::info!("releasing {} created for a disconnected client", resource);
                    self.release(resource);
                }
                Delivered::Nowhere
            }
            Dispatch::Unroutable(id) => {
                log::warn!("no client is waiting for response {}; dropping it", id);
                Delivered::Nowhere
            }
            Dispatch::Unsolicited => {
                let owner = frame
                    .json()
                    .and_then(session_id)
                    .and_then(|s| self.sessions.owner_of(s))
                    .and_then(|c| self.registry.get(&c));
                match owner {
                    Some(client) => {
                        self.deliver(&client, frame.into_raw());
                        Delivered::Client(client.id.clone())
                    }
                    None => {
                        self.broadcast(frame.into_raw());
                        Delivered::Everyone
                    }
                }
            }
        }
    }

    /// Sends whitespace that finishes a frame to wherever the frame went.
    fn follow(&self, last: &Delivered, tail: Bytes) {
        match last {
            Delivered::Client(id) => {
                if let Some(client) = self.registry.get(id) {
                    self.deliver(&client, tail);
                }
            }
            Delivered::Everyone => self.broadcast(tail),
            Delivered::Nowhere => {}
        }
    }

    fn apply_session_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::Attached(session) => {
                if self.sessions.add_available(session) {
                    self.offer_sessions();
                }
            }
            SessionEvent::Detached(session) => {
                if let Some(owner) = self.sessions.remove(&session) {
                    log::info!("session {} of client {} detached", session, owner);
                    self.offer_sessions();
                }
            }
        }
    }

    /// Hands free sessions to clients that have none, oldest client first.
    fn offer_sessions(&self) {
        for client in self.registry.snapshot() {
            if client.is_closed() || self.sessions.session_of(&client.id).is_some() {
                continue;
            }
            if self.sessions.assign(&client.id).is_none() {
                break;
            }
        }
    }

    fn deliver(&self, client: &Arc<ClientHandle>, frame: Bytes) {
        match client.deliver(frame) {
            Ok(()) => {}
            Err(DeliveryError::Closed) => {
                log::debug!("client {} closed; dropping frame", client.id)
            }
            Err(DeliveryError::Backlogged) => {
                log::warn!("client {} is not reading; disconnecting it", client.id);
                client.disconnect();
            }
        }
    }

    fn broadcast(&self, frame: Bytes) {
        for client in self.registry.broadcast(&frame) {
            log::warn!("client {} is not reading; disconnecting it", client.id);
            client.disconnect();
        }
    }

    /// Asks the backend to close `resource`; the reply is swallowed.
    fn release(&self, resource: String) {
        let payload = self.router.release_request(&resource);
        let queue = self.queue.clone();
        tokio::spawn(async move {
            match queue.enqueue(payload).await {
                Ok(()) => log::debug!("released {}", resource),
                Err(e @ RelayError::Closing) => log::debug!("not releasing {}: {}", resource, e),
                Err(e) => log::warn!("could not release {}: {}", resource, e),
            }
        });
    }

    /// Unregisters `id` and gives back everything it held. Only the first
    /// call for a client does anything.
    fn cleanup(&self, id: &str) {
        let Some(client) = self.registry.unregister(id) else {
            return;
        };
        if !client.mark_closed() {
            return;
        }
        let pending = client.take_pending();
        let orphaned = pending.len();
        self.router.orphan(id, pending);

        let mut released = 0;
        for resource in client.take_owned() {
            if self.router.disown(&resource, id) {
                self.release(resource);
                released += 1;
            }
        }
        if let Some(session) = self.sessions.release(id) {
            log::debug!("session {} returned by client {}", session, id);
            self.offer_sessions();
        }
        client.disconnect();
        log::info!(
            "client {} disconnected after {:?} ({} requests orphaned, {} resources released)",
            id,
            client.started().elapsed(),
            orphaned,
            released
        );
        if self.registry.is_empty() {
            log::info!("no clients connected");
        }
    }
}

async fn accept_peers(inner: Arc<RelayInner>, mut listener: Box<dyn Listener>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Some(Ok(conn)) => inner.admit(conn),
                Some(Err(e)) => log::warn!("rejected incoming peer: {}", e),
                None => {
                    if !inner.lifecycle.is_shutting_down() {
                        log::error!("listener stopped unexpectedly; shutting down");
                        inner.spawn_shutdown();
                    }
                    break;
                }
            },
            _ = inner.lifecycle.reached(RelayState::Closing) => break,
        }
    }
    listener.close().await;
    log::debug!("listener closed");
}

async fn serve_client(
    inner: Arc<RelayInner>,
    client: Arc<ClientHandle>,
    stream: PeerStream,
    mut outbound: mpsc::Receiver<Bytes>,
) {
    let (mut reader, mut writer) = tokio::io::split(stream);

    let writer_client = client.clone();
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if writer.write_all(&frame).await.is_err() || writer.flush().await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
        writer_client.disconnect();
    });

    let mut assembler = FrameAssembler::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let reason = loop {
        tokio::select! {
            _ = client.disconnected() => break "closed by relay",
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    if let Some(frame) = assembler.flush() {
                        inner.forward(&client, frame).await;
                    }
                    break "peer closed the stream";
                }
                Ok(n) => {
                    client.touch();
                    assembler.push(&buf[..n]);
                    while let Some(frame) = assembler.next_frame() {
                        inner.forward(&client, frame).await;
                    }
                }
                Err(e) => {
                    log::debug!("client {} read error: {}", client.id, e);
                    break "read error";
                }
            },
        }
    };

    log::debug!("client {} connection ended: {}", client.id, reason);
    inner.cleanup(&client.id);
    writer_task.abort();
}

async fn pump_backend_output(inner: Arc<RelayInner>, mut events: mpsc::Receiver<BackendEvent>) {
    let mut assembler = FrameAssembler::new();
    let mut current = 0;
    let mut last = Delivered::Nowhere;
    while let Some(event) = events.recv().await {
        match event {
            BackendEvent::Output { generation, bytes } => {
                if generation < inner.supervisor.generation() {
                    log::trace!("dropping output of stale backend generation {}", generation);
                    continue;
                }
                if generation != current {
                    assembler = FrameAssembler::new();
                    current = generation;
                    last = Delivered::Nowhere;
                }
                assembler.push(&bytes);
                while let Some(frame) = assembler.next_frame() {
                    match frame {
                        ProtocolFrame::Continuation(tail) => inner.follow(&last, tail),
                        frame => last = inner.dispatch(frame),
                    }
                }
            }
            BackendEvent::Exited { generation } => {
                if generation != inner.supervisor.generation()
                    || inner.lifecycle.is_shutting_down()
                    || inner.lifecycle.is_recovering()
                {
                    continue;
                }
                log::error!("backend generation {} exited unexpectedly", generation);
                inner.trigger_recovery(RecoveryReason::BackendExited);
            }
        }
    }
}
