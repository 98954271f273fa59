use std::sync::Arc;

use lockstep_proto::{IterationId, LoadDataBlockRequest, Payload, TransmitRequest};
use lockstep_transport::{TcpTransport, Transport, TransportEvent};
use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::codec::PayloadCodec;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::metrics::BridgeMetricsSnapshot;
use crate::session::{DataBlockHandler, Session};
use crate::supervisor::{ConnectionSupervisor, FatalHook, ProcessExit};

/// One side of a paired session.
///
/// Callers open an iteration with [`Bridge::start`], exchange named values
/// with [`Bridge::send`] / [`Bridge::receive`], and close it with
/// [`Bridge::commit`]. Outbound messages are queued and transmitted in order
/// by a background task started from [`Bridge::connect`].
pub struct Bridge {
    config: BridgeConfig,
    session: Arc<Session>,
    transport: Arc<dyn Transport>,
    fatal_hook: Arc<dyn FatalHook>,
    events: Mutex<Option<broadcast::Receiver<TransportEvent>>>,
    sender: Mutex<Option<JoinHandle<()>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Bridge {
    pub fn new(config: BridgeConfig, transport: Arc<dyn Transport>) -> Self {
        Self::with_fatal_hook(config, transport, Arc::new(ProcessExit::default()))
    }

    pub fn with_fatal_hook(
        config: BridgeConfig,
        transport: Arc<dyn Transport>,
        fatal_hook: Arc<dyn FatalHook>,
    ) -> Self {
        let session = Arc::new(Session::new(
            config.stream_queue_size,
            config.alert_interval(),
        ));
        transport.serve(session.clone());
        // Subscribe now so no lifecycle event slips by before `connect`.
        let events = transport.subscribe();
        Self {
            config,
            session,
            transport,
            fatal_hook,
            events: Mutex::new(Some(events)),
            sender: Mutex::new(None),
            supervisor: Mutex::new(None),
        }
    }

    /// Bridge over TCP using the config's endpoints and session token.
    pub fn tcp(config: BridgeConfig) -> Self {
        let transport = TcpTransport::tcp(
            config.listen_addr.clone(),
            config.remote_addr.clone(),
            config.token(),
        );
        Self::new(config, Arc::new(transport))
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn role(&self) -> &str {
        &self.config.role
    }

    pub fn current_iter_id(&self) -> Option<IterationId> {
        self.session.state.lock().current_iter_id
    }

    pub fn next_iter_id(&self) -> IterationId {
        self.session.state.lock().next_iter_id
    }

    /// Id the next `start` should use. Does not allocate.
    pub fn new_iter_id(&self) -> IterationId {
        self.next_iter_id()
    }

    pub fn connected_at(&self) -> Option<OffsetDateTime> {
        self.transport.connected_at()
    }

    pub fn terminated_at(&self) -> Option<OffsetDateTime> {
        self.transport.closed_at()
    }

    pub fn metrics(&self) -> BridgeMetricsSnapshot {
        self.session.metrics.snapshot()
    }

    /// Start the transport and the background sender. Idempotent.
    pub async fn connect(&self) -> BridgeResult<()> {
        if !self.session.mark_started() {
            return Ok(());
        }
        if let Some(events) = self.events.lock().take() {
            let supervisor =
                ConnectionSupervisor::new(Arc::clone(&self.session), Arc::clone(&self.fatal_hook));
            *self.supervisor.lock() = Some(supervisor.spawn(events));
        }
        if let Err(err) = self.transport.connect().await {
            self.session.clear_started();
            warn!(target = "bridge", error = %err, "connect failed");
            return Err(err.into());
        }

        let transport = Arc::clone(&self.transport);
        let requests = Arc::clone(&self.session).outbound_stream();
        let handle = tokio::spawn(async move {
            match transport.stream_transmit(requests).await {
                Ok(acked) => debug!(target = "bridge", acked, "transmit stream finished"),
                Err(err) => warn!(target = "bridge", error = %err, "transmit stream ended with error"),
            }
        });
        *self.sender.lock() = Some(handle);
        info!(
            target = "bridge",
            role = %self.config.role,
            token = %self.config.token(),
            "bridge connected"
        );
        Ok(())
    }

    /// Stop accepting messages, flush the queue to the peer, then close the
    /// transport. Idempotent, and a no-op before a successful `connect`.
    pub async fn terminate(&self) -> BridgeResult<()> {
        if !self.session.is_started() {
            debug!(target = "bridge", "terminate before connect ignored");
            return Ok(());
        }
        if !self.session.mark_terminated() {
            return Ok(());
        }
        let sender = self.sender.lock().take();
        if let Some(handle) = sender {
            if let Err(err) = handle.await {
                warn!(target = "bridge", error = %err, "transmit task failed");
            }
        }
        self.transport.close().await?;
        let supervisor = self.supervisor.lock().take();
        if let Some(handle) = supervisor {
            handle.abort();
        }
        info!(target = "bridge", role = %self.config.role, "bridge terminated");
        Ok(())
    }

    pub async fn start(&self, iter_id: IterationId) -> BridgeResult<()> {
        self.session.start(iter_id).await
    }

    pub async fn commit(&self) -> BridgeResult<()> {
        self.session.commit().await.map(|_| ())
    }

    /// Queue a named value for `iter_id`. Does not check that the iteration is
    /// open. Values the transport cannot carry are rejected before queueing.
    pub async fn send(
        &self,
        iter_id: IterationId,
        name: impl Into<String>,
        payload: Payload,
    ) -> BridgeResult<()> {
        let request = TransmitRequest::data(iter_id, name, payload);
        if let Err(err) = self.transport.check_transmit(&request) {
            error!(target = "bridge", iter_id, error = %err, "refusing to queue data");
            return Err(err.into());
        }
        self.session.enqueue(request).await
    }

    pub async fn send_with<C: PayloadCodec>(
        &self,
        codec: &C,
        iter_id: IterationId,
        name: impl Into<String>,
        value: &C::Value,
    ) -> BridgeResult<()> {
        let payload = codec.encode(value)?;
        self.send(iter_id, name, payload).await
    }

    /// Send under the currently open iteration.
    pub async fn send_current(&self, name: impl Into<String>, payload: Payload) -> BridgeResult<()> {
        let iter_id = self.current_iter_id().ok_or(BridgeError::NotStarted)?;
        self.send(iter_id, name, payload).await
    }

    /// Wait until the peer sends `name` for `iter_id`.
    ///
    /// Fails once the peer commits `iter_id` without sending it, or closes the
    /// session. There is no timeout.
    pub async fn receive(&self, iter_id: IterationId, name: &str) -> BridgeResult<Payload> {
        self.session.receive(iter_id, name).await
    }

    pub async fn receive_with<C: PayloadCodec>(
        &self,
        codec: &C,
        iter_id: IterationId,
        name: &str,
    ) -> BridgeResult<C::Value> {
        let payload = self.receive(iter_id, name).await?;
        Ok(codec.decode(payload)?)
    }

    pub async fn receive_current(&self, name: &str) -> BridgeResult<Payload> {
        let iter_id = self.current_iter_id().ok_or(BridgeError::NotStarted)?;
        self.receive(iter_id, name).await
    }

    /// Install the callback answering the peer's data block requests. Only one
    /// handler may ever be registered.
    pub fn register_data_block_handler<F>(&self, handler: F) -> BridgeResult<()>
    where
        F: Fn(&LoadDataBlockRequest) -> bool + Send + Sync + 'static,
    {
        let handler: DataBlockHandler = Arc::new(handler);
        self.session
            .data_block_handler
            .set(handler)
            .map_err(|_| BridgeError::HandlerAlreadyRegistered)
    }

    /// Ask the peer to load a data block; true when it reports success.
    pub async fn load_data_block(&self, count: u64, block_id: impl Into<String>) -> BridgeResult<bool> {
        let request = LoadDataBlockRequest {
            count,
            block_id: block_id.into(),
        };
        debug!(target = "bridge.data_block", block_id = %request.block_id, "sending data block request");
        let block_id = request.block_id.clone();
        let response = self.transport.load_data_block(request).await?;
        if response.is_success() {
            info!(target = "bridge.data_block", block_id = %block_id, "remote succeeded to load data block");
        } else {
            info!(
                target = "bridge.data_block",
                block_id = %block_id,
                status = ?response.status,
                "remote failed to load data block"
            );
        }
        Ok(response.is_success())
    }
}
