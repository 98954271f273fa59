use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use lockstep_proto::{LoadDataBlockRequest, LoadDataBlockResponse, TransmitRequest, TransmitResponse};
use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::frame::{self, read_frame, write_frame, Frame};
use crate::{InboundService, Transport, TransportError, TransportEvent, TransportResult};

const EVENT_CAPACITY: usize = 16;
const CLOSE_GRACE: Duration = Duration::from_secs(2);
const WRITE_FAILURE_GRACE: Duration = Duration::from_millis(200);

/// Produces the two raw streams a [`FramedTransport`] runs over.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Open the outbound lane to the peer.
    async fn dial(&self) -> io::Result<Self::Stream>;

    /// Wait for the peer to open our inbound lane.
    async fn accept(&self) -> io::Result<Self::Stream>;

    fn describe(&self) -> String;
}

#[derive(Debug, Clone, Copy)]
enum Lane {
    Outbound,
    Inbound,
}

impl Lane {
    fn as_str(self) -> &'static str {
        match self {
            Lane::Outbound => "outbound",
            Lane::Inbound => "inbound",
        }
    }
}

/// Transport over any pair of byte streams, speaking length-prefixed frames.
pub struct FramedTransport<C: Connector> {
    connector: C,
    token: String,
    inner: Arc<LinkInner>,
}

struct LinkInner {
    events: broadcast::Sender<TransportEvent>,
    service: OnceLock<Arc<dyn InboundService>>,
    outbound_tx: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    acks: Mutex<Option<mpsc::UnboundedReceiver<TransmitResponse>>>,
    pending_blocks: Mutex<HashMap<u64, oneshot::Sender<LoadDataBlockResponse>>>,
    next_request_id: AtomicU64,
    writers: Mutex<Vec<JoinHandle<()>>>,
    readers: Mutex<Vec<JoinHandle<()>>>,
    connected_at: Mutex<Option<OffsetDateTime>>,
    closed_at: Mutex<Option<OffsetDateTime>>,
    closing: AtomicBool,
    peer_closed: AtomicBool,
    failed: AtomicBool,
}

impl LinkInner {
    fn new() -> Self {
        Self {
            events: broadcast::channel(EVENT_CAPACITY).0,
            service: OnceLock::new(),
            outbound_tx: Mutex::new(None),
            inbound_tx: Mutex::new(None),
            acks: Mutex::new(None),
            pending_blocks: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
            writers: Mutex::new(Vec::new()),
            readers: Mutex::new(Vec::new()),
            connected_at: Mutex::new(None),
            closed_at: Mutex::new(None),
            closing: AtomicBool::new(false),
            peer_closed: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        }
    }

    fn quiet(&self) -> bool {
        self.closing.load(Ordering::SeqCst) || self.peer_closed.load(Ordering::SeqCst)
    }

    fn publish(&self, event: TransportEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn peer_goodbye(&self, lane: Lane) {
        if self.peer_closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.closing.load(Ordering::SeqCst) {
            debug!(target = "transport.link", lane = lane.as_str(), "peer goodbye during local close");
            return;
        }
        info!(target = "transport.link", lane = lane.as_str(), "peer closed the session");
        self.publish(TransportEvent::PeerClosed);
    }

    fn report_eof(&self, lane: Lane) {
        if self.quiet() {
            debug!(target = "transport.link", lane = lane.as_str(), "lane reached eof");
            return;
        }
        self.report_failure(
            lane,
            TransportError::ConnectionLost(format!(
                "peer dropped the {} lane without goodbye",
                lane.as_str()
            )),
        );
    }

    fn report_failure(&self, lane: Lane, err: TransportError) {
        if self.quiet() {
            debug!(target = "transport.link", lane = lane.as_str(), error = %err, "lane error after close");
            return;
        }
        if self.failed.swap(true, Ordering::SeqCst) {
            return;
        }
        error!(target = "transport.link", lane = lane.as_str(), error = %err, "transport failed");
        self.publish(TransportEvent::Error(err));
    }

    /// A lane that cannot be written is dead. Io errors wait briefly so a
    /// goodbye already sitting on the matching reader is seen first.
    async fn write_failed(&self, lane: Lane, err: TransportError) {
        if matches!(err, TransportError::Io(_)) {
            tokio::time::sleep(WRITE_FAILURE_GRACE).await;
        }
        if self.quiet() {
            debug!(target = "transport.link", lane = lane.as_str(), error = %err, "write failed after close");
            return;
        }
        self.report_failure(lane, err);
        // Dropping the read halves lets the peer observe eof.
        self.abort_readers();
    }

    fn abort_readers(&self) {
        for handle in std::mem::take(&mut *self.readers.lock()) {
            handle.abort();
        }
    }
}

impl<C: Connector> FramedTransport<C> {
    pub fn new(connector: C, token: impl Into<String>) -> Self {
        Self {
            connector,
            token: token.into(),
            inner: Arc::new(LinkInner::new()),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Drop both lanes without saying goodbye, as a crashed process would.
    pub fn sever(&self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        self.inner.outbound_tx.lock().take();
        self.inner.inbound_tx.lock().take();
        for handle in std::mem::take(&mut *self.inner.writers.lock()) {
            handle.abort();
        }
        self.inner.abort_readers();
        warn!(target = "transport.link", peer = %self.connector.describe(), "link severed");
    }

    async fn dial_peer(&self) -> TransportResult<C::Stream> {
        let mut stream = self.connector.dial().await?;
        write_frame(
            &mut stream,
            &Frame::Hello {
                token: self.token.clone(),
            },
        )
        .await?;
        Ok(stream)
    }

    async fn accept_peer(&self) -> TransportResult<C::Stream> {
        loop {
            let mut stream = self.connector.accept().await?;
            match read_frame(&mut stream).await {
                Ok(Some(Frame::Hello { token })) if token == self.token => return Ok(stream),
                Ok(Some(Frame::Hello { token })) => {
                    warn!(
                        target = "transport.link",
                        expected = %self.token,
                        received = %token,
                        "rejecting dial with mismatched token"
                    );
                }
                Ok(Some(other)) => {
                    warn!(target = "transport.link", kind = other.kind(), "rejecting dial without hello");
                }
                Ok(None) => {
                    debug!(target = "transport.link", "dial closed before hello");
                }
                Err(err) => {
                    warn!(target = "transport.link", error = %err, "failed to read hello");
                }
            }
        }
    }
}

async fn write_loop<W>(
    inner: Arc<LinkInner>,
    mut writer: W,
    mut frames: mpsc::UnboundedReceiver<Frame>,
    lane: Lane,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = frames.recv().await {
        let goodbye = matches!(frame, Frame::Goodbye);
        if let Err(err) = write_frame(&mut writer, &frame).await {
            inner.write_failed(lane, err).await;
            return;
        }
        if goodbye {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn outbound_read_loop<R>(
    inner: Arc<LinkInner>,
    mut reader: R,
    acks: mpsc::UnboundedSender<TransmitResponse>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(Frame::TransmitAck(ack))) => {
                let _ = acks.send(ack);
            }
            Ok(Some(Frame::LoadDataBlockReply {
                request_id,
                response,
            })) => match inner.pending_blocks.lock().remove(&request_id) {
                Some(waiter) => {
                    let _ = waiter.send(response);
                }
                None => {
                    warn!(target = "transport.link", request_id, "reply for unknown data block request");
                }
            },
            Ok(Some(Frame::Goodbye)) => {
                inner.peer_goodbye(Lane::Outbound);
                break;
            }
            Ok(Some(other)) => {
                warn!(target = "transport.link", kind = other.kind(), "unexpected frame on outbound lane");
            }
            Ok(None) => {
                inner.report_eof(Lane::Outbound);
                break;
            }
            Err(err) => {
                inner.report_failure(Lane::Outbound, err);
                break;
            }
        }
    }
    // Waiters observe a dropped reply channel.
    inner.pending_blocks.lock().clear();
}

async fn inbound_read_loop<R>(
    inner: Arc<LinkInner>,
    mut reader: R,
    replies: mpsc::UnboundedSender<Frame>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(Frame::Transmit(request))) => {
                let response = match inner.service.get() {
                    Some(service) => service.transmit(request),
                    None => {
                        warn!(target = "transport.link", kind = request.kind(), "no service registered, acking blindly");
                        TransmitResponse::success()
                    }
                };
                if replies.send(Frame::TransmitAck(response)).is_err() {
                    break;
                }
            }
            Ok(Some(Frame::LoadDataBlock {
                request_id,
                request,
            })) => {
                let service = inner.service.get().cloned();
                let replies = replies.clone();
                tokio::spawn(async move {
                    let response = match service {
                        Some(service) => tokio::task::spawn_blocking(move || {
                            service.load_data_block(request)
                        })
                        .await
                        .unwrap_or_else(|err| {
                            error!(target = "transport.link", error = %err, "data block handler panicked");
                            LoadDataBlockResponse::from_outcome(false)
                        }),
                        None => LoadDataBlockResponse::from_outcome(false),
                    };
                    let _ = replies.send(Frame::LoadDataBlockReply {
                        request_id,
                        response,
                    });
                });
            }
            Ok(Some(Frame::Goodbye)) => {
                inner.peer_goodbye(Lane::Inbound);
                break;
            }
            Ok(Some(other)) => {
                warn!(target = "transport.link", kind = other.kind(), "unexpected frame on inbound lane");
            }
            Ok(None) => {
                inner.report_eof(Lane::Inbound);
                break;
            }
            Err(err) => {
                inner.report_failure(Lane::Inbound, err);
                break;
            }
        }
    }
}

fn spawn_lane<S>(
    inner: &Arc<LinkInner>,
    stream: S,
    lane: Lane,
) -> (mpsc::UnboundedSender<Frame>, ReadHalf<S>, JoinHandle<()>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer): (ReadHalf<S>, WriteHalf<S>) = tokio::io::split(stream);
    let (tx, rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_loop(Arc::clone(inner), writer, rx, lane));
    (tx, reader, writer)
}

#[async_trait]
impl<C: Connector> Transport for FramedTransport<C> {
    fn serve(&self, service: Arc<dyn InboundService>) {
        if self.inner.service.set(service).is_err() {
            warn!(target = "transport.link", "inbound service already registered");
        }
    }

    async fn connect(&self) -> TransportResult<()> {
        if self.inner.connected_at.lock().is_some() {
            return Ok(());
        }
        let (outbound, inbound) = tokio::try_join!(self.dial_peer(), self.accept_peer())?;

        let (outbound_tx, outbound_reader, outbound_writer) =
            spawn_lane(&self.inner, outbound, Lane::Outbound);
        let (inbound_tx, inbound_reader, inbound_writer) =
            spawn_lane(&self.inner, inbound, Lane::Inbound);
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();

        let readers = vec![
            tokio::spawn(outbound_read_loop(
                Arc::clone(&self.inner),
                outbound_reader,
                ack_tx,
            )),
            tokio::spawn(inbound_read_loop(
                Arc::clone(&self.inner),
                inbound_reader,
                inbound_tx.clone(),
            )),
        ];

        *self.inner.outbound_tx.lock() = Some(outbound_tx);
        *self.inner.inbound_tx.lock() = Some(inbound_tx);
        *self.inner.acks.lock() = Some(ack_rx);
        self.inner
            .writers
            .lock()
            .extend([outbound_writer, inbound_writer]);
        self.inner.readers.lock().extend(readers);
        *self.inner.connected_at.lock() = Some(OffsetDateTime::now_utc());

        info!(target = "transport.link", peer = %self.connector.describe(), "transport connected");
        self.inner.publish(TransportEvent::Connected);
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for lane in [&self.inner.outbound_tx, &self.inner.inbound_tx] {
            if let Some(tx) = lane.lock().take() {
                let _ = tx.send(Frame::Goodbye);
            }
        }
        let writers = std::mem::take(&mut *self.inner.writers.lock());
        for handle in writers {
            if tokio::time::timeout(CLOSE_GRACE, handle).await.is_err() {
                warn!(target = "transport.link", "writer did not flush goodbye in time");
            }
        }
        self.inner.abort_readers();
        *self.inner.closed_at.lock() = Some(OffsetDateTime::now_utc());
        info!(target = "transport.link", peer = %self.connector.describe(), "transport closed");
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }

    fn check_transmit(&self, request: &TransmitRequest) -> TransportResult<()> {
        frame::checked_len(&Frame::Transmit(request.clone())).map(|_| ())
    }

    async fn stream_transmit(
        &self,
        mut requests: BoxStream<'static, TransmitRequest>,
    ) -> TransportResult<u64> {
        let sender = self
            .inner
            .outbound_tx
            .lock()
            .clone()
            .ok_or(TransportError::NotConnected)?;
        let mut acks = self
            .inner
            .acks
            .lock()
            .take()
            .ok_or(TransportError::StreamBusy)?;

        let mut sent = 0u64;
        let mut acked = 0u64;
        while let Some(request) = requests.next().await {
            debug!(
                target = "transport.link",
                kind = request.kind(),
                iter_id = request.iter_id(),
                "transmitting"
            );
            sender
                .send(Frame::Transmit(request))
                .map_err(|_| TransportError::Closed)?;
            sent += 1;
            while acks.try_recv().is_ok() {
                acked += 1;
            }
        }
        while acked < sent {
            match acks.recv().await {
                Some(_) => acked += 1,
                None => {
                    return Err(TransportError::ConnectionLost(format!(
                        "{} of {} transmits unacknowledged",
                        sent - acked,
                        sent
                    )))
                }
            }
        }
        debug!(target = "transport.link", acked, "transmit stream finished");
        Ok(acked)
    }

    async fn load_data_block(
        &self,
        request: LoadDataBlockRequest,
    ) -> TransportResult<LoadDataBlockResponse> {
        let sender = self
            .inner
            .outbound_tx
            .lock()
            .clone()
            .ok_or(TransportError::NotConnected)?;
        let request_id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending_blocks.lock().insert(request_id, tx);
        if sender
            .send(Frame::LoadDataBlock {
                request_id,
                request,
            })
            .is_err()
        {
            self.inner.pending_blocks.lock().remove(&request_id);
            return Err(TransportError::Closed);
        }
        rx.await.map_err(|_| {
            TransportError::ConnectionLost("data block reply never arrived".to_string())
        })
    }

    fn connected_at(&self) -> Option<OffsetDateTime> {
        *self.inner.connected_at.lock()
    }

    fn closed_at(&self) -> Option<OffsetDateTime> {
        *self.inner.closed_at.lock()
    }
}
