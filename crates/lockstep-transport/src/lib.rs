//! Paired channel between the two sides of a lockstep session.
//!
//! Each side dials its peer (outbound lane, carrying the transmit stream and
//! data block requests) and accepts the peer's dial (inbound lane, answered by
//! the registered [`InboundService`]). Lifecycle changes are published on a
//! broadcast channel so supervisors can react to them.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use lockstep_proto::{LoadDataBlockRequest, LoadDataBlockResponse, TransmitRequest, TransmitResponse};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::broadcast;

pub mod frame;
pub mod link;
pub mod memory;
pub mod tcp;

pub use frame::Frame;
pub use link::{Connector, FramedTransport};
pub use memory::{MemoryConnector, MemoryTransport};
pub use tcp::{RetryPolicy, TcpConnector, TcpTransport};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport io error: {0}")]
    Io(String),
    #[error("frame codec error: {0}")]
    Codec(String),
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
    #[error("session token mismatch")]
    TokenMismatch,
    #[error("transport not connected")]
    NotConnected,
    #[error("transport closed")]
    Closed,
    #[error("transmit stream already open")]
    StreamBusy,
    #[error("connection lost: {0}")]
    ConnectionLost(String),
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Lifecycle notifications published by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    /// The peer said goodbye. Published at most once.
    PeerClosed,
    /// The link failed without a goodbye. Published at most once.
    Error(TransportError),
}

/// Handlers for calls the peer issues against this side.
///
/// `transmit` runs inline on the inbound lane, one request at a time in
/// delivery order. `load_data_block` runs on a blocking worker.
pub trait InboundService: Send + Sync + 'static {
    fn transmit(&self, request: TransmitRequest) -> TransmitResponse;
    fn load_data_block(&self, request: LoadDataBlockRequest) -> LoadDataBlockResponse;
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Register the handler for inbound calls. Must happen before `connect`.
    fn serve(&self, service: Arc<dyn InboundService>);

    async fn connect(&self) -> TransportResult<()>;

    async fn close(&self) -> TransportResult<()>;

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    /// Reject a request this transport could never deliver, before it is
    /// queued behind others.
    fn check_transmit(&self, _request: &TransmitRequest) -> TransportResult<()> {
        Ok(())
    }

    /// Transmit every request yielded by `requests`, in order, and wait until
    /// the peer acknowledged all of them. Returns the number acknowledged.
    async fn stream_transmit(
        &self,
        requests: BoxStream<'static, TransmitRequest>,
    ) -> TransportResult<u64>;

    async fn load_data_block(
        &self,
        request: LoadDataBlockRequest,
    ) -> TransportResult<LoadDataBlockResponse>;

    fn connected_at(&self) -> Option<OffsetDateTime>;

    fn closed_at(&self) -> Option<OffsetDateTime>;
}
