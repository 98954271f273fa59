use lockstep_proto::IterationId;
use lockstep_transport::TransportError;
use thiserror::Error;

use crate::codec::CodecError;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("transmit stream was terminated")]
    Terminated,
    #[error("last iteration {current} not finished, cannot start {requested}")]
    IterationNotFinished {
        current: IterationId,
        requested: IterationId,
    },
    #[error("no iteration started")]
    NotStarted,
    #[error("peer committed without sending {name} for iter_id {iter_id}, check model code")]
    PeerCommittedWithoutData { iter_id: IterationId, name: String },
    #[error("peer terminated without sending {name} for iter_id {iter_id}")]
    PeerTerminated { iter_id: IterationId, name: String },
    #[error("transport failed, the session cannot continue")]
    LinkFailed,
    #[error("data block handler already registered")]
    HandlerAlreadyRegistered,
    #[error("invalid configuration {key}={value}")]
    InvalidConfig { key: &'static str, value: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

pub type BridgeResult<T> = Result<T, BridgeError>;
