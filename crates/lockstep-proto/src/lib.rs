//! Wire definitions exchanged by the two sides of a lockstep session.
//! Kept in a dedicated crate so the transport and the bridge agree on the
//! message shapes without depending on each other.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// One synchronized step. Each side numbers its own iterations.
pub type IterationId = u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartMessage {
    pub iter_id: IterationId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataMessage {
    pub iter_id: IterationId,
    pub name: String,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitMessage {
    pub iter_id: IterationId,
}

/// A single message on the transmit stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransmitRequest {
    Start(StartMessage),
    Data(DataMessage),
    Commit(CommitMessage),
}

impl TransmitRequest {
    pub fn start(iter_id: IterationId) -> Self {
        TransmitRequest::Start(StartMessage { iter_id })
    }

    pub fn data(iter_id: IterationId, name: impl Into<String>, payload: Payload) -> Self {
        TransmitRequest::Data(DataMessage {
            iter_id,
            name: name.into(),
            payload,
        })
    }

    pub fn commit(iter_id: IterationId) -> Self {
        TransmitRequest::Commit(CommitMessage { iter_id })
    }

    pub fn iter_id(&self) -> IterationId {
        match self {
            TransmitRequest::Start(msg) => msg.iter_id,
            TransmitRequest::Data(msg) => msg.iter_id,
            TransmitRequest::Commit(msg) => msg.iter_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TransmitRequest::Start(_) => "start",
            TransmitRequest::Data(_) => "data",
            TransmitRequest::Commit(_) => "commit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Success,
    InvalidDataBlock,
}

/// Per-message acknowledgement. Signals liveness only; protocol progress is
/// never encoded here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransmitResponse {
    pub status: StatusCode,
}

impl TransmitResponse {
    pub fn success() -> Self {
        Self {
            status: StatusCode::Success,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadDataBlockRequest {
    pub count: u64,
    pub block_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadDataBlockResponse {
    pub status: StatusCode,
}

impl LoadDataBlockResponse {
    pub fn from_outcome(loaded: bool) -> Self {
        let status = if loaded {
            StatusCode::Success
        } else {
            StatusCode::InvalidDataBlock
        };
        Self { status }
    }

    pub fn is_success(&self) -> bool {
        self.status == StatusCode::Success
    }
}

/// Element type of a [`TensorProto`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    F32,
    F64,
    I32,
    I64,
    U8,
}

impl DataType {
    pub fn size_of(self) -> usize {
        match self {
            DataType::F32 | DataType::I32 => 4,
            DataType::F64 | DataType::I64 => 8,
            DataType::U8 => 1,
        }
    }
}

/// Dense numeric array, little-endian element bytes in row-major order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorProto {
    pub dtype: DataType,
    pub shape: Vec<u64>,
    pub content: Bytes,
}

/// Arbitrary serialized message tagged with its type url.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnyMessage {
    pub type_url: String,
    pub value: Bytes,
}

/// Opaque value carried by a [`DataMessage`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    Tensor(TensorProto),
    Any(AnyMessage),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Tensor(_) => "tensor",
            Payload::Any(_) => "any",
        }
    }

    /// Size of the carried bytes, for logging.
    pub fn byte_len(&self) -> usize {
        match self {
            Payload::Tensor(tensor) => tensor.content.len(),
            Payload::Any(any) => any.value.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_helpers_report_iteration_and_kind() {
        let payload = Payload::Any(AnyMessage {
            type_url: "demo/Loss".into(),
            value: Bytes::from_static(b"\x01\x02"),
        });
        let data = TransmitRequest::data(5, "loss", payload);
        assert_eq!(data.iter_id(), 5);
        assert_eq!(data.kind(), "data");
        assert_eq!(TransmitRequest::start(3).kind(), "start");
        assert_eq!(TransmitRequest::commit(9).iter_id(), 9);
    }

    #[test]
    fn data_message_survives_bincode() {
        let request = TransmitRequest::data(
            2,
            "grad",
            Payload::Tensor(TensorProto {
                dtype: DataType::F32,
                shape: vec![2],
                content: Bytes::from(vec![0u8; 8]),
            }),
        );
        let bytes = bincode::serialize(&request).expect("encode");
        let decoded: TransmitRequest = bincode::deserialize(&bytes).expect("decode");
        assert_eq!(decoded, request);
    }

    #[test]
    fn load_response_maps_outcome() {
        assert!(LoadDataBlockResponse::from_outcome(true).is_success());
        assert_eq!(
            LoadDataBlockResponse::from_outcome(false).status,
            StatusCode::InvalidDataBlock
        );
    }
}
