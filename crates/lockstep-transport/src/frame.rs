use std::io;

use lockstep_proto::{LoadDataBlockRequest, LoadDataBlockResponse, TransmitRequest, TransmitResponse};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{TransportError, TransportResult};

pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Envelope for everything that crosses a lane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    Hello {
        token: String,
    },
    Transmit(TransmitRequest),
    TransmitAck(TransmitResponse),
    LoadDataBlock {
        request_id: u64,
        request: LoadDataBlockRequest,
    },
    LoadDataBlockReply {
        request_id: u64,
        response: LoadDataBlockResponse,
    },
    Goodbye,
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Hello { .. } => "hello",
            Frame::Transmit(_) => "transmit",
            Frame::TransmitAck(_) => "transmit_ack",
            Frame::LoadDataBlock { .. } => "load_data_block",
            Frame::LoadDataBlockReply { .. } => "load_data_block_reply",
            Frame::Goodbye => "goodbye",
        }
    }
}

/// Encoded body length of `frame`, failing when it exceeds [`MAX_FRAME_LEN`].
pub fn checked_len(frame: &Frame) -> TransportResult<usize> {
    let len = bincode::serialized_size(frame).map_err(|err| TransportError::Codec(err.to_string()))?;
    let len = usize::try_from(len).unwrap_or(usize::MAX);
    if len > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(len));
    }
    Ok(len)
}

/// Write one length-prefixed frame and flush it.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> TransportResult<()>
where
    W: AsyncWrite + Unpin,
{
    let body = bincode::serialize(frame).map_err(|err| TransportError::Codec(err.to_string()))?;
    if body.len() > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(body.len()));
    }
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the peer closed the lane between frames.
pub async fn read_frame<R>(reader: &mut R) -> TransportResult<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    bincode::deserialize(&body)
        .map(Some)
        .map_err(|err| TransportError::Codec(err.to_string()))
}
