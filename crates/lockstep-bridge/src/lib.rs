//! Lockstep bridge: keeps two cooperating workers in step, one iteration at a
//! time.
//!
//! Responsibilities:
//! - opening, exchanging named values for, and committing local iterations
//! - validating the peer's Start/Data/Commit stream, tolerating resends
//! - bounded, ordered outbound queue with producer backpressure
//! - blocking receive that fails fast once the value provably cannot arrive
//! - reacting to transport lifecycle events (peer closed, channel failure)

pub mod bridge;
pub mod buffer;
pub mod codec;
pub mod config;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod queue;
mod session;
mod state;
pub mod supervisor;

pub use bridge::Bridge;
pub use codec::{CodecError, MessageCodec, PayloadCodec, Tensor, TensorCodec, TensorElement};
pub use config::BridgeConfig;
pub use error::{BridgeError, BridgeResult};
pub use metrics::BridgeMetricsSnapshot;
pub use session::DataBlockHandler;
pub use supervisor::{FatalHook, ProcessExit, RESTART_EXIT_CODE};

pub use lockstep_proto::{IterationId, LoadDataBlockRequest, Payload};
