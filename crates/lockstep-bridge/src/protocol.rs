//! Validation of the peer's Start/Data/Commit stream against the local and
//! peer watermarks.
//!
//! Resent or stale messages are dropped with a warning and never surface to
//! callers; the acknowledgement returned to the transport is always success.

use lockstep_proto::{
    CommitMessage, DataMessage, LoadDataBlockRequest, LoadDataBlockResponse, StartMessage,
    TransmitRequest, TransmitResponse,
};
use lockstep_transport::InboundService;
use tracing::{debug, error, info, warn};

use crate::metrics::BridgeMetrics;
use crate::session::Session;
use crate::state::BridgeState;

/// What the state machine did with one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// State changed; waiters should re-check.
    Accepted,
    /// Stale or duplicate, ignored.
    Dropped,
    /// Inconsistent with our view of the peer. Logged, ignored.
    Anomaly,
}

impl BridgeState {
    pub(crate) fn apply(&mut self, request: TransmitRequest) -> Disposition {
        match request {
            TransmitRequest::Start(msg) => self.apply_start(msg),
            TransmitRequest::Data(msg) => self.apply_data(msg),
            TransmitRequest::Commit(msg) => self.apply_commit(msg),
        }
    }

    fn apply_start(&mut self, msg: StartMessage) -> Disposition {
        let iter_id = msg.iter_id;
        if let Some(committed) = self.peer_commit_iter_id.filter(|c| iter_id <= *c) {
            warn!(
                target = "bridge.protocol",
                iter_id,
                peer_commit_iter_id = committed,
                "received peer start for committed iteration, maybe caused by resend"
            );
            return Disposition::Dropped;
        }
        if let Some(open) = self.peer_start_iter_id.filter(|s| iter_id <= *s) {
            warn!(
                target = "bridge.protocol",
                iter_id,
                peer_start_iter_id = open,
                "received repeated peer start, maybe caused by resend"
            );
            return Disposition::Dropped;
        }
        debug!(target = "bridge.protocol", iter_id, "received peer start");
        self.peer_start_iter_id = Some(iter_id);
        Disposition::Accepted
    }

    fn apply_data(&mut self, msg: DataMessage) -> Disposition {
        let DataMessage {
            iter_id,
            name,
            payload,
        } = msg;
        let Some(open) = self.peer_start_iter_id else {
            warn!(
                target = "bridge.protocol",
                iter_id,
                name = %name,
                "received data without start, maybe caused by resend"
            );
            return Disposition::Dropped;
        };
        if open != iter_id {
            warn!(
                target = "bridge.protocol",
                iter_id,
                name = %name,
                peer_start_iter_id = open,
                "received data not matching peer start, maybe caused by resend"
            );
            return Disposition::Dropped;
        }
        let watermark = self.consumption_watermark();
        if iter_id < watermark {
            debug!(
                target = "bridge.protocol",
                iter_id,
                name = %name,
                current_iter_id = ?self.current_iter_id,
                next_iter_id = self.next_iter_id,
                "received data already passed by our commit"
            );
            return Disposition::Dropped;
        }
        debug!(
            target = "bridge.protocol",
            iter_id,
            name = %name,
            kind = payload.kind(),
            bytes = payload.byte_len(),
            "received data"
        );
        self.received.insert(iter_id, name, payload);
        Disposition::Accepted
    }

    fn apply_commit(&mut self, msg: CommitMessage) -> Disposition {
        let iter_id = msg.iter_id;
        if let Some(committed) = self.peer_commit_iter_id.filter(|c| iter_id <= *c) {
            warn!(
                target = "bridge.protocol",
                iter_id,
                peer_commit_iter_id = committed,
                "received repeated peer commit, maybe caused by resend"
            );
            return Disposition::Dropped;
        }
        match self.peer_start_iter_id {
            None => {
                error!(target = "bridge.protocol", iter_id, "received peer commit without start");
                Disposition::Anomaly
            }
            Some(open) if open != iter_id => {
                error!(
                    target = "bridge.protocol",
                    iter_id,
                    peer_start_iter_id = open,
                    "received peer commit not matching start"
                );
                Disposition::Anomaly
            }
            Some(_) => {
                debug!(target = "bridge.protocol", iter_id, "received peer commit");
                self.peer_start_iter_id = None;
                self.peer_commit_iter_id = Some(iter_id);
                Disposition::Accepted
            }
        }
    }
}

impl InboundService for Session {
    fn transmit(&self, request: TransmitRequest) -> TransmitResponse {
        let disposition = self.state.lock().apply(request);
        let metrics = &self.metrics;
        match disposition {
            Disposition::Accepted => {
                BridgeMetrics::bump(&metrics.inbound_accepted);
                self.notify_all();
            }
            Disposition::Dropped => BridgeMetrics::bump(&metrics.inbound_dropped),
            Disposition::Anomaly => BridgeMetrics::bump(&metrics.protocol_anomalies),
        }
        TransmitResponse::success()
    }

    fn load_data_block(&self, request: LoadDataBlockRequest) -> LoadDataBlockResponse {
        let Some(handler) = self.data_block_handler.get() else {
            error!(
                target = "bridge.data_block",
                block_id = %request.block_id,
                "received data block request but no handler registered"
            );
            return LoadDataBlockResponse::from_outcome(false);
        };
        let loaded = handler(&request);
        if loaded {
            info!(target = "bridge.data_block", block_id = %request.block_id, "succeeded to load data block");
        } else {
            info!(target = "bridge.data_block", block_id = %request.block_id, "failed to load data block");
        }
        LoadDataBlockResponse::from_outcome(loaded)
    }
}
