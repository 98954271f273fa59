use lockstep_proto::{IterationId, Payload, TransmitRequest};

use crate::buffer::InboundBuffer;
use crate::error::BridgeError;
use crate::queue::OutboundQueue;

/// Everything guarded by the session lock.
#[derive(Debug)]
pub(crate) struct BridgeState {
    pub current_iter_id: Option<IterationId>,
    pub next_iter_id: IterationId,
    pub peer_start_iter_id: Option<IterationId>,
    pub peer_commit_iter_id: Option<IterationId>,
    pub received: InboundBuffer,
    pub outbound: OutboundQueue,
    pub started: bool,
    pub terminated: bool,
    pub peer_terminated: bool,
    pub link_failed: bool,
}

/// Result of checking the buffer on behalf of a blocked receive.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Lookup {
    Found(Payload),
    PeerCommitted,
    PeerTerminated,
    LinkFailed,
    Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CommitReceipt {
    pub iter_id: IterationId,
    pub discarded: usize,
}

impl BridgeState {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            current_iter_id: None,
            next_iter_id: 0,
            peer_start_iter_id: None,
            peer_commit_iter_id: None,
            received: InboundBuffer::default(),
            outbound: OutboundQueue::new(queue_capacity),
            started: false,
            terminated: false,
            peer_terminated: false,
            link_failed: false,
        }
    }

    /// Oldest iteration whose data this side may still consume.
    pub fn consumption_watermark(&self) -> IterationId {
        self.current_iter_id.unwrap_or(self.next_iter_id)
    }

    /// Failure every mutating call reports once the session is over.
    fn closed(&self) -> Option<BridgeError> {
        if self.terminated {
            Some(BridgeError::Terminated)
        } else if self.link_failed {
            Some(BridgeError::LinkFailed)
        } else {
            None
        }
    }

    /// `None` while the queue is full, otherwise whether a push may proceed.
    fn admission(&self) -> Option<Result<(), BridgeError>> {
        if let Some(err) = self.closed() {
            return Some(Err(err));
        }
        if self.outbound.is_full() {
            return None;
        }
        Some(Ok(()))
    }

    fn push(&mut self, request: TransmitRequest) {
        // Callers checked admission under the same lock.
        let _ = self.outbound.push(request);
    }

    pub fn try_enqueue(&mut self, request: &mut Option<TransmitRequest>) -> Option<Result<(), BridgeError>> {
        if let Err(err) = self.admission()? {
            return Some(Err(err));
        }
        if let Some(request) = request.take() {
            self.push(request);
        }
        Some(Ok(()))
    }

    pub fn try_start(&mut self, iter_id: IterationId) -> Option<Result<(), BridgeError>> {
        if let Some(err) = self.closed() {
            return Some(Err(err));
        }
        if let Some(current) = self.current_iter_id {
            return Some(Err(BridgeError::IterationNotFinished {
                current,
                requested: iter_id,
            }));
        }
        if let Err(err) = self.admission()? {
            return Some(Err(err));
        }
        self.current_iter_id = Some(iter_id);
        self.push(TransmitRequest::start(iter_id));
        Some(Ok(()))
    }

    pub fn try_commit(&mut self) -> Option<Result<CommitReceipt, BridgeError>> {
        if let Some(err) = self.closed() {
            return Some(Err(err));
        }
        let Some(iter_id) = self.current_iter_id else {
            return Some(Err(BridgeError::NotStarted));
        };
        if let Err(err) = self.admission()? {
            return Some(Err(err));
        }
        self.push(TransmitRequest::commit(iter_id));
        self.current_iter_id = None;
        self.next_iter_id += 1;
        let discarded = self.received.discard(iter_id);
        Some(Ok(CommitReceipt { iter_id, discarded }))
    }

    pub fn lookup(&self, iter_id: IterationId, name: &str) -> Lookup {
        if let Some(payload) = self.received.get(iter_id, name) {
            return Lookup::Found(payload.clone());
        }
        if self
            .peer_commit_iter_id
            .is_some_and(|committed| iter_id <= committed)
        {
            return Lookup::PeerCommitted;
        }
        if self.peer_terminated {
            return Lookup::PeerTerminated;
        }
        if self.link_failed {
            return Lookup::LinkFailed;
        }
        Lookup::Pending
    }
}
