use std::collections::VecDeque;

use lockstep_proto::TransmitRequest;

/// Bounded FIFO of messages waiting for the background sender.
///
/// The queue itself never blocks; producers that find it full wait on the
/// session's notifier until the sender pops an item.
#[derive(Debug)]
pub struct OutboundQueue {
    items: VecDeque<TransmitRequest>,
    capacity: usize,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    /// Append unless full; a rejected request is handed back.
    pub fn push(&mut self, request: TransmitRequest) -> Result<(), TransmitRequest> {
        if self.is_full() {
            return Err(request);
        }
        self.items.push_back(request);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<TransmitRequest> {
        self.items.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_past_capacity() {
        let mut queue = OutboundQueue::new(2);
        assert!(queue.push(TransmitRequest::start(0)).is_ok());
        assert!(queue.push(TransmitRequest::commit(0)).is_ok());
        assert!(queue.is_full());
        let rejected = queue.push(TransmitRequest::start(1)).expect_err("full");
        assert_eq!(rejected, TransmitRequest::start(1));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn pops_in_fifo_order() {
        let mut queue = OutboundQueue::new(4);
        for request in [
            TransmitRequest::start(7),
            TransmitRequest::commit(7),
            TransmitRequest::start(8),
        ] {
            queue.push(request).expect("room");
        }
        assert_eq!(queue.pop(), Some(TransmitRequest::start(7)));
        assert_eq!(queue.pop(), Some(TransmitRequest::commit(7)));
        assert_eq!(queue.pop(), Some(TransmitRequest::start(8)));
        assert!(queue.pop().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let queue = OutboundQueue::new(0);
        assert_eq!(queue.capacity(), 1);
    }
}
