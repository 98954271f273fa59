use std::collections::HashMap;

use lockstep_proto::{IterationId, Payload};

/// Payloads received from the peer, keyed by iteration and name.
#[derive(Debug, Default)]
pub struct InboundBuffer {
    entries: HashMap<IterationId, HashMap<String, Payload>>,
}

impl InboundBuffer {
    /// Store a payload, overwriting any previous value under the same key.
    /// Returns true when a value was replaced.
    pub fn insert(&mut self, iter_id: IterationId, name: String, payload: Payload) -> bool {
        self.entries
            .entry(iter_id)
            .or_default()
            .insert(name, payload)
            .is_some()
    }

    pub fn get(&self, iter_id: IterationId, name: &str) -> Option<&Payload> {
        self.entries.get(&iter_id)?.get(name)
    }

    /// Drop everything held for `iter_id`; returns how many entries went away.
    pub fn discard(&mut self, iter_id: IterationId) -> usize {
        self.entries
            .remove(&iter_id)
            .map(|names| names.len())
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use lockstep_proto::AnyMessage;

    fn payload(tag: &'static [u8]) -> Payload {
        Payload::Any(AnyMessage {
            type_url: "test/Blob".into(),
            value: Bytes::from_static(tag),
        })
    }

    #[test]
    fn insert_overwrites_and_discard_clears_iteration() {
        let mut buffer = InboundBuffer::default();
        assert!(!buffer.insert(3, "x".into(), payload(b"a")));
        assert!(buffer.insert(3, "x".into(), payload(b"b")));
        buffer.insert(3, "y".into(), payload(b"c"));
        buffer.insert(4, "x".into(), payload(b"d"));
        assert_eq!(buffer.get(3, "x"), Some(&payload(b"b")));
        assert_eq!(buffer.len(), 3);

        assert_eq!(buffer.discard(3), 2);
        assert_eq!(buffer.get(3, "y"), None);
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.discard(3), 0);
        assert_eq!(buffer.get(4, "x"), Some(&payload(b"d")));
    }
}
