use std::io;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::DuplexStream;

use crate::link::{Connector, FramedTransport};

const MEMORY_BUFFER: usize = 256 * 1024;

/// In-process connector backed by tokio duplex pipes. Each end can be dialed
/// and accepted exactly once.
pub struct MemoryConnector {
    label: String,
    dial: Mutex<Option<DuplexStream>>,
    accept: Mutex<Option<DuplexStream>>,
}

pub type MemoryTransport = FramedTransport<MemoryConnector>;

#[async_trait]
impl Connector for MemoryConnector {
    type Stream = DuplexStream;

    async fn dial(&self) -> io::Result<DuplexStream> {
        self.dial
            .lock()
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "memory lane already dialed"))
    }

    async fn accept(&self) -> io::Result<DuplexStream> {
        self.accept.lock().take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "memory lane already accepted")
        })
    }

    fn describe(&self) -> String {
        format!("memory:{}", self.label)
    }
}

/// Build two transports wired to each other, both using `token`.
pub fn pair(token: &str) -> (MemoryTransport, MemoryTransport) {
    pair_with_tokens(token, token)
}

/// Like [`pair`], but lets each side present its own token.
pub fn pair_with_tokens(left_token: &str, right_token: &str) -> (MemoryTransport, MemoryTransport) {
    let (left_dial, right_accept) = tokio::io::duplex(MEMORY_BUFFER);
    let (right_dial, left_accept) = tokio::io::duplex(MEMORY_BUFFER);
    let left = MemoryConnector {
        label: "left".into(),
        dial: Mutex::new(Some(left_dial)),
        accept: Mutex::new(Some(left_accept)),
    };
    let right = MemoryConnector {
        label: "right".into(),
        dial: Mutex::new(Some(right_dial)),
        accept: Mutex::new(Some(right_accept)),
    };
    (
        FramedTransport::new(left, left_token),
        FramedTransport::new(right, right_token),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use bytes::Bytes;
    use futures::stream::{self, StreamExt};
    use lockstep_proto::{
        AnyMessage, LoadDataBlockRequest, LoadDataBlockResponse, Payload, TransmitRequest,
        TransmitResponse,
    };
    use test_timeout::timeout_test;

    use super::*;
    use crate::frame::MAX_FRAME_LEN;
    use crate::{InboundService, Transport, TransportError, TransportEvent};

    #[derive(Default)]
    struct Recorder {
        transmits: parking_lot::Mutex<Vec<TransmitRequest>>,
        blocks: AtomicUsize,
    }

    impl InboundService for Recorder {
        fn transmit(&self, request: TransmitRequest) -> TransmitResponse {
            self.transmits.lock().push(request);
            TransmitResponse::success()
        }

        fn load_data_block(&self, request: LoadDataBlockRequest) -> LoadDataBlockResponse {
            self.blocks.fetch_add(1, Ordering::SeqCst);
            LoadDataBlockResponse::from_outcome(request.block_id.starts_with("ok"))
        }
    }

    async fn connected_pair() -> (MemoryTransport, MemoryTransport, Arc<Recorder>, Arc<Recorder>) {
        let (left, right) = pair("job-0");
        let left_service = Arc::new(Recorder::default());
        let right_service = Arc::new(Recorder::default());
        left.serve(left_service.clone());
        right.serve(right_service.clone());
        let (a, b) = tokio::join!(left.connect(), right.connect());
        a.expect("left connect");
        b.expect("right connect");
        (left, right, left_service, right_service)
    }

    #[timeout_test(10)]
    async fn transmit_stream_is_delivered_in_order_and_acked() {
        let (left, _right, _, right_service) = connected_pair().await;
        let requests = vec![
            TransmitRequest::start(0),
            TransmitRequest::commit(0),
            TransmitRequest::start(1),
        ];
        let acked = left
            .stream_transmit(stream::iter(requests.clone()).boxed())
            .await
            .expect("stream");
        assert_eq!(acked, 3);
        assert_eq!(*right_service.transmits.lock(), requests);
        assert!(left.connected_at().is_some());
    }

    #[timeout_test(10)]
    async fn data_block_request_round_trips() {
        let (left, right, _, right_service) = connected_pair().await;
        let ok = left
            .load_data_block(LoadDataBlockRequest {
                count: 1,
                block_id: "ok-17".into(),
            })
            .await
            .expect("load");
        assert!(ok.is_success());
        let rejected = right
            .load_data_block(LoadDataBlockRequest {
                count: 1,
                block_id: "missing".into(),
            })
            .await
            .expect("load");
        assert!(!rejected.is_success());
        assert_eq!(right_service.blocks.load(Ordering::SeqCst), 1);
    }

    #[timeout_test(10)]
    async fn graceful_close_reports_peer_closed_once() {
        let (left, right, _, _) = connected_pair().await;
        let mut events = right.subscribe();
        left.close().await.expect("close");
        assert!(left.closed_at().is_some());
        assert_eq!(events.recv().await.expect("event"), TransportEvent::PeerClosed);
        right.close().await.expect("close");
        assert!(events.try_recv().is_err());
    }

    #[timeout_test(10)]
    async fn severed_peer_is_reported_as_error() {
        let (left, right, _, _) = connected_pair().await;
        let mut events = right.subscribe();
        left.sever();
        match events.recv().await.expect("event") {
            TransportEvent::Error(TransportError::ConnectionLost(_)) => {}
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[timeout_test(20)]
    async fn unwritable_frame_fails_the_link_on_both_sides() {
        let (left, right, _, right_service) = connected_pair().await;
        let mut left_events = left.subscribe();
        let mut right_events = right.subscribe();
        let huge = TransmitRequest::data(
            0,
            "blob",
            Payload::Any(AnyMessage {
                type_url: "test/Blob".into(),
                value: Bytes::from(vec![0u8; MAX_FRAME_LEN + 1]),
            }),
        );
        assert!(matches!(
            left.check_transmit(&huge),
            Err(TransportError::FrameTooLarge(_))
        ));
        assert!(left.check_transmit(&TransmitRequest::start(0)).is_ok());

        left.stream_transmit(stream::iter(vec![huge]).boxed())
            .await
            .expect_err("never acknowledged");
        match left_events.recv().await.expect("event") {
            TransportEvent::Error(TransportError::FrameTooLarge(_)) => {}
            other => panic!("unexpected event {other:?}"),
        }
        match right_events.recv().await.expect("event") {
            TransportEvent::Error(TransportError::ConnectionLost(_)) => {}
            other => panic!("unexpected event {other:?}"),
        }
        assert!(right_service.transmits.lock().is_empty());
    }

    #[timeout_test(10)]
    async fn mismatched_token_fails_to_connect() {
        let (left, right) = pair_with_tokens("job-0", "job-1");
        let (a, b) = tokio::join!(left.connect(), right.connect());
        assert!(a.is_err());
        assert!(b.is_err());
    }
}
