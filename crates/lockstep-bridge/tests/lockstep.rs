use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use lockstep_bridge::{
    Bridge, BridgeConfig, BridgeError, FatalHook, MessageCodec, PayloadCodec, Tensor,
    TensorCodec,
};
use lockstep_proto::{AnyMessage, Payload};
use lockstep_transport::frame::MAX_FRAME_LEN;
use lockstep_transport::{
    memory, FramedTransport, MemoryTransport, RetryPolicy, TcpConnector, TransportError,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use test_timeout::timeout_test;

#[derive(Default)]
struct RecordingHook {
    errors: Mutex<Vec<TransportError>>,
}

impl FatalHook for RecordingHook {
    fn transport_failed(&self, error: &TransportError) {
        self.errors.lock().push(error.clone());
    }
}

struct Side {
    bridge: Bridge,
    transport: Arc<MemoryTransport>,
    hook: Arc<RecordingHook>,
}

fn side(role: &str, transport: MemoryTransport) -> Side {
    let transport = Arc::new(transport);
    let hook = Arc::new(RecordingHook::default());
    let config = BridgeConfig::new(role, "memory", "memory")
        .with_app_id("it")
        .with_stream_queue_size(4)
        .with_waiting_alert_timeout(Duration::from_secs(1));
    let bridge = Bridge::with_fatal_hook(config, transport.clone(), hook.clone());
    Side {
        bridge,
        transport,
        hook,
    }
}

async fn connected_pair() -> (Side, Side) {
    let (left, right) = memory::pair("it-0");
    let leader = side("leader", left);
    let follower = side("follower", right);
    let (a, b) = tokio::join!(leader.bridge.connect(), follower.bridge.connect());
    a.expect("leader connect");
    b.expect("follower connect");
    (leader, follower)
}

fn blob(tag: &'static [u8]) -> Payload {
    Payload::Any(AnyMessage {
        type_url: "it/Blob".into(),
        value: Bytes::from_static(tag),
    })
}

#[timeout_test(20)]
async fn one_iteration_end_to_end() {
    let (leader, follower) = connected_pair().await;
    assert!(leader.bridge.connected_at().is_some());

    let iter_id = leader.bridge.new_iter_id();
    assert_eq!(iter_id, 0);
    leader.bridge.start(iter_id).await.expect("start");
    assert_eq!(leader.bridge.current_iter_id(), Some(0));
    leader
        .bridge
        .send(iter_id, "loss", blob(b"P"))
        .await
        .expect("send");
    leader.bridge.commit().await.expect("commit");
    assert_eq!(leader.bridge.current_iter_id(), None);
    assert_eq!(leader.bridge.next_iter_id(), 1);

    let loss = follower.bridge.receive(0, "loss").await.expect("receive");
    assert_eq!(loss, blob(b"P"));
    follower.bridge.start(0).await.expect("start");
    follower.bridge.commit().await.expect("commit");
    assert_eq!(follower.bridge.next_iter_id(), 1);

    leader.bridge.terminate().await.expect("terminate");
    follower.bridge.terminate().await.expect("terminate");
    assert!(leader.bridge.terminated_at().is_some());
    assert!(leader.hook.errors.lock().is_empty());
    assert!(follower.hook.errors.lock().is_empty());
}

#[timeout_test(20)]
async fn receive_before_send_blocks_until_arrival() {
    let (leader, follower) = connected_pair().await;
    let follower = Arc::new(follower);
    let waiter = {
        let follower = Arc::clone(&follower);
        tokio::spawn(async move { follower.bridge.receive(5, "g").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    for _ in 0..5 {
        let id = leader.bridge.new_iter_id();
        leader.bridge.start(id).await.expect("start");
        leader.bridge.commit().await.expect("commit");
    }
    leader.bridge.start(5).await.expect("start");
    leader.bridge.send(5, "g", blob(b"grad")).await.expect("send");
    assert_eq!(waiter.await.expect("join").expect("receive"), blob(b"grad"));
}

#[timeout_test(20)]
async fn commit_discards_unconsumed_peer_data() {
    let (leader, follower) = connected_pair().await;
    leader.bridge.start(0).await.expect("start");

    follower.bridge.start(0).await.expect("start");
    follower.bridge.send(0, "grad", blob(b"g")).await.expect("send");
    follower.bridge.send(0, "sync", blob(b"s")).await.expect("send");

    // Same stream, so "grad" is buffered once "sync" is.
    leader.bridge.receive(0, "sync").await.expect("sync");
    leader.bridge.commit().await.expect("commit");
    assert_eq!(leader.bridge.metrics().entries_discarded, 2);

    follower.bridge.commit().await.expect("commit");
    let err = leader
        .bridge
        .receive(0, "grad")
        .await
        .expect_err("discarded and committed");
    assert!(matches!(err, BridgeError::PeerCommittedWithoutData { iter_id: 0, .. }));
}

#[timeout_test(20)]
async fn precondition_violations_are_reported() {
    let (leader, _follower) = connected_pair().await;
    assert!(matches!(
        leader.bridge.commit().await,
        Err(BridgeError::NotStarted)
    ));
    assert!(matches!(
        leader.bridge.send_current("x", blob(b"x")).await,
        Err(BridgeError::NotStarted)
    ));
    leader.bridge.start(0).await.expect("start");
    assert!(matches!(
        leader.bridge.start(1).await,
        Err(BridgeError::IterationNotFinished {
            current: 0,
            requested: 1
        })
    ));
    assert_eq!(leader.bridge.current_iter_id(), Some(0));
    assert_eq!(leader.bridge.next_iter_id(), 0);
}

#[timeout_test(20)]
async fn terminate_is_idempotent_and_final() {
    let (leader, follower) = connected_pair().await;
    leader.bridge.start(0).await.expect("start");
    leader.bridge.terminate().await.expect("terminate");
    leader.bridge.terminate().await.expect("terminate again");
    leader.bridge.connect().await.expect("connect after terminate is a no-op");

    let err = leader
        .bridge
        .send(0, "late", blob(b"x"))
        .await
        .expect_err("terminated");
    assert!(matches!(err, BridgeError::Terminated));
    assert!(matches!(
        leader.bridge.commit().await,
        Err(BridgeError::Terminated)
    ));

    // The start queued before terminate still reached the peer.
    let err = follower
        .bridge
        .receive(0, "never")
        .await
        .expect_err("peer closed");
    assert!(matches!(err, BridgeError::PeerTerminated { iter_id: 0, .. }));
    assert_eq!(follower.bridge.metrics().inbound_accepted, 1);
}

#[timeout_test(20)]
async fn peer_close_wakes_blocked_receive() {
    let (leader, follower) = connected_pair().await;
    let follower = Arc::new(follower);
    let waiter = {
        let follower = Arc::clone(&follower);
        tokio::spawn(async move { follower.bridge.receive(3, "x").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    leader.bridge.terminate().await.expect("terminate");
    let err = waiter.await.expect("join").expect_err("peer gone");
    assert!(matches!(err, BridgeError::PeerTerminated { iter_id: 3, .. }));
    assert!(follower.hook.errors.lock().is_empty());
}

#[timeout_test(20)]
async fn crashed_peer_triggers_fatal_hook() {
    let (leader, follower) = connected_pair().await;
    leader.transport.sever();
    for _ in 0..200 {
        if !follower.hook.errors.lock().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let errors = follower.hook.errors.lock().clone();
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], TransportError::ConnectionLost(_)));

    let err = follower.bridge.receive(0, "x").await.expect_err("link failed");
    assert!(matches!(err, BridgeError::LinkFailed));
    assert!(matches!(
        follower.bridge.start(0).await,
        Err(BridgeError::LinkFailed)
    ));
}

#[timeout_test(30)]
async fn oversized_value_is_rejected_before_queueing() {
    let (leader, follower) = connected_pair().await;
    leader.bridge.start(0).await.expect("start");
    let huge = Payload::Any(AnyMessage {
        type_url: "it/Blob".into(),
        value: Bytes::from(vec![0u8; MAX_FRAME_LEN + 1]),
    });
    let err = leader
        .bridge
        .send(0, "huge", huge)
        .await
        .expect_err("too large");
    assert!(matches!(
        err,
        BridgeError::Transport(TransportError::FrameTooLarge(_))
    ));

    leader
        .bridge
        .send(0, "small", blob(b"s"))
        .await
        .expect("send");
    assert_eq!(
        follower.bridge.receive(0, "small").await.expect("receive"),
        blob(b"s")
    );
    assert!(leader.hook.errors.lock().is_empty());
    assert!(follower.hook.errors.lock().is_empty());
}

#[timeout_test(20)]
async fn failed_connect_can_be_retried_and_fails_again() {
    let connector = TcpConnector::new("127.0.0.1:0", "127.0.0.1:1").with_retry(RetryPolicy {
        attempts: 1,
        interval: Duration::from_millis(10),
    });
    let transport = Arc::new(FramedTransport::new(connector, "it-0"));
    let hook = Arc::new(RecordingHook::default());
    let bridge = Bridge::with_fatal_hook(
        BridgeConfig::new("leader", "127.0.0.1:0", "127.0.0.1:1"),
        transport,
        hook.clone(),
    );

    assert!(bridge.connect().await.is_err());
    assert!(bridge.connect().await.is_err());
    assert!(bridge.connected_at().is_none());
    bridge.terminate().await.expect("terminate without connection");
    assert!(bridge.terminated_at().is_none());
    assert!(hook.errors.lock().is_empty());
}

#[timeout_test(20)]
async fn terminate_before_connect_is_ignored() {
    let (left, right) = memory::pair("it-0");
    let leader = side("leader", left);
    let follower = side("follower", right);
    leader.bridge.terminate().await.expect("early terminate");

    let (a, b) = tokio::join!(leader.bridge.connect(), follower.bridge.connect());
    a.expect("leader connect");
    b.expect("follower connect");
    leader.bridge.start(0).await.expect("start");
    leader.bridge.send(0, "x", blob(b"x")).await.expect("send");
    assert_eq!(
        follower.bridge.receive(0, "x").await.expect("receive"),
        blob(b"x")
    );
}

#[timeout_test(20)]
async fn data_block_requests_reach_the_registered_handler() {
    let (leader, follower) = connected_pair().await;
    let calls = Arc::new(AtomicUsize::new(0));
    {
        let calls = Arc::clone(&calls);
        follower
            .bridge
            .register_data_block_handler(move |request| {
                calls.fetch_add(1, Ordering::SeqCst);
                request.count > 0
            })
            .expect("register");
    }
    assert!(matches!(
        follower.bridge.register_data_block_handler(|_| true),
        Err(BridgeError::HandlerAlreadyRegistered)
    ));

    assert!(leader.bridge.load_data_block(16, "block-a").await.expect("load"));
    assert!(!leader.bridge.load_data_block(0, "block-b").await.expect("load"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // No handler on the leader side.
    assert!(!follower.bridge.load_data_block(1, "block-c").await.expect("load"));
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Summary {
    step: u64,
    auc: f64,
}

#[timeout_test(20)]
async fn codecs_carry_tensors_and_messages() {
    let (leader, follower) = connected_pair().await;
    let tensors = TensorCodec::<f32>::new();
    let summaries = MessageCodec::<Summary>::new("it/Summary");

    leader.bridge.start(0).await.expect("start");
    leader
        .bridge
        .send_with(&tensors, 0, "act", &Tensor::new(vec![2, 3], vec![0.5; 6]))
        .await
        .expect("send tensor");
    leader
        .bridge
        .send_with(&summaries, 0, "summary", &Summary { step: 9, auc: 0.5 })
        .await
        .expect("send message");
    leader.bridge.commit().await.expect("commit");

    follower.bridge.start(0).await.expect("start");
    let act = follower
        .bridge
        .receive_with(&tensors, 0, "act")
        .await
        .expect("tensor");
    assert_eq!(act.shape, vec![2, 3]);
    assert_eq!(act.values, vec![0.5; 6]);
    let summary = follower
        .bridge
        .receive_with(&summaries, 0, "summary")
        .await
        .expect("message");
    assert_eq!(summary, Summary { step: 9, auc: 0.5 });
    assert_eq!(
        follower.bridge.receive_current("act").await.expect("current"),
        TensorCodec::<f32>::new()
            .encode(&Tensor::new(vec![2, 3], vec![0.5; 6]))
            .expect("encode")
    );
    follower.bridge.commit().await.expect("commit");
}
