use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use futures::stream::{self, BoxStream, StreamExt};
use lockstep_proto::{IterationId, LoadDataBlockRequest, Payload, TransmitRequest};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, error, warn};

use crate::error::{BridgeError, BridgeResult};
use crate::metrics::BridgeMetrics;
use crate::state::{BridgeState, CommitReceipt, Lookup};

pub type DataBlockHandler = Arc<dyn Fn(&LoadDataBlockRequest) -> bool + Send + Sync>;

/// Shared state of one paired session: a single lock and a single notifier.
///
/// Every waiter (full queue, empty queue, missing data) re-checks its own
/// predicate after each wakeup, so spurious wakeups are harmless.
pub(crate) struct Session {
    pub(crate) state: Mutex<BridgeState>,
    changed: Notify,
    alert_interval: Duration,
    pub(crate) metrics: BridgeMetrics,
    pub(crate) data_block_handler: OnceLock<DataBlockHandler>,
}

impl Session {
    pub fn new(queue_capacity: usize, alert_interval: Duration) -> Self {
        Self {
            state: Mutex::new(BridgeState::new(queue_capacity)),
            changed: Notify::new(),
            alert_interval,
            metrics: BridgeMetrics::default(),
            data_block_handler: OnceLock::new(),
        }
    }

    pub fn notify_all(&self) {
        self.changed.notify_waiters();
    }

    /// Re-run `poll` under the lock after every state change until it yields.
    async fn wait_until<T, F>(&self, mut poll: F) -> T
    where
        F: FnMut(&mut BridgeState) -> Option<T>,
    {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent notify is not lost.
            notified.as_mut().enable();
            let ready = {
                let mut state = self.state.lock();
                poll(&mut *state)
            };
            if let Some(value) = ready {
                return value;
            }
            notified.await;
        }
    }

    /// Poll wrapper that reports a full queue each time the producer has to wait.
    fn blocked_on_full_queue<T>(&self, state: &BridgeState, step: Option<T>) -> Option<T> {
        if step.is_none() {
            BridgeMetrics::bump(&self.metrics.queue_full_waits);
            warn!(
                target = "bridge.queue",
                size = state.outbound.len(),
                capacity = state.outbound.capacity(),
                "transmit stream queue is full"
            );
        }
        step
    }

    pub async fn enqueue(&self, request: TransmitRequest) -> BridgeResult<()> {
        let kind = request.kind();
        let iter_id = request.iter_id();
        let mut request = Some(request);
        self.wait_until(|state| {
            let step = state.try_enqueue(&mut request);
            self.blocked_on_full_queue(state, step)
        })
        .await?;
        BridgeMetrics::bump(&self.metrics.enqueued);
        self.notify_all();
        debug!(target = "bridge.queue", kind, iter_id, "enqueued");
        Ok(())
    }

    pub async fn start(&self, iter_id: IterationId) -> BridgeResult<()> {
        self.wait_until(|state| {
            let step = state.try_start(iter_id);
            self.blocked_on_full_queue(state, step)
        })
        .await
        .inspect_err(|err| error!(target = "bridge", iter_id, error = %err, "start rejected"))?;
        BridgeMetrics::bump(&self.metrics.enqueued);
        self.notify_all();
        debug!(target = "bridge", iter_id, "send start");
        Ok(())
    }

    pub async fn commit(&self) -> BridgeResult<IterationId> {
        let CommitReceipt { iter_id, discarded } = self
            .wait_until(|state| {
                let step = state.try_commit();
                self.blocked_on_full_queue(state, step)
            })
            .await
            .inspect_err(|err| error!(target = "bridge", error = %err, "commit rejected"))?;
        BridgeMetrics::bump(&self.metrics.enqueued);
        BridgeMetrics::add(&self.metrics.entries_discarded, discarded as u64);
        self.notify_all();
        if discarded > 0 {
            debug!(target = "bridge", iter_id, discarded, "dropped received data on commit");
        }
        debug!(target = "bridge", iter_id, "send commit");
        Ok(iter_id)
    }

    /// Lazy sequence consumed by the transport. Ends once the session is
    /// terminated and every queued message has been yielded.
    pub fn outbound_stream(self: Arc<Self>) -> BoxStream<'static, TransmitRequest> {
        stream::unfold(self, |session| async move {
            let next = session
                .wait_until(|state| match state.outbound.pop() {
                    Some(request) => Some(Some(request)),
                    None if state.terminated => Some(None),
                    None => None,
                })
                .await;
            session.notify_all();
            match next {
                Some(request) => {
                    BridgeMetrics::bump(&session.metrics.sent);
                    Some((request, session))
                }
                None => {
                    debug!(target = "bridge.queue", "transmit stream drained");
                    None
                }
            }
        })
        .boxed()
    }

    pub async fn receive(&self, iter_id: IterationId, name: &str) -> BridgeResult<Payload> {
        debug!(target = "bridge.receive", iter_id, name, "waiting to receive");
        let alert = self.alert_interval.max(Duration::from_millis(1));
        let started = Instant::now();
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let lookup = self.state.lock().lookup(iter_id, name);
            match lookup {
                Lookup::Found(payload) => {
                    debug!(
                        target = "bridge.receive",
                        iter_id,
                        name,
                        elapsed_secs = started.elapsed().as_secs_f64(),
                        "received"
                    );
                    return Ok(payload);
                }
                Lookup::PeerCommitted => {
                    let err = BridgeError::PeerCommittedWithoutData {
                        iter_id,
                        name: name.to_string(),
                    };
                    error!(target = "bridge.receive", iter_id, name, "{err}");
                    return Err(err);
                }
                Lookup::PeerTerminated => {
                    let err = BridgeError::PeerTerminated {
                        iter_id,
                        name: name.to_string(),
                    };
                    error!(target = "bridge.receive", iter_id, name, "{err}");
                    return Err(err);
                }
                Lookup::LinkFailed => {
                    error!(target = "bridge.receive", iter_id, name, "transport failed while waiting");
                    return Err(BridgeError::LinkFailed);
                }
                Lookup::Pending => {}
            }
            let elapsed = started.elapsed();
            let into_period = elapsed.as_nanos() % alert.as_nanos();
            let until_alert = alert.saturating_sub(Duration::from_nanos(into_period as u64));
            if tokio::time::timeout(until_alert, notified).await.is_err() {
                BridgeMetrics::bump(&self.metrics.receive_alerts);
                warn!(
                    target = "bridge.receive",
                    iter_id,
                    name,
                    elapsed_secs = started.elapsed().as_secs_f64(),
                    "still waiting to receive"
                );
            }
        }
    }

    pub fn mark_started(&self) -> bool {
        let mut state = self.state.lock();
        !std::mem::replace(&mut state.started, true)
    }

    /// Undo `mark_started` after a connect attempt failed.
    pub fn clear_started(&self) {
        self.state.lock().started = false;
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    /// Returns whether this call flipped the flag.
    pub fn mark_terminated(&self) -> bool {
        let flipped = !std::mem::replace(&mut self.state.lock().terminated, true);
        self.notify_all();
        flipped
    }

    pub fn mark_peer_terminated(&self) {
        self.state.lock().peer_terminated = true;
        self.notify_all();
    }

    /// Fail pending and future calls after the transport broke.
    pub fn mark_link_failed(&self) {
        self.state.lock().link_failed = true;
        self.notify_all();
    }
}
