use std::sync::Arc;

use lockstep_transport::{TransportError, TransportEvent};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::session::Session;

/// Exit code that asks the scheduler to restart this worker.
pub const RESTART_EXIT_CODE: i32 = 138;

/// What to do when the transport fails. Mid-protocol state cannot be safely
/// rebuilt, so the default gives up on the whole process.
pub trait FatalHook: Send + Sync + 'static {
    fn transport_failed(&self, error: &TransportError);
}

#[derive(Debug, Clone, Copy)]
pub struct ProcessExit {
    pub code: i32,
}

impl Default for ProcessExit {
    fn default() -> Self {
        Self {
            code: RESTART_EXIT_CODE,
        }
    }
}

impl FatalHook for ProcessExit {
    fn transport_failed(&self, error: &TransportError) {
        error!(
            target = "bridge.supervisor",
            error = %error,
            code = self.code,
            "exiting after channel failure, maybe caused by peer restart"
        );
        std::process::exit(self.code);
    }
}

/// Turns transport lifecycle events into session state changes.
pub(crate) struct ConnectionSupervisor {
    session: Arc<Session>,
    hook: Arc<dyn FatalHook>,
}

impl ConnectionSupervisor {
    pub(crate) fn new(session: Arc<Session>, hook: Arc<dyn FatalHook>) -> Self {
        Self { session, hook }
    }

    pub(crate) fn handle(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                info!(target = "bridge.supervisor", "channel connected");
            }
            TransportEvent::PeerClosed => {
                info!(target = "bridge.supervisor", "peer closed, waking receivers");
                self.session.mark_peer_terminated();
            }
            TransportEvent::Error(err) => {
                error!(target = "bridge.supervisor", error = %err, "channel failed");
                self.hook.transport_failed(&err);
                // Only reached when the hook lets the process live on.
                self.session.mark_link_failed();
            }
        }
    }

    pub(crate) fn spawn(self, mut events: broadcast::Receiver<TransportEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => self.handle(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(target = "bridge.supervisor", skipped, "lifecycle events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
