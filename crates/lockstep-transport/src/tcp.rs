use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::link::{Connector, FramedTransport};

/// How hard `dial` tries before giving up on the peer.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 60,
            interval: Duration::from_secs(1),
        }
    }
}

pub struct TcpConnector {
    listen_addr: String,
    remote_addr: String,
    retry: RetryPolicy,
    listener: Mutex<Option<TcpListener>>,
}

pub type TcpTransport = FramedTransport<TcpConnector>;

impl TcpConnector {
    pub fn new(listen_addr: impl Into<String>, remote_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            remote_addr: remote_addr.into(),
            retry: RetryPolicy::default(),
            listener: Mutex::new(None),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

impl TcpTransport {
    pub fn tcp(
        listen_addr: impl Into<String>,
        remote_addr: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        FramedTransport::new(TcpConnector::new(listen_addr, remote_addr), token)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn dial(&self) -> io::Result<TcpStream> {
        let attempts = self.retry.attempts.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            match TcpStream::connect(&self.remote_addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    info!(target = "transport.tcp", remote = %self.remote_addr, attempt, "dialed peer");
                    return Ok(stream);
                }
                Err(err) => {
                    debug!(
                        target = "transport.tcp",
                        remote = %self.remote_addr,
                        attempt,
                        error = %err,
                        "peer not reachable yet"
                    );
                    last_err = Some(err);
                    if attempt < attempts {
                        tokio::time::sleep(self.retry.interval).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "dial retries exhausted")))
    }

    async fn accept(&self) -> io::Result<TcpStream> {
        let mut guard = self.listener.lock().await;
        if guard.is_none() {
            let listener = TcpListener::bind(&self.listen_addr).await?;
            info!(target = "transport.tcp", listen = %self.listen_addr, "listening for peer");
            *guard = Some(listener);
        }
        let listener = guard
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "listener unavailable"))?;
        let (stream, peer) = listener.accept().await?;
        stream.set_nodelay(true)?;
        info!(target = "transport.tcp", peer = %peer, "accepted peer dial");
        Ok(stream)
    }

    fn describe(&self) -> String {
        format!("tcp:{}->{}", self.listen_addr, self.remote_addr)
    }
}
