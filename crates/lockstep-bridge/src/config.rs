use std::env;
use std::time::Duration;

use crate::error::{BridgeError, BridgeResult};

pub const DEFAULT_APP_ID: &str = "test_trainer";
pub const DEFAULT_STREAM_QUEUE_SIZE: usize = 1024;
pub const DEFAULT_WAITING_ALERT: Duration = Duration::from_secs(10);
pub const MIN_WAITING_ALERT: Duration = Duration::from_secs(1);

/// Settings for one side of a paired session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Free-form label, e.g. `leader` or `follower`.
    pub role: String,
    pub listen_addr: String,
    pub remote_addr: String,
    pub app_id: String,
    pub rank: u32,
    /// Capacity of the outbound queue.
    pub stream_queue_size: usize,
    /// How often a blocked receive reports that it is still waiting.
    pub waiting_alert_timeout: Duration,
}

impl BridgeConfig {
    pub fn new(
        role: impl Into<String>,
        listen_addr: impl Into<String>,
        remote_addr: impl Into<String>,
    ) -> Self {
        Self {
            role: role.into(),
            listen_addr: listen_addr.into(),
            remote_addr: remote_addr.into(),
            ..Self::default()
        }
    }

    /// Listen address covering every interface on `port`.
    pub fn any_interface(port: u16) -> String {
        format!("[::]:{port}")
    }

    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = app_id.into();
        self
    }

    pub fn with_rank(mut self, rank: u32) -> Self {
        self.rank = rank;
        self
    }

    pub fn with_stream_queue_size(mut self, size: usize) -> Self {
        self.stream_queue_size = size;
        self
    }

    pub fn with_waiting_alert_timeout(mut self, timeout: Duration) -> Self {
        self.waiting_alert_timeout = timeout;
        self
    }

    /// Pairs the two transport endpoints of one job/participant.
    pub fn token(&self) -> String {
        format!("{}-{}", self.app_id, self.rank)
    }

    pub fn alert_interval(&self) -> Duration {
        self.waiting_alert_timeout.max(MIN_WAITING_ALERT)
    }

    /// Load configuration from `LOCKSTEP_*` environment variables, falling back
    /// to defaults for anything unset.
    pub fn from_env() -> BridgeResult<Self> {
        let mut config = Self::default();
        if let Ok(role) = env::var("LOCKSTEP_ROLE") {
            config.role = role;
        }
        if let Ok(listen) = env::var("LOCKSTEP_LISTEN_ADDR") {
            config.listen_addr = listen;
        }
        if let Ok(remote) = env::var("LOCKSTEP_REMOTE_ADDR") {
            config.remote_addr = remote;
        }
        if let Ok(app_id) = env::var("LOCKSTEP_APP_ID") {
            config.app_id = app_id;
        }
        if let Some(rank) = parse_var("LOCKSTEP_RANK")? {
            config.rank = rank;
        }
        if let Some(size) = parse_var("LOCKSTEP_STREAM_QUEUE_SIZE")? {
            config.stream_queue_size = size;
        }
        if let Some(secs) = parse_var::<u64>("LOCKSTEP_WAITING_ALERT_SECS")? {
            config.waiting_alert_timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }
}

fn parse_var<T: std::str::FromStr>(key: &'static str) -> BridgeResult<Option<T>> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| BridgeError::InvalidConfig { key, value }),
        Err(_) => Ok(None),
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            role: "leader".to_string(),
            listen_addr: Self::any_interface(50051),
            remote_addr: "127.0.0.1:50052".to_string(),
            app_id: DEFAULT_APP_ID.to_string(),
            rank: 0,
            stream_queue_size: DEFAULT_STREAM_QUEUE_SIZE,
            waiting_alert_timeout: DEFAULT_WAITING_ALERT,
        }
    }
}
