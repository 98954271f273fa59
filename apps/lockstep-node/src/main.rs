use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use lockstep_bridge::{Bridge, BridgeConfig, IterationId, Tensor, TensorCodec};
use tokio::signal;
use tracing::{info, warn};

mod telemetry;

const ACTIVATIONS: &str = "activations";
const GRADIENTS: &str = "gradients";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Role {
    Leader,
    Follower,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Role::Leader => "leader",
            Role::Follower => "follower",
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "lockstep-node",
    author,
    version,
    about = "Runs one side of a lockstep training session"
)]
struct Cli {
    /// Which side of the session this process plays.
    #[arg(long, value_enum, env = "LOCKSTEP_ROLE", default_value = "leader")]
    role: Role,

    /// Address the inbound listener binds to.
    #[arg(long = "listen", env = "LOCKSTEP_LISTEN_ADDR", default_value = "[::]:50051")]
    listen_addr: String,

    /// Address of the peer's listener.
    #[arg(long = "remote", env = "LOCKSTEP_REMOTE_ADDR", default_value = "127.0.0.1:50052")]
    remote_addr: String,

    #[arg(long, env = "LOCKSTEP_APP_ID", default_value = "test_trainer")]
    app_id: String,

    #[arg(long, env = "LOCKSTEP_RANK", default_value_t = 0)]
    rank: u32,

    #[arg(long, env = "LOCKSTEP_STREAM_QUEUE_SIZE", default_value_t = 1024)]
    stream_queue_size: usize,

    /// Seconds between "still waiting" warnings from a blocked receive.
    #[arg(long, env = "LOCKSTEP_WAITING_ALERT_SECS", default_value_t = 10)]
    waiting_alert_secs: u64,

    /// Number of iterations to run before terminating.
    #[arg(long, default_value_t = 10)]
    iterations: u64,

    /// Rows in each activation batch.
    #[arg(long, default_value_t = 32)]
    batch_size: u64,
}

impl Cli {
    fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig::new(
            self.role.as_str(),
            self.listen_addr.clone(),
            self.remote_addr.clone(),
        )
        .with_app_id(self.app_id.clone())
        .with_rank(self.rank)
        .with_stream_queue_size(self.stream_queue_size)
        .with_waiting_alert_timeout(Duration::from_secs(self.waiting_alert_secs))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init()?;

    let cli = Cli::parse();
    let config = cli.bridge_config();
    info!(
        role = %config.role,
        listen_addr = %config.listen_addr,
        remote_addr = %config.remote_addr,
        token = %config.token(),
        iterations = cli.iterations,
        "starting lockstep node"
    );

    let bridge = Bridge::tcp(config);
    bridge
        .register_data_block_handler(|request| {
            info!(
                block_id = %request.block_id,
                count = request.count,
                "peer asked to load data block"
            );
            request.count > 0
        })
        .context("failed to register data block handler")?;
    bridge.connect().await.context("failed to connect to peer")?;

    tokio::select! {
        outcome = run(&bridge, cli.role, cli.iterations, cli.batch_size) => {
            if let Err(err) = outcome {
                warn!(error = %err, "session aborted");
                bridge.terminate().await.context("failed to terminate bridge")?;
                return Err(err);
            }
        }
        _ = signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    bridge.terminate().await.context("failed to terminate bridge")?;
    let metrics = bridge.metrics();
    info!(
        sent = metrics.sent,
        inbound_accepted = metrics.inbound_accepted,
        inbound_dropped = metrics.inbound_dropped,
        protocol_anomalies = metrics.protocol_anomalies,
        "lockstep node finished"
    );
    Ok(())
}

async fn run(bridge: &Bridge, role: Role, iterations: u64, batch_size: u64) -> Result<()> {
    let codec = TensorCodec::<f32>::new();
    for _ in 0..iterations {
        let iter_id = bridge.new_iter_id();
        bridge
            .start(iter_id)
            .await
            .with_context(|| format!("failed to start iteration {iter_id}"))?;
        match role {
            Role::Leader => {
                if iter_id == 0 {
                    let loaded = bridge
                        .load_data_block(batch_size, format!("block-{iter_id}"))
                        .await
                        .context("data block request failed")?;
                    info!(loaded, "data block request answered");
                }
                let activations = activations(iter_id, batch_size);
                bridge
                    .send_with(&codec, iter_id, ACTIVATIONS, &activations)
                    .await?;
                let gradients = bridge.receive_with(&codec, iter_id, GRADIENTS).await?;
                info!(
                    iter_id,
                    norm = l2_norm(&gradients.values),
                    "received gradients"
                );
            }
            Role::Follower => {
                let activations = bridge.receive_with(&codec, iter_id, ACTIVATIONS).await?;
                let gradients = Tensor::new(
                    activations.shape.clone(),
                    activations.values.iter().map(|value| value * 0.5).collect(),
                );
                bridge
                    .send_with(&codec, iter_id, GRADIENTS, &gradients)
                    .await?;
            }
        }
        bridge
            .commit()
            .await
            .with_context(|| format!("failed to commit iteration {iter_id}"))?;
    }
    Ok(())
}

fn activations(iter_id: IterationId, batch_size: u64) -> Tensor<f32> {
    let values = (0..batch_size)
        .map(|row| (iter_id + row) as f32 / batch_size.max(1) as f32)
        .collect();
    Tensor::vector(values)
}

fn l2_norm(values: &[f32]) -> f32 {
    values.iter().map(|value| value * value).sum::<f32>().sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_maps_onto_bridge_config() {
        let cli = Cli::parse_from([
            "lockstep-node",
            "--role",
            "follower",
            "--listen",
            "[::]:6000",
            "--remote",
            "10.0.0.2:6001",
            "--app-id",
            "ctr",
            "--rank",
            "3",
            "--waiting-alert-secs",
            "0",
        ]);
        let config = cli.bridge_config();
        assert_eq!(config.role, "follower");
        assert_eq!(config.listen_addr, "[::]:6000");
        assert_eq!(config.remote_addr, "10.0.0.2:6001");
        assert_eq!(config.token(), "ctr-3");
        assert_eq!(config.alert_interval(), Duration::from_secs(1));
    }

    #[test]
    fn activations_fill_one_row_per_example() {
        let tensor = activations(2, 4);
        assert_eq!(tensor.shape, vec![4]);
        assert_eq!(tensor.values, vec![0.5, 0.75, 1.0, 1.25]);
    }
}
