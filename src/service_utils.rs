use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::keel_api::{KeelApiError, KeelClient};
use crate::models::{EntityIdentity, TelemetryPayload, TelemetrySample};
use crate::mqtt_service::TelemetryPublisher;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishStats {
    pub published: u64,
    pub dropped: u64,
}

/// Returns a receiver that flips to `true` once Ctrl-C is received.
pub fn shutdown_signal() -> watch::Receiver<bool> {
    shutdown_on(tokio::signal::ctrl_c())
}

/// If `signal` fails the sender is kept alive, so the receiver simply never fires.
fn shutdown_on<F>(signal: F) -> watch::Receiver<bool>
where
    F: Future<Output = std::io::Result<()>> + Send + 'static,
{
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match signal.await {
            Ok(()) => {
                info!("Client is shutting down...");
                let _ = tx.send(true);
            }
            Err(e) => {
                error!("Failed to handle termination signal: {:?}", e);
                std::future::pending::<()>().await;
            }
        }
    });
    rx
}

/// Publish one fresh sample of `property` to `topic`. Failures are logged, not returned.
pub fn publish_sample(publisher: &TelemetryPublisher, topic: &str, property: &str) -> bool {
    let payload = TelemetryPayload::single(property, TelemetrySample::random_now());
    match publisher.publish(topic, &payload) {
        Ok(message) => {
            info!("Message published to '{}': {}", topic, message);
            true
        }
        Err(e) => {
            warn!("Failed to publish message to '{}': {}", topic, e);
            false
        }
    }
}

/// Publishes a sample every `period`, the first one a full period from now.
/// Stops when `shutdown` turns true or its sender goes away.
pub async fn run_publish_loop(
    publisher: TelemetryPublisher,
    topic: String,
    property: String,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> PublishStats {
    let mut stats = PublishStats::default();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            _ = ticker.tick() => {
                if publish_sample(&publisher, &topic, &property) {
                    stats.published += 1;
                } else {
                    stats.dropped += 1;
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    info!(
        "Telemetry loop stopped: {} published, {} dropped.",
        stats.published, stats.dropped
    );
    stats
}

/// Publishes the first sample, reads the entity back, then runs the periodic loop.
///
/// The publisher is disconnected on every exit, including a failed entity read.
pub async fn run_session(
    config: &Config,
    keel: &KeelClient,
    identity: &EntityIdentity,
    publisher: TelemetryPublisher,
    shutdown: watch::Receiver<bool>,
) -> Result<PublishStats, KeelApiError> {
    let result = stream_telemetry(config, keel, identity, &publisher, shutdown).await;

    if let Err(e) = publisher.disconnect().await {
        error!("Failed to disconnect from MQTT broker: {}", e);
    }

    result
}

async fn stream_telemetry(
    config: &Config,
    keel: &KeelClient,
    identity: &EntityIdentity,
    publisher: &TelemetryPublisher,
    shutdown: watch::Receiver<bool>,
) -> Result<PublishStats, KeelApiError> {
    sleep(config.step_pause()).await;
    publish_sample(publisher, &config.telemetry_topic, &config.telemetry_property);

    info!("get entity");
    let properties = keel.get_entity(identity, &config.plugin_id).await?;
    info!("entity properties: {}", properties);

    Ok(run_publish_loop(
        publisher.clone(),
        config.telemetry_topic.clone(),
        config.telemetry_property.clone(),
        config.telemetry_interval(),
        shutdown,
    )
    .await)
}
