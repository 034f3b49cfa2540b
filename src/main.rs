mod config;
mod keel_api;
mod models;
mod mqtt_service;
mod provisioning;
mod service_utils;

use crate::config::Config;
use crate::keel_api::KeelClient;
use crate::models::EntityIdentity;
use crate::mqtt_service::{MqttConfig, TelemetryPublisher};
use crate::provisioning::Provisioner;
use crate::service_utils::{run_session, shutdown_signal};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Error loading configuration: {:?}", e);
            return;
        }
    };

    let identity = EntityIdentity::new(&config.entity_id, &config.entity_type, &config.user_id);
    info!(
        entity_id = %identity.entity_id,
        entity_type = %identity.entity_type,
        user_id = %identity.user_id,
        "base entity info"
    );

    let keel = KeelClient::new(&config);
    let provisioner = Provisioner::new(keel.clone(), &config);
    let provisioned = match provisioner.run(&identity).await {
        Ok(provisioned) => provisioned,
        Err(e) => {
            error!("Provisioning failed: {}", e);
            return;
        }
    };

    info!(
        entity_registered = provisioned.entity_registered,
        subscription_id = %provisioned.subscription.subscription_id,
        "provisioning complete"
    );

    info!("update properties by mqtt");
    let mqtt_config = MqttConfig::for_entity(&config, &identity, &provisioned.token);
    let (publisher, outcome) = TelemetryPublisher::connect(&mqtt_config).await;
    if !outcome.is_connected() {
        error!("Continuing without a broker connection: {:?}", outcome);
    }

    let shutdown = shutdown_signal();

    match run_session(&config, &keel, &identity, publisher, shutdown).await {
        Ok(stats) => info!(
            published = stats.published,
            dropped = stats.dropped,
            "Client shut down successfully."
        ),
        Err(e) => error!("Reading entity failed: {}", e),
    }
}
