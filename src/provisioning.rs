use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tracing::{error, info};

use crate::config::Config;
use crate::keel_api::{KeelApiError, KeelClient};
use crate::models::{EntityIdentity, Subscription};

#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("Requesting entity token failed: {0}")]
    Token(#[source] KeelApiError),
    #[error("Creating subscription failed: {0}")]
    CreateSubscription(#[source] KeelApiError),
    #[error("Reading subscription failed: {0}")]
    ReadSubscription(#[source] KeelApiError),
}

/// What the device holds after provisioning.
#[derive(Debug, Clone)]
pub struct Provisioned {
    pub token: String,
    pub entity_registered: bool,
    pub subscription: Subscription,
}

pub struct Provisioner {
    keel: KeelClient,
    plugin_id: String,
    subscription_topic: String,
    pubsub_name: String,
    step_pause: Duration,
}

impl Provisioner {
    pub fn new(keel: KeelClient, config: &Config) -> Self {
        Self {
            keel,
            plugin_id: config.plugin_id.clone(),
            subscription_topic: config.subscription_topic.clone(),
            pubsub_name: config.pubsub_name.clone(),
            step_pause: config.step_pause(),
        }
    }

    pub fn with_step_pause(mut self, step_pause: Duration) -> Self {
        self.step_pause = step_pause;
        self
    }

    /// Token, entity registration, subscription creation and read-back, in that order.
    ///
    /// Only entity registration is allowed to fail; the sequence carries on
    /// without it. Every other failure aborts provisioning.
    pub async fn run(&self, identity: &EntityIdentity) -> Result<Provisioned, ProvisioningError> {
        info!("get entity token");
        let token = self
            .keel
            .request_token(identity)
            .await
            .map_err(ProvisioningError::Token)?;
        info!("token={}", token);
        sleep(self.step_pause).await;

        info!("create entity with token");
        let entity_registered = match self.keel.create_entity(identity, &self.plugin_id, &token).await {
            Ok(response) => {
                info!("create entity response ({}): {}", response.status, response.body);
                info!("create entity {} success", identity.entity_id);
                true
            }
            Err(e) => {
                error!("create entity failed: {}", e);
                false
            }
        };
        sleep(self.step_pause).await;

        info!("create subscription");
        let subscription =
            Subscription::realtime_for(&identity.entity_id, &self.subscription_topic, &self.pubsub_name);
        let created = self
            .keel
            .create_subscription(identity, &self.plugin_id, &subscription)
            .await
            .map_err(ProvisioningError::CreateSubscription)?;
        info!("create subscription response ({}): {}", created.status, created.body);

        info!("get subscription");
        let fetched = self
            .keel
            .get_subscription(identity, &self.plugin_id, &subscription)
            .await
            .map_err(ProvisioningError::ReadSubscription)?;
        info!("get subscription response ({}): {}", fetched.status, fetched.body);

        Ok(Provisioned {
            token,
            entity_registered,
            subscription,
        })
    }
}
