use std::time::Duration;

use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, field, instrument, Span};

use crate::config::Config;
use crate::models::{EntityCreateRequest, EntityIdentity, Subscription, TokenRequest, TokenResponse};

#[derive(Debug, Error)]
pub enum KeelApiError {
    #[error("Invalid Keel endpoint URL: {0}")]
    InvalidUrl(String),

    #[error("Request to Keel failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Response decoding failed: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Response is missing field '{0}'")]
    MissingField(&'static str),
}

/// Status and decoded body of a Keel call. The status is informational only.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: Value,
}

#[derive(Debug, Clone)]
pub struct KeelClient {
    http: Client,
    base_url: String,
    source: String,
    timeout: Duration,
}

impl KeelClient {
    pub fn new(config: &Config) -> Self {
        Self::with_base_url(&config.keel_url, &config.source, config.http_timeout())
    }

    pub fn with_base_url(base_url: &str, source: &str, timeout: Duration) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            source: source.to_string(),
            timeout,
        }
    }

    /// Obtains the entity token used as credential for registration and MQTT.
    #[instrument(skip_all, fields(entity_id = %identity.entity_id, status = field::Empty), err)]
    pub async fn request_token(&self, identity: &EntityIdentity) -> Result<String, KeelApiError> {
        let url = token_url(&self.base_url)?;
        let response = self
            .send(self.http.post(url).json(&TokenRequest::from(identity)))
            .await?;

        let token: TokenResponse = serde_json::from_value(response.body)?;
        token
            .data
            .and_then(|data| data.entity_token)
            .ok_or(KeelApiError::MissingField("data.entity_token"))
    }

    #[instrument(skip_all, fields(entity_id = %identity.entity_id, status = field::Empty), err)]
    pub async fn create_entity(
        &self,
        identity: &EntityIdentity,
        plugin_id: &str,
        token: &str,
    ) -> Result<ApiResponse, KeelApiError> {
        let url = entity_create_url(&self.base_url, plugin_id, identity, &self.source)?;
        self.send(self.http.post(url).json(&EntityCreateRequest { token }))
            .await
    }

    #[instrument(skip_all, fields(subscription_id = %subscription.subscription_id, status = field::Empty), err)]
    pub async fn create_subscription(
        &self,
        identity: &EntityIdentity,
        plugin_id: &str,
        subscription: &Subscription,
    ) -> Result<ApiResponse, KeelApiError> {
        let url = subscription_create_url(&self.base_url, plugin_id, identity, subscription, &self.source)?;
        debug!("subscription request: {:?}", subscription.request_body());
        self.send(self.http.post(url).json(&subscription.request_body()))
            .await
    }

    #[instrument(skip_all, fields(subscription_id = %subscription.subscription_id, status = field::Empty), err)]
    pub async fn get_subscription(
        &self,
        identity: &EntityIdentity,
        plugin_id: &str,
        subscription: &Subscription,
    ) -> Result<ApiResponse, KeelApiError> {
        let url = subscription_get_url(&self.base_url, plugin_id, identity, subscription, &self.source)?;
        self.send(self.http.get(url)).await
    }

    /// Reads the entity back and returns its `properties` field.
    #[instrument(skip_all, fields(entity_id = %identity.entity_id, status = field::Empty), err)]
    pub async fn get_entity(&self, identity: &EntityIdentity, plugin_id: &str) -> Result<Value, KeelApiError> {
        let url = entity_get_url(&self.base_url, plugin_id, identity)?;
        let mut response = self.send(self.http.get(url)).await?;

        response
            .body
            .get_mut("properties")
            .map(Value::take)
            .ok_or(KeelApiError::MissingField("properties"))
    }

    async fn send(&self, request: RequestBuilder) -> Result<ApiResponse, KeelApiError> {
        debug!("calling keel");
        let response = request.timeout(self.timeout).send().await?;
        let status = response.status();
        Span::current().record("status", field::display(status));

        let text = response.text().await?;
        let body = serde_json::from_str(&text)?;
        Ok(ApiResponse { status, body })
    }
}

pub fn token_url(base_url: &str) -> Result<Url, KeelApiError> {
    endpoint(base_url, &["auth", "token", "create"], &[])
}

pub fn entity_create_url(
    base_url: &str,
    plugin_id: &str,
    identity: &EntityIdentity,
    source: &str,
) -> Result<Url, KeelApiError> {
    endpoint(
        base_url,
        &["core", "plugins", plugin_id, "entities"],
        &[
            ("id", identity.entity_id.as_str()),
            ("type", identity.entity_type.as_str()),
            ("owner", identity.user_id.as_str()),
            ("source", source),
        ],
    )
}

pub fn subscription_create_url(
    base_url: &str,
    plugin_id: &str,
    identity: &EntityIdentity,
    subscription: &Subscription,
    source: &str,
) -> Result<Url, KeelApiError> {
    endpoint(
        base_url,
        &["core", "plugins", plugin_id, "subscriptions"],
        &[
            ("id", subscription.subscription_id.as_str()),
            ("type", subscription.subscription_type.as_str()),
            ("owner", identity.user_id.as_str()),
            ("source", source),
        ],
    )
}

pub fn subscription_get_url(
    base_url: &str,
    plugin_id: &str,
    identity: &EntityIdentity,
    subscription: &Subscription,
    source: &str,
) -> Result<Url, KeelApiError> {
    endpoint(
        base_url,
        &["core", "plugins", plugin_id, "subscriptions", subscription.subscription_id.as_str()],
        &[
            ("type", subscription.subscription_type.as_str()),
            ("owner", identity.user_id.as_str()),
            ("source", source),
        ],
    )
}

/// Entity reads are scoped to the plugin, so the plugin id doubles as source.
pub fn entity_get_url(base_url: &str, plugin_id: &str, identity: &EntityIdentity) -> Result<Url, KeelApiError> {
    endpoint(
        base_url,
        &["core", "plugins", plugin_id, "entities", identity.entity_id.as_str()],
        &[
            ("type", identity.entity_type.as_str()),
            ("owner", identity.user_id.as_str()),
            ("source", plugin_id),
        ],
    )
}

fn endpoint(base_url: &str, segments: &[&str], query: &[(&str, &str)]) -> Result<Url, KeelApiError> {
    let mut url = Url::parse(base_url).map_err(|e| KeelApiError::InvalidUrl(format!("{}: {}", base_url, e)))?;

    url.path_segments_mut()
        .map_err(|_| KeelApiError::InvalidUrl(format!("{}: cannot be a base", base_url)))?
        .pop_if_empty()
        .extend(segments);

    if !query.is_empty() {
        url.query_pairs_mut().extend_pairs(query);
    }

    Ok(url)
}
