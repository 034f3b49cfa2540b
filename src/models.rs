use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Identity under which the device registers itself and publishes telemetry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityIdentity {
    pub entity_id: String,
    pub entity_type: String,
    pub user_id: String,
}

impl EntityIdentity {
    pub fn new(entity_id: impl Into<String>, entity_type: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            entity_type: entity_type.into(),
            user_id: user_id.into(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TokenRequest<'a> {
    pub entity_id: &'a str,
    pub entity_type: &'a str,
    pub user_id: &'a str,
}

impl<'a> From<&'a EntityIdentity> for TokenRequest<'a> {
    fn from(identity: &'a EntityIdentity) -> Self {
        Self {
            entity_id: &identity.entity_id,
            entity_type: &identity.entity_type,
            user_id: &identity.user_id,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub data: Option<TokenData>,
}

#[derive(Debug, Deserialize)]
pub struct TokenData {
    pub entity_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EntityCreateRequest<'a> {
    pub token: &'a str,
}

/// Descriptor of the server-side routing rule created for the entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub subscription_id: String,
    pub subscription_type: String,
    pub filter: String,
    pub topic: String,
    pub pubsub_name: String,
}

impl Subscription {
    pub const TYPE: &'static str = "SUBSCRIPTION";
    const FILTER_STREAM: &'static str = "abc";
    const FILTER_PROPERTY: &'static str = "p1";

    /// Realtime subscription on the entity's `p1` property.
    ///
    /// `topic` and `pubsub_name` only name the delivery target; the filter is fixed.
    pub fn realtime_for(entity_id: &str, topic: &str, pubsub_name: &str) -> Self {
        Self {
            subscription_id: format!("{}sub", entity_id),
            subscription_type: Self::TYPE.to_string(),
            filter: format!(
                "insert into {} select {}.{}",
                Self::FILTER_STREAM,
                entity_id,
                Self::FILTER_PROPERTY
            ),
            topic: topic.to_string(),
            pubsub_name: pubsub_name.to_string(),
        }
    }

    pub fn request_body(&self) -> SubscriptionRequest<'_> {
        SubscriptionRequest {
            mode: "realtime",
            source: "ignore",
            filter: &self.filter,
            target: "ignore",
            topic: &self.topic,
            pubsub_name: &self.pubsub_name,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SubscriptionRequest<'a> {
    pub mode: &'a str,
    pub source: &'a str,
    pub filter: &'a str,
    pub target: &'a str,
    pub topic: &'a str,
    pub pubsub_name: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub value: u8,
    pub time: i64,
}

impl TelemetrySample {
    pub const MIN_VALUE: u8 = 1;
    pub const MAX_VALUE: u8 = 100;

    pub fn random(time: i64) -> Self {
        let value = rand::rng().random_range(Self::MIN_VALUE..=Self::MAX_VALUE);
        Self { value, time }
    }

    pub fn random_now() -> Self {
        Self::random(unix_timestamp())
    }
}

/// Property name to sample, serialised as `{"p1":{"value":..,"time":..}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TelemetryPayload(BTreeMap<String, TelemetrySample>);

impl TelemetryPayload {
    pub fn single(property: impl Into<String>, sample: TelemetrySample) -> Self {
        let mut properties = BTreeMap::new();
        properties.insert(property.into(), sample);
        Self(properties)
    }
}

pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn token_request_carries_exactly_the_identity() {
        let identity = EntityIdentity::new("abc123", "device", "abc");
        let body = serde_json::to_value(TokenRequest::from(&identity)).unwrap();

        assert_eq!(
            body,
            json!({"entity_id": "abc123", "entity_type": "device", "user_id": "abc"})
        );
    }

    #[test]
    fn subscription_filter_selects_entity_property() {
        let subscription = Subscription::realtime_for("abc123", "abc", "client-pubsub");

        assert_eq!(subscription.filter, "insert into abc select abc123.p1");
        assert_eq!(subscription.subscription_id, "abc123sub");
        assert_eq!(subscription.subscription_type, "SUBSCRIPTION");
    }

    #[test]
    fn delivery_target_does_not_change_filter() {
        let subscription = Subscription::realtime_for("abc123", "alerts", "other-pubsub");

        assert_eq!(subscription.filter, "insert into abc select abc123.p1");
        assert_eq!(subscription.topic, "alerts");
        assert_eq!(subscription.pubsub_name, "other-pubsub");
    }

    #[test]
    fn subscription_body_is_realtime_descriptor() {
        let subscription = Subscription::realtime_for("abc123", "abc", "client-pubsub");
        let body = serde_json::to_value(subscription.request_body()).unwrap();

        assert_eq!(
            body,
            json!({
                "mode": "realtime",
                "source": "ignore",
                "filter": "insert into abc select abc123.p1",
                "target": "ignore",
                "topic": "abc",
                "pubsub_name": "client-pubsub",
            })
        );
    }

    #[test]
    fn random_sample_stays_in_range() {
        for _ in 0..1_000 {
            let sample = TelemetrySample::random(0);
            assert!((1..=100).contains(&sample.value), "value {} out of range", sample.value);
        }
    }

    #[test]
    fn random_now_uses_current_timestamp() {
        let before = unix_timestamp();
        let sample = TelemetrySample::random_now();
        let after = unix_timestamp();

        assert!(before <= sample.time && sample.time <= after);
    }

    #[test]
    fn payload_is_keyed_by_property() {
        let payload = TelemetryPayload::single("p1", TelemetrySample { value: 42, time: 1_700_000_000 });

        assert_eq!(
            serde_json::to_string(&payload).unwrap(),
            r#"{"p1":{"value":42,"time":1700000000}}"#
        );
    }
}
