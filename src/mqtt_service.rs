use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet,
    QoS,
};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::models::{EntityIdentity, TelemetryPayload};

const REQUEST_CAPACITY: usize = 10;

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_client_id: String,
    pub mqtt_username: String,
    pub mqtt_password: String,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
}

impl MqttConfig {
    /// The entity connects under its own id, authenticated by owner and token.
    pub fn for_entity(config: &Config, identity: &EntityIdentity, token: &str) -> Self {
        Self {
            mqtt_host: config.mqtt_host.clone(),
            mqtt_port: config.mqtt_port,
            mqtt_client_id: identity.entity_id.clone(),
            mqtt_username: identity.user_id.clone(),
            mqtt_password: token.to_string(),
            keep_alive: Duration::from_secs(config.mqtt_keep_alive_secs),
            connect_timeout: config.mqtt_connect_timeout(),
        }
    }

    pub fn options(&self) -> MqttOptions {
        let mut mqtt_options = MqttOptions::new(&self.mqtt_client_id, &self.mqtt_host, self.mqtt_port);
        mqtt_options.set_keep_alive(self.keep_alive);
        mqtt_options.set_clean_session(true);
        mqtt_options.set_credentials(&self.mqtt_username, &self.mqtt_password);
        mqtt_options
    }
}

/// Result of the first exchange with the broker.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionOutcome {
    Connected { session_present: bool },
    Refused(ConnectReturnCode),
    Failed(String),
}

impl ConnectionOutcome {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionOutcome::Connected { .. })
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("MQTT client rejected the request: {0}")]
    Client(#[from] ClientError),
}

#[derive(Clone)]
pub struct TelemetryPublisher {
    client: AsyncClient,
}

impl TelemetryPublisher {
    /// Opens the connection and waits for the broker's verdict.
    ///
    /// The publisher is handed back even if the connection failed; publishing
    /// through it then simply never reaches the broker.
    pub async fn connect(config: &MqttConfig) -> (Self, ConnectionOutcome) {
        debug!("Configuring MQTT broker at {}:{}...", config.mqtt_host, config.mqtt_port);

        let (client, eventloop) = AsyncClient::new(config.options(), REQUEST_CAPACITY);
        let (connected_tx, connected_rx) = oneshot::channel();
        tokio::spawn(drive_event_loop(eventloop, connected_tx));

        let outcome = match timeout(config.connect_timeout, connected_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => ConnectionOutcome::Failed("event loop stopped before connecting".to_string()),
            Err(_) => ConnectionOutcome::Failed(format!(
                "no answer from broker within {:?}",
                config.connect_timeout
            )),
        };

        match &outcome {
            ConnectionOutcome::Connected { .. } => info!("Connected to MQTT broker!"),
            ConnectionOutcome::Refused(code) => warn!("Failed to connect, return code {:?}", code),
            ConnectionOutcome::Failed(reason) => warn!("Failed to connect: {}", reason),
        }

        (Self { client }, outcome)
    }

    #[cfg(test)]
    pub(crate) fn from_client(client: AsyncClient) -> Self {
        Self { client }
    }

    /// Enqueues the payload without waiting for the broker. Returns the JSON text sent.
    pub fn publish(&self, topic: &str, payload: &TelemetryPayload) -> Result<String, PublishError> {
        let message = serde_json::to_string(payload)?;
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, message.clone())?;
        Ok(message)
    }

    pub async fn disconnect(&self) -> Result<(), PublishError> {
        self.client.disconnect().await?;
        Ok(())
    }
}

/// Polls the connection until it fails or is closed. Never reconnects.
async fn drive_event_loop(mut eventloop: EventLoop, connected: oneshot::Sender<ConnectionOutcome>) {
    let mut connected = Some(connected);

    let failure = loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                let outcome = if ack.code == ConnectReturnCode::Success {
                    ConnectionOutcome::Connected {
                        session_present: ack.session_present,
                    }
                } else {
                    ConnectionOutcome::Refused(ack.code)
                };
                if let Some(tx) = connected.take() {
                    let _ = tx.send(outcome);
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                info!("Disconnected from MQTT broker.");
                break None;
            }
            Ok(event) => {
                debug!("MQTT event: {:?}", event);
            }
            Err(ConnectionError::ConnectionRefused(code)) => {
                error!("MQTT broker refused the connection: {:?}", code);
                break Some(ConnectionOutcome::Refused(code));
            }
            Err(e) => {
                error!("Error in MQTT event loop: {:?}", e);
                break Some(ConnectionOutcome::Failed(e.to_string()));
            }
        }
    };

    // closes the request queue so later publishes fail fast
    drop(eventloop);

    if let (Some(outcome), Some(tx)) = (failure, connected.take()) {
        let _ = tx.send(outcome);
    }

    warn!("MQTT event loop stopped; further telemetry will not be delivered.");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn test_config(port: u16) -> MqttConfig {
        MqttConfig {
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: port,
            mqtt_client_id: "abc123".to_string(),
            mqtt_username: "abc".to_string(),
            mqtt_password: "tok-1".to_string(),
            keep_alive: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
        }
    }

    /// Accepts one client, swallows its CONNECT and answers with the given CONNACK code.
    async fn fake_broker(return_code: u8) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 512];
            let _ = stream.read(&mut buf).await;
            stream.write_all(&[0x20, 0x02, 0x00, return_code]).await.unwrap();
            // hold the socket open
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        port
    }

    #[test]
    fn options_authenticate_as_entity_owner() {
        let options = test_config(32412).options();

        assert_eq!(options.client_id(), "abc123");
        assert_eq!(options.broker_address(), ("127.0.0.1".to_string(), 32412));
        assert_eq!(options.credentials(), Some(("abc".to_string(), "tok-1".to_string())));
        assert_eq!(options.keep_alive(), Duration::from_secs(10));
        assert!(options.clean_session());
    }

    #[test]
    fn config_is_derived_from_entity() {
        let config = Config::from_lookup(|key| match key {
            "MQTT_HOST" => Some("broker.local".to_string()),
            "MQTT_PORT" => Some("1883".to_string()),
            _ => None,
        })
        .unwrap();
        let identity = EntityIdentity::new("abc123", "device", "abc");

        let mqtt = MqttConfig::for_entity(&config, &identity, "tok-1");

        assert_eq!(mqtt.mqtt_client_id, "abc123");
        assert_eq!(mqtt.mqtt_username, "abc");
        assert_eq!(mqtt.mqtt_password, "tok-1");
        assert_eq!(mqtt.mqtt_host, "broker.local");
        assert_eq!(mqtt.mqtt_port, 1883);
    }

    #[tokio::test]
    async fn connect_reports_success() {
        let port = fake_broker(0x00).await;

        let (_publisher, outcome) = TelemetryPublisher::connect(&test_config(port)).await;

        assert_eq!(outcome, ConnectionOutcome::Connected { session_present: false });
        assert!(outcome.is_connected());
    }

    #[tokio::test]
    async fn connect_reports_refusal_code() {
        let port = fake_broker(0x05).await;

        let (_publisher, outcome) = TelemetryPublisher::connect(&test_config(port)).await;

        assert_eq!(outcome, ConnectionOutcome::Refused(ConnectReturnCode::NotAuthorized));
    }

    #[tokio::test]
    async fn connect_reports_unreachable_broker() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let (_publisher, outcome) = TelemetryPublisher::connect(&test_config(port)).await;

        assert!(matches!(outcome, ConnectionOutcome::Failed(_)), "got {:?}", outcome);
    }

    #[tokio::test]
    async fn publish_after_failed_connection_is_rejected_not_blocking() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let (publisher, _) = TelemetryPublisher::connect(&test_config(port)).await;
        let payload = TelemetryPayload::single("p1", crate::models::TelemetrySample { value: 1, time: 0 });

        let err = publisher.publish("system/test", &payload).unwrap_err();

        assert!(matches!(err, PublishError::Client(_)));
    }
}
