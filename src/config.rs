use dotenvy::dotenv;
use reqwest::Url;
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub keel_url: String,
    pub plugin_id: String,
    pub source: String,
    pub user_id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub subscription_topic: String,
    pub pubsub_name: String,
    pub http_timeout_ms: u64,

    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_keep_alive_secs: u64,
    pub mqtt_connect_timeout_ms: u64,

    pub telemetry_topic: String,
    pub telemetry_property: String,
    pub telemetry_interval_ms: u64,
    pub step_pause_ms: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable {0} is missing or invalid.")]
    MissingOrInvalid(String),
    #[error("Parsing error: {0}")]
    ParsingError(String),
}

const MIN_TIMEOUT: u64 = 100;
const MAX_TIMEOUT: u64 = 1_000_000;

impl Config {
    /// Validate timeout values and other critical configurations.
    fn validate(&self) -> Result<(), ConfigError> {
        Url::parse(&self.keel_url)
            .map_err(|e| ConfigError::ParsingError(format!("KEEL_URL is not a valid URL: {}", e)))?;

        for (name, value) in [
            ("HTTP_TIMEOUT_MS", self.http_timeout_ms),
            ("MQTT_CONNECT_TIMEOUT_MS", self.mqtt_connect_timeout_ms),
            ("TELEMETRY_INTERVAL_MS", self.telemetry_interval_ms),
            ("STEP_PAUSE_MS", self.step_pause_ms),
        ] {
            if !(MIN_TIMEOUT..=MAX_TIMEOUT).contains(&value) {
                return Err(ConfigError::ParsingError(format!(
                    "{} must be between {} and {} ms",
                    name, MIN_TIMEOUT, MAX_TIMEOUT
                )));
            }
        }

        for (name, value) in [
            ("KEEL_PLUGIN_ID", &self.plugin_id),
            ("KEEL_USER_ID", &self.user_id),
            ("KEEL_ENTITY_TYPE", &self.entity_type),
            ("KEEL_ENTITY_ID", &self.entity_id),
            ("MQTT_HOST", &self.mqtt_host),
            ("TELEMETRY_TOPIC", &self.telemetry_topic),
            ("TELEMETRY_PROPERTY", &self.telemetry_property),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingOrInvalid(name.to_string()));
            }
        }

        Ok(())
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok(); // Load environment variables from .env file

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let string_or = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let config = Self {
            // Keel REST API
            keel_url: string_or("KEEL_URL", "http://192.168.123.9:30707/v0.1.0")
                .trim_end_matches('/')
                .to_string(),
            plugin_id: string_or("KEEL_PLUGIN_ID", "pluginA"),
            source: string_or("KEEL_SOURCE", "abc"),
            user_id: string_or("KEEL_USER_ID", "abc"),
            entity_type: string_or("KEEL_ENTITY_TYPE", "device"),
            entity_id: lookup("KEEL_ENTITY_ID").unwrap_or_else(|| Uuid::new_v4().simple().to_string()),
            subscription_topic: string_or("KEEL_SUBSCRIPTION_TOPIC", "abc"),
            pubsub_name: string_or("KEEL_PUBSUB_NAME", "client-pubsub"),
            http_timeout_ms: parse_or(&lookup, "HTTP_TIMEOUT_MS", 10_000)?,

            // MQTT Configuration
            mqtt_host: string_or("MQTT_HOST", "192.168.123.9"),
            mqtt_port: parse_or(&lookup, "MQTT_PORT", 32412)?,
            mqtt_keep_alive_secs: parse_or(&lookup, "MQTT_KEEP_ALIVE_SECS", 10)?,
            mqtt_connect_timeout_ms: parse_or(&lookup, "MQTT_CONNECT_TIMEOUT_MS", 10_000)?,

            // Telemetry
            telemetry_topic: string_or("TELEMETRY_TOPIC", "system/test"),
            telemetry_property: string_or("TELEMETRY_PROPERTY", "p1"),
            telemetry_interval_ms: parse_or(&lookup, "TELEMETRY_INTERVAL_MS", 5_000)?,
            step_pause_ms: parse_or(&lookup, "STEP_PAUSE_MS", 1_000)?,
        };

        config.validate()?;

        Ok(config)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn mqtt_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.mqtt_connect_timeout_ms)
    }

    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_millis(self.telemetry_interval_ms)
    }

    pub fn step_pause(&self) -> Duration {
        Duration::from_millis(self.step_pause_ms)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::ParsingError(format!("{} must be a valid number", key))),
        None => Ok(default),
    }
}
