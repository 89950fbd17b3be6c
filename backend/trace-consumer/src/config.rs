/// Configuration management for the trace consumer service
///
/// Loads configuration from environment variables.
use anyhow::{Context, Result};

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Probe server settings
    pub server: ServerConfig,
    /// Kafka consumer configuration
    pub kafka: KafkaConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Message processing configuration
    pub processing: ProcessingConfig,
}

/// Probe server settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind the health check server to
    pub host: String,
    /// HTTP port for liveness/readiness probes
    pub port: u16,
}

/// Kafka consumer configuration
#[derive(Debug, Clone)]
pub struct KafkaConfig {
    /// Broker addresses
    pub brokers: Vec<String>,
    /// Topic carrying processed trace surveys
    pub topic: String,
    /// Consumer group id; empty means no group (read from latest)
    pub group_id: String,
    /// SASL PLAIN username
    pub username: String,
    /// SASL PLAIN password
    pub password: String,
}

impl KafkaConfig {
    /// Get broker addresses as a comma-separated string
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }

    /// SASL authentication is enabled only when both credentials are present
    pub fn auth_enabled(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Max connections in the ingestion pool
    pub max_connections: u32,
}

/// Message processing configuration
#[derive(Debug, Clone)]
pub struct ProcessingConfig {
    /// Additional save attempts after the first failure
    pub max_retries: u32,
    /// Flat delay between save attempts, in milliseconds
    pub retry_backoff_ms: u64,
    /// Database health probe interval, in seconds
    pub health_check_interval_secs: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            server: ServerConfig {
                host: env_or("SERVER_HOST", "0.0.0.0"),
                port: env_parse("SERVER_PORT", 8082)?,
            },
            kafka: KafkaConfig {
                brokers: parse_list(&env_or("KAFKA_BROKERS", "localhost:9092")),
                topic: env_or("KAFKA_TOPIC", "trace-survey-processed"),
                group_id: env_or("KAFKA_CONSUMER_GROUP", "trace-consumer"),
                username: env_or("KAFKA_USERNAME", ""),
                password: env_or("KAFKA_PASSWORD", ""),
            },
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .context("DATABASE_URL environment variable not set")?,
                max_connections: env_parse("DB_MAX_CONNECTIONS", 5)?,
            },
            processing: ProcessingConfig {
                max_retries: env_parse("MAX_RETRIES", 3)?,
                retry_backoff_ms: env_parse("RETRY_BACKOFF_MS", 1000)?,
                health_check_interval_secs: env_parse("HEALTH_CHECK_INTERVAL", 60)?,
            },
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .with_context(|| format!("Invalid value for {key}: {value}")),
        Err(_) => Ok(default),
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_broker_list() {
        let brokers = parse_list("kafka-0:9092, kafka-1:9092,,kafka-2:9092");
        assert_eq!(brokers, vec!["kafka-0:9092", "kafka-1:9092", "kafka-2:9092"]);
    }

    #[test]
    fn auth_requires_both_credentials() {
        let mut kafka = KafkaConfig {
            brokers: vec!["localhost:9092".to_string()],
            topic: "trace-survey-processed".to_string(),
            group_id: "trace-consumer".to_string(),
            username: String::new(),
            password: String::new(),
        };
        assert!(!kafka.auth_enabled());

        kafka.username = "consumer".to_string();
        assert!(!kafka.auth_enabled());

        kafka.password = "secret".to_string();
        assert!(kafka.auth_enabled());
    }

    #[test]
    fn joins_bootstrap_servers() {
        let kafka = KafkaConfig {
            brokers: vec!["kafka-0:9092".to_string(), "kafka-1:9092".to_string()],
            topic: "trace-survey-processed".to_string(),
            group_id: String::new(),
            username: String::new(),
            password: String::new(),
        };
        assert_eq!(kafka.bootstrap_servers(), "kafka-0:9092,kafka-1:9092");
    }
}
