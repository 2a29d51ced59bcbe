//! Configuration types for brokers and broker-backed buses

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

fn env_var<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|value| value.trim().parse().ok())
}

fn env_flag(key: &str) -> bool {
    matches!(
        std::env::var(key).as_deref().map(str::trim),
        Ok("1" | "true" | "TRUE" | "yes")
    )
}

/// Settings shared by the broker-backed buses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Upper bound on messages processed at once by one bus
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Deadline given to each handler invocation, in milliseconds
    pub handler_timeout_ms: Option<u64>,
    /// Refuse to dispatch commands and queries that have no handler on this bus
    #[serde(default = "default_true")]
    pub require_local_handler: bool,
    /// Consumer group shared by the event buses of one service.
    ///
    /// Buses in the same group take turns on each event. Without a group
    /// every event bus receives every event.
    #[serde(default)]
    pub event_group: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_max_in_flight() -> usize {
    64
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            handler_timeout_ms: None,
            require_local_handler: true,
            event_group: None,
        }
    }
}

impl BusConfig {
    /// Load configuration from `COURIER_MAX_IN_FLIGHT`, `COURIER_HANDLER_TIMEOUT_MS`,
    /// `COURIER_REMOTE_HANDLERS` and `COURIER_EVENT_GROUP`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(max) = env_var("COURIER_MAX_IN_FLIGHT") {
            config = config.with_max_in_flight(max);
        }
        if let Some(ms) = env_var::<u64>("COURIER_HANDLER_TIMEOUT_MS") {
            config = config.with_handler_timeout(Duration::from_millis(ms));
        }
        if env_flag("COURIER_REMOTE_HANDLERS") {
            config = config.with_remote_handlers();
        }
        if let Ok(group) = std::env::var("COURIER_EVENT_GROUP") {
            config = config.with_event_group(group);
        }
        config
    }

    /// Allow dispatching to names handled only by other processes.
    pub fn with_remote_handlers(mut self) -> Self {
        self.require_local_handler = false;
        self
    }

    /// Share events with the other buses of `group` instead of receiving all of them.
    pub fn with_event_group(mut self, group: impl Into<String>) -> Self {
        self.event_group = Some(group.into());
        self
    }

    /// Set the in-flight limit (at least one)
    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max.max(1);
        self
    }

    /// Set the per-invocation handler deadline
    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn handler_timeout(&self) -> Option<Duration> {
        self.handler_timeout_ms.map(Duration::from_millis)
    }
}

/// In-process channel broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Capacity of each subscriber's queue
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// How many times a nacked message is redelivered before it is dropped
    #[serde(default = "default_max_redeliveries")]
    pub max_redeliveries: u32,
}

fn default_buffer_size() -> usize {
    100
}

fn default_max_redeliveries() -> u32 {
    3
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            max_redeliveries: default_max_redeliveries(),
        }
    }
}

impl ChannelConfig {
    /// Load configuration from `COURIER_CHANNEL_BUFFER` and `COURIER_CHANNEL_MAX_REDELIVERIES`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(size) = env_var("COURIER_CHANNEL_BUFFER") {
            config = config.with_buffer_size(size);
        }
        if let Some(max) = env_var("COURIER_CHANNEL_MAX_REDELIVERIES") {
            config = config.with_max_redeliveries(max);
        }
        config
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.max(1);
        self
    }

    pub fn with_max_redeliveries(mut self, max: u32) -> Self {
        self.max_redeliveries = max;
        self
    }
}

/// Kafka-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Comma-separated broker list
    pub brokers: String,
    /// Consumer group ID for competing subscriptions
    #[serde(default = "default_group_id")]
    pub group_id: String,
    /// Client ID
    pub client_id: Option<String>,
    /// Auto offset reset behavior
    #[serde(default = "default_offset_reset")]
    pub auto_offset_reset: String,
    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout")]
    pub session_timeout_ms: u32,
    /// Producer delivery timeout in milliseconds
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout_ms: u64,
    /// Create topics on first use
    #[serde(default)]
    pub initialize_topics: bool,
    /// Partitions of created topics
    #[serde(default = "default_num_partitions")]
    pub num_partitions: i32,
    /// Replication factor of created topics
    #[serde(default = "default_replication_factor")]
    pub replication_factor: i32,
    /// SASL mechanism
    pub sasl_mechanism: Option<String>,
    /// SASL username
    pub sasl_username: Option<String>,
    /// SASL password
    pub sasl_password: Option<String>,
    /// Use TLS
    #[serde(default)]
    pub tls: bool,
}

fn default_group_id() -> String {
    "courier".to_string()
}

fn default_offset_reset() -> String {
    "earliest".to_string()
}

fn default_session_timeout() -> u32 {
    30000
}

fn default_publish_timeout() -> u64 {
    5000
}

fn default_num_partitions() -> i32 {
    1
}

fn default_replication_factor() -> i32 {
    1
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            group_id: default_group_id(),
            client_id: None,
            auto_offset_reset: default_offset_reset(),
            session_timeout_ms: default_session_timeout(),
            publish_timeout_ms: default_publish_timeout(),
            initialize_topics: false,
            num_partitions: default_num_partitions(),
            replication_factor: default_replication_factor(),
            sasl_mechanism: None,
            sasl_username: None,
            sasl_password: None,
            tls: false,
        }
    }
}

impl KafkaConfig {
    /// Create a new Kafka configuration
    pub fn new(brokers: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into(),
            ..Default::default()
        }
    }

    /// Load configuration from `KAFKA_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(brokers) = std::env::var("KAFKA_BROKERS") {
            config.brokers = brokers;
        }
        if let Ok(group_id) = std::env::var("KAFKA_GROUP_ID") {
            config = config.with_group_id(group_id);
        }
        if let Ok(client_id) = std::env::var("KAFKA_CLIENT_ID") {
            config = config.with_client_id(client_id);
        }
        if let Ok(reset) = std::env::var("KAFKA_AUTO_OFFSET_RESET") {
            config.auto_offset_reset = reset;
        }
        if env_flag("KAFKA_INITIALIZE_TOPICS") {
            config.initialize_topics = true;
        }
        if let Some(partitions) = env_var("KAFKA_NUM_PARTITIONS") {
            config.num_partitions = partitions;
        }
        if let Some(replication) = env_var("KAFKA_REPLICATION_FACTOR") {
            config.replication_factor = replication;
        }
        if let (Ok(mechanism), Ok(username), Ok(password)) = (
            std::env::var("KAFKA_SASL_MECHANISM"),
            std::env::var("KAFKA_SASL_USERNAME"),
            std::env::var("KAFKA_SASL_PASSWORD"),
        ) {
            config = config.with_sasl(mechanism, username, password);
        }
        if env_flag("KAFKA_TLS") {
            config.tls = true;
        }

        config
    }

    /// Set the consumer group ID
    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = group_id.into();
        self
    }

    /// Set the client ID
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Set auto offset reset to "latest"
    pub fn from_latest(mut self) -> Self {
        self.auto_offset_reset = "latest".to_string();
        self
    }

    /// Create missing topics with the given layout
    pub fn with_topic_initialization(mut self, num_partitions: i32, replication_factor: i32) -> Self {
        self.initialize_topics = true;
        self.num_partitions = num_partitions.max(1);
        self.replication_factor = replication_factor.max(1);
        self
    }

    /// Set SASL authentication
    pub fn with_sasl(
        mut self,
        mechanism: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.sasl_mechanism = Some(mechanism.into());
        self.sasl_username = Some(username.into());
        self.sasl_password = Some(password.into());
        self
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

/// Redis streams configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisStreamConfig {
    /// Redis URL (redis://host:port or rediss://host:port for TLS)
    pub url: String,
    /// Consumer group for competing subscriptions
    #[serde(default = "default_group_id")]
    pub group: String,
    /// Consumer name inside the group
    pub consumer: String,
    /// How long one XREADGROUP call blocks, in milliseconds
    #[serde(default = "default_block_ms")]
    pub block_ms: u64,
    /// Entries fetched per XREADGROUP call
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Approximate stream length cap applied on XADD
    pub max_len: Option<usize>,
}

fn default_block_ms() -> u64 {
    1000
}

fn default_batch_size() -> usize {
    10
}

impl Default for RedisStreamConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            group: default_group_id(),
            consumer: format!("courier-{}", uuid::Uuid::new_v4()),
            block_ms: default_block_ms(),
            batch_size: default_batch_size(),
            max_len: None,
        }
    }
}

impl RedisStreamConfig {
    /// Create a new configuration.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Load configuration from `REDIS_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("REDIS_URL") {
            config.url = url;
        }
        if let Ok(group) = std::env::var("REDIS_STREAM_GROUP") {
            config = config.with_group(group);
        }
        if let Ok(consumer) = std::env::var("REDIS_STREAM_CONSUMER") {
            config = config.with_consumer(consumer);
        }
        if let Some(block_ms) = env_var("REDIS_STREAM_BLOCK_MS") {
            config.block_ms = block_ms;
        }
        if let Some(batch) = env_var::<usize>("REDIS_STREAM_BATCH_SIZE") {
            config.batch_size = batch.max(1);
        }
        if let Some(max_len) = env_var("REDIS_STREAM_MAX_LEN") {
            config = config.with_max_len(max_len);
        }

        config
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = Some(max_len);
        self
    }
}
