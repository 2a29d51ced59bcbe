//! Apache Kafka adapter

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::{
    Acknowledger, Context, Delivery, DeliveryMode, DeliveryStream, Message, PubSub,
    SubscribeOptions, TransportError,
};
use dashmap::DashSet;
use rdkafka::Message as KafkaMessage;
use rdkafka::Offset;
use rdkafka::TopicPartitionList;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, Headers, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::KafkaConfig;

const METADATA_TIMEOUT: Duration = Duration::from_secs(5);
const SUBSCRIPTION_BUFFER: usize = 100;

fn connection_error(err: KafkaError) -> TransportError {
    TransportError::Connection(err.to_string())
}

fn subscribe_error(err: KafkaError) -> TransportError {
    TransportError::Subscribe(err.to_string())
}

/// [`PubSub`] backed by Kafka topics.
///
/// Competing subscriptions join their requested consumer group, or the
/// configured one, and commit offsets on ack. Broadcast subscriptions read every partition from its
/// current end under a private group and never commit.
pub struct KafkaPubSub {
    producer: FutureProducer,
    admin: Option<AdminClient<DefaultClientContext>>,
    config: KafkaConfig,
    created: DashSet<String>,
    shutdown: CancellationToken,
    pumps: TaskTracker,
}

impl KafkaPubSub {
    /// Connect to Kafka
    pub async fn connect(config: KafkaConfig) -> Result<Self, TransportError> {
        info!(brokers = %config.brokers, "Connecting to Kafka");

        let producer: FutureProducer = Self::client_config(&config)
            .set("message.timeout.ms", config.publish_timeout_ms.to_string())
            .create()
            .map_err(connection_error)?;

        let admin = if config.initialize_topics {
            Some(Self::client_config(&config).create().map_err(connection_error)?)
        } else {
            None
        };

        info!("Connected to Kafka successfully");
        Ok(Self {
            producer,
            admin,
            config,
            created: DashSet::new(),
            shutdown: CancellationToken::new(),
            pumps: TaskTracker::new(),
        })
    }

    pub fn config(&self) -> &KafkaConfig {
        &self.config
    }

    /// Settings shared by producers, consumers and the admin client.
    fn client_config(config: &KafkaConfig) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config.set("bootstrap.servers", &config.brokers);

        if let Some(ref client_id) = config.client_id {
            client_config.set("client.id", client_id);
        }

        if config.tls {
            client_config.set("security.protocol", "SSL");
        }

        if let Some(ref mechanism) = config.sasl_mechanism {
            client_config.set(
                "security.protocol",
                if config.tls { "SASL_SSL" } else { "SASL_PLAINTEXT" },
            );
            client_config.set("sasl.mechanism", mechanism);
            if let Some(ref username) = config.sasl_username {
                client_config.set("sasl.username", username);
            }
            if let Some(ref password) = config.sasl_password {
                client_config.set("sasl.password", password);
            }
        }

        client_config
    }

    fn consumer_config(&self, group_id: &str, offset_reset: &str) -> ClientConfig {
        let mut client_config = Self::client_config(&self.config);
        client_config
            .set("group.id", group_id)
            .set("auto.offset.reset", offset_reset)
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", self.config.session_timeout_ms.to_string());
        client_config
    }

    /// Create `topic` once per process when topic initialization is enabled.
    async fn ensure_topic(&self, topic: &str) -> Result<(), TransportError> {
        let Some(admin) = &self.admin else {
            return Ok(());
        };
        if self.created.contains(topic) {
            return Ok(());
        }

        let new_topic = NewTopic::new(
            topic,
            self.config.num_partitions,
            TopicReplication::Fixed(self.config.replication_factor),
        );
        let results = admin
            .create_topics(&[new_topic], &AdminOptions::new())
            .await
            .map_err(|e| TransportError::Broker(e.to_string()))?;

        for result in results {
            match result {
                Ok(name) => info!(topic = %name, "Created Kafka topic"),
                Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    debug!(topic = %name, "Kafka topic already exists")
                }
                Err((name, code)) => {
                    return Err(TransportError::Broker(format!(
                        "failed to create topic '{name}': {code}"
                    )));
                }
            }
        }
        self.created.insert(topic.to_string());
        Ok(())
    }

    fn build_headers(message: &Message) -> OwnedHeaders {
        let mut headers = OwnedHeaders::new()
            .insert(Header {
                key: "message_id",
                value: Some(message.id.as_bytes()),
            })
            .insert(Header {
                key: "timestamp",
                value: Some(message.timestamp.to_rfc3339().as_bytes()),
            });

        if let Some(ref correlation_id) = message.correlation_id {
            headers = headers.insert(Header {
                key: "correlation_id",
                value: Some(correlation_id.as_bytes()),
            });
        }

        for (key, value) in &message.headers {
            headers = headers.insert(Header {
                key,
                value: Some(value.as_bytes()),
            });
        }

        headers
    }

    /// Assign a broadcast consumer to the current end of every partition.
    async fn assign_at_end(consumer: Arc<StreamConsumer>, topic: String) -> Result<(), TransportError> {
        tokio::task::spawn_blocking(move || {
            let metadata = consumer
                .fetch_metadata(Some(&topic), METADATA_TIMEOUT)
                .map_err(subscribe_error)?;

            let mut assignment = TopicPartitionList::new();
            for partition in metadata
                .topics()
                .iter()
                .filter(|t| t.name() == topic)
                .flat_map(|t| t.partitions())
            {
                let (_, high) = consumer
                    .fetch_watermarks(&topic, partition.id(), METADATA_TIMEOUT)
                    .map_err(subscribe_error)?;
                assignment
                    .add_partition_offset(&topic, partition.id(), Offset::Offset(high))
                    .map_err(subscribe_error)?;
            }

            if assignment.count() == 0 {
                // Unknown topic: let the broker assign it once it exists.
                consumer.subscribe(&[topic.as_str()]).map_err(subscribe_error)
            } else {
                consumer.assign(&assignment).map_err(subscribe_error)
            }
        })
        .await
        .map_err(|e| TransportError::Subscribe(e.to_string()))?
    }
}

#[async_trait]
impl PubSub for KafkaPubSub {
    async fn publish(&self, topic: &str, message: Message) -> Result<(), TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Closed("Kafka client is closed".into()));
        }
        self.ensure_topic(topic).await?;

        let headers = Self::build_headers(&message);
        let record = FutureRecord::to(topic)
            .key(message.id.as_str())
            .payload(&message.payload)
            .headers(headers);

        debug!(topic = topic, message_id = %message.id, "Publishing message to Kafka");

        self.producer
            .send(record, self.config.publish_timeout())
            .await
            .map_err(|(e, _)| TransportError::Publish(e.to_string()))?;

        Ok(())
    }

    async fn subscribe(
        &self,
        ctx: &Context,
        topic: &str,
        options: SubscribeOptions,
    ) -> Result<DeliveryStream, TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Closed("Kafka client is closed".into()));
        }
        self.ensure_topic(topic).await?;

        let (group_id, offset_reset) = match options.mode {
            DeliveryMode::Competing => (
                options.group.clone().unwrap_or_else(|| self.config.group_id.clone()),
                self.config.auto_offset_reset.as_str(),
            ),
            DeliveryMode::Broadcast => (format!("courier-{}", uuid::Uuid::new_v4()), "latest"),
        };

        let consumer: StreamConsumer = self
            .consumer_config(&group_id, offset_reset)
            .create()
            .map_err(subscribe_error)?;
        let consumer = Arc::new(consumer);

        match options.mode {
            DeliveryMode::Competing => consumer.subscribe(&[topic]).map_err(subscribe_error)?,
            DeliveryMode::Broadcast => Self::assign_at_end(Arc::clone(&consumer), topic.to_string()).await?,
        }

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.pumps.spawn(pump(
            consumer,
            topic.to_string(),
            options.mode,
            tx,
            ctx.clone(),
            self.shutdown.clone(),
        ));

        info!(topic = topic, group_id = %group_id, mode = ?options.mode, "Subscribed to Kafka topic");
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn close(&self) -> Result<(), TransportError> {
        info!("Closing Kafka connections");
        self.shutdown.cancel();
        self.pumps.close();
        self.pumps.wait().await;

        let producer = self.producer.clone();
        let timeout = self.config.publish_timeout();
        tokio::task::spawn_blocking(move || producer.flush(timeout))
            .await
            .map_err(|e| TransportError::Broker(e.to_string()))?
            .map_err(|e| TransportError::Broker(e.to_string()))
    }

    fn backend(&self) -> &'static str {
        "kafka"
    }
}

/// Forward consumed records into the subscription's channel.
async fn pump(
    consumer: Arc<StreamConsumer>,
    topic: String,
    mode: DeliveryMode,
    tx: mpsc::Sender<Result<Delivery, TransportError>>,
    ctx: Context,
    shutdown: CancellationToken,
) {
    loop {
        let item = {
            let received = tokio::select! {
                biased;
                _ = ctx.done() => break,
                _ = shutdown.cancelled() => break,
                _ = tx.closed() => break,
                received = consumer.recv() => received,
            };
            match received {
                Ok(record) => {
                    let message = to_message(&record);
                    match mode {
                        DeliveryMode::Competing => Ok(Delivery::new(
                            topic.clone(),
                            message,
                            Box::new(KafkaAcker {
                                consumer: Arc::clone(&consumer),
                                topic: record.topic().to_string(),
                                partition: record.partition(),
                                offset: record.offset(),
                            }),
                        )),
                        DeliveryMode::Broadcast => Ok(Delivery::unacknowledged(topic.clone(), message)),
                    }
                }
                Err(e) => {
                    error!(topic = %topic, error = %e, "Kafka consumer error");
                    Err(TransportError::Broker(e.to_string()))
                }
            }
        };

        if tx.send(item).await.is_err() {
            break;
        }
    }
    debug!(topic = %topic, "Kafka consumer stopped");
}

fn to_message<M: KafkaMessage>(record: &M) -> Message {
    let payload = record.payload().map(|p| p.to_vec()).unwrap_or_default();

    let mut headers = HashMap::new();
    let mut message_id = None;
    let mut correlation_id = None;
    let mut timestamp = None;

    if let Some(record_headers) = record.headers() {
        for header in record_headers.iter() {
            let Some(value) = header.value else { continue };
            let value = String::from_utf8_lossy(value).to_string();
            match header.key {
                "message_id" => message_id = Some(value),
                "correlation_id" => correlation_id = Some(value),
                "timestamp" => {
                    timestamp = DateTime::parse_from_rfc3339(&value)
                        .ok()
                        .map(|ts| ts.with_timezone(&Utc));
                }
                _ => {
                    headers.insert(header.key.to_string(), value);
                }
            }
        }
    }

    let timestamp = timestamp
        .or_else(|| record.timestamp().to_millis().and_then(DateTime::from_timestamp_millis))
        .unwrap_or_else(Utc::now);

    let mut message = Message::new(payload).with_timestamp(timestamp);
    if let Some(id) = message_id {
        message = message.with_id(id);
    }
    message.correlation_id = correlation_id;
    message.headers = headers;
    message
}

/// Commits the record's offset on ack.
struct KafkaAcker {
    consumer: Arc<StreamConsumer>,
    topic: String,
    partition: i32,
    offset: i64,
}

#[async_trait]
impl Acknowledger for KafkaAcker {
    async fn ack(&mut self, _message: &Message) -> Result<(), TransportError> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(&self.topic, self.partition, Offset::Offset(self.offset + 1))
            .map_err(|e| TransportError::Acknowledge(e.to_string()))?;
        self.consumer
            .commit(&offsets, CommitMode::Async)
            .map_err(|e| TransportError::Acknowledge(e.to_string()))
    }

    async fn nack(&mut self, message: &Message) -> Result<(), TransportError> {
        warn!(
            topic = %self.topic,
            partition = self.partition,
            offset = self.offset,
            message_id = %message.id,
            "Kafka has no per-message redelivery, offset left uncommitted"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::message::OwnedMessage;
    use rdkafka::Timestamp;

    #[test]
    fn headers_carry_the_envelope_metadata() {
        let message = Message::new(b"{}".to_vec())
            .with_correlation_id("req-1")
            .with_header("courier-error", "boom");
        let headers = KafkaPubSub::build_headers(&message);

        let record = OwnedMessage::new(
            Some(message.payload.clone()),
            None,
            "FindTicket_response".to_string(),
            Timestamp::NotAvailable,
            0,
            7,
            Some(headers),
        );
        let decoded = to_message(&record);

        assert_eq!(decoded.id, message.id);
        assert_eq!(decoded.correlation_id.as_deref(), Some("req-1"));
        assert_eq!(decoded.header("courier-error"), Some("boom"));
        assert_eq!(decoded.payload, message.payload);
        assert_eq!(decoded.timestamp.timestamp(), message.timestamp.timestamp());
    }

    #[test]
    fn record_without_headers_gets_a_fresh_id() {
        let record = OwnedMessage::new(
            Some(b"1".to_vec()),
            None,
            "ReserveTicket".to_string(),
            Timestamp::CreateTime(1_700_000_000_000),
            0,
            0,
            None,
        );
        let decoded = to_message(&record);

        assert!(!decoded.id.is_empty());
        assert!(decoded.correlation_id.is_none());
        assert_eq!(decoded.timestamp.timestamp_millis(), 1_700_000_000_000);
    }
}
