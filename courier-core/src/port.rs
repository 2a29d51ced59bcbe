//! The publish/subscribe port every broker adapter implements.
//!
//! Buses only ever see [`Message`], [`Delivery`] and [`DeliveryMode`]; consumer
//! groups, offsets and stream ids stay inside the adapters.

use crate::context::Context;
use crate::error::TransportError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Header set on a query reply when the remote handler failed.
/// The header value is the handler's error message and the payload is empty.
pub const ERROR_HEADER: &str = "courier-error";

/// Wire message: an opaque id plus serialized bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: String,
    /// Serialized payload
    pub payload: Vec<u8>,
    /// Id of the request this message answers
    pub correlation_id: Option<String>,
    /// Message headers
    pub headers: HashMap<String, String>,
    /// Time the message was created
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Create a message with a fresh UUID v4 id.
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            payload,
            correlation_id: None,
            headers: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Create a message carrying `value` encoded as JSON.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::to_vec(value)?))
    }

    /// Decode the JSON payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

/// Settles one delivered message with its broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Confirm that the message was processed.
    async fn ack(&mut self, message: &Message) -> Result<(), TransportError>;

    /// Report a processing failure. Redelivers where the broker supports it.
    async fn nack(&mut self, message: &Message) -> Result<(), TransportError>;
}

/// A message received from a subscription, waiting to be settled.
pub struct Delivery {
    topic: String,
    message: Message,
    acker: Option<Box<dyn Acknowledger>>,
}

impl Delivery {
    pub fn new(topic: impl Into<String>, message: Message, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            topic: topic.into(),
            message,
            acker: Some(acker),
        }
    }

    /// A delivery the broker does not expect to be settled.
    pub fn unacknowledged(topic: impl Into<String>, message: Message) -> Self {
        Self {
            topic: topic.into(),
            message,
            acker: None,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn id(&self) -> &str {
        &self.message.id
    }

    pub async fn ack(mut self) -> Result<(), TransportError> {
        match self.acker.take() {
            Some(mut acker) => acker.ack(&self.message).await,
            None => Ok(()),
        }
    }

    pub async fn nack(mut self) -> Result<(), TransportError> {
        match self.acker.take() {
            Some(mut acker) => acker.nack(&self.message).await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("topic", &self.topic)
            .field("message", &self.message)
            .field("settled", &self.acker.is_none())
            .finish()
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if self.acker.is_some() {
            warn!(
                topic = %self.topic,
                message_id = %self.message.id,
                "delivery dropped without ack or nack"
            );
        }
    }
}

/// Stream of deliveries for one subscription.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, TransportError>> + Send>>;

/// Who receives a message published to a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Exactly one subscriber of the consumer group gets each message
    #[default]
    Competing,
    /// Every subscriber gets every message
    Broadcast,
}

/// Subscription options.
///
/// Competing subscriptions in the same group share the messages of a topic,
/// and each group receives its own copy of every message. Without a group the
/// transport's configured default group is used. Broadcast ignores the group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub mode: DeliveryMode,
    pub group: Option<String>,
}

impl SubscribeOptions {
    pub fn competing() -> Self {
        Self {
            mode: DeliveryMode::Competing,
            group: None,
        }
    }

    pub fn broadcast() -> Self {
        Self {
            mode: DeliveryMode::Broadcast,
            group: None,
        }
    }

    /// Compete inside `group` rather than the default one.
    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }
}

/// Transport port shared by every broker-backed bus.
///
/// Implementations must allow concurrent `publish` calls from many tasks.
/// A subscription stream ends when its context is done or it is dropped.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Publish a message to a topic.
    async fn publish(&self, topic: &str, message: Message) -> Result<(), TransportError>;

    /// Start receiving messages published to `topic`.
    async fn subscribe(
        &self,
        ctx: &Context,
        topic: &str,
        options: SubscribeOptions,
    ) -> Result<DeliveryStream, TransportError>;

    /// Close the broker connection gracefully.
    async fn close(&self) -> Result<(), TransportError>;

    /// Short backend name for logs.
    fn backend(&self) -> &'static str;
}

#[async_trait]
impl<P: PubSub + ?Sized> PubSub for Arc<P> {
    async fn publish(&self, topic: &str, message: Message) -> Result<(), TransportError> {
        (**self).publish(topic, message).await
    }

    async fn subscribe(
        &self,
        ctx: &Context,
        topic: &str,
        options: SubscribeOptions,
    ) -> Result<DeliveryStream, TransportError> {
        (**self).subscribe(ctx, topic, options).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        (**self).close().await
    }

    fn backend(&self) -> &'static str {
        (**self).backend()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct Counting {
        acks: Arc<AtomicU32>,
        nacks: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Acknowledger for Counting {
        async fn ack(&mut self, _message: &Message) -> Result<(), TransportError> {
            self.acks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn nack(&mut self, _message: &Message) -> Result<(), TransportError> {
            self.nacks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    // Verify the port is object-safe
    fn _assert_object_safe(_: &dyn PubSub) {}

    #[test]
    fn json_message_round_trip() {
        let message = Message::json(&serde_json::json!({"passenger": "John Doe", "seat": 12}))
            .unwrap()
            .with_correlation_id("req-1")
            .with_header(ERROR_HEADER, "boom");

        let value: serde_json::Value = message.decode().unwrap();
        assert_eq!(value["seat"], 12);
        assert_eq!(message.correlation_id.as_deref(), Some("req-1"));
        assert_eq!(message.header(ERROR_HEADER), Some("boom"));
        assert!(Uuid::parse_str(&message.id).is_ok());
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(Message::new(vec![]).id, Message::new(vec![]).id);
    }

    #[tokio::test]
    async fn delivery_settles_once() {
        let acker = Counting::default();
        let (acks, nacks) = (acker.acks.clone(), acker.nacks.clone());

        let delivery = Delivery::new("ReserveTicket", Message::new(b"{}".to_vec()), Box::new(acker));
        assert_eq!(delivery.topic(), "ReserveTicket");
        delivery.nack().await.unwrap();

        assert_eq!(acks.load(Ordering::SeqCst), 0);
        assert_eq!(nacks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unacknowledged_delivery_is_a_no_op() {
        let delivery = Delivery::unacknowledged("TicketBooked", Message::new(vec![]));
        assert!(delivery.ack().await.is_ok());
    }

    #[test]
    fn default_mode_is_competing() {
        assert_eq!(SubscribeOptions::default().mode, DeliveryMode::Competing);
        assert_eq!(SubscribeOptions::broadcast().mode, DeliveryMode::Broadcast);
        assert!(SubscribeOptions::competing().group.is_none());
    }

    #[test]
    fn group_is_kept_with_the_mode() {
        let options = SubscribeOptions::competing().in_group("mailer");
        assert_eq!(options.mode, DeliveryMode::Competing);
        assert_eq!(options.group.as_deref(), Some("mailer"));
    }
}
