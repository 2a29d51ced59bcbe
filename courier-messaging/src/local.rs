//! In-process broker over bounded channels.
//!
//! Each subscription owns an mpsc queue. Broadcast subscribers all receive a
//! copy of every message. Competing subscribers take turns within their
//! group, and every group gets its own copy.

use crate::config::ChannelConfig;
use async_trait::async_trait;
use courier_core::{
    Acknowledger, Context, Delivery, DeliveryMode, DeliveryStream, Message, PubSub,
    SubscribeOptions, TransportError,
};
use dashmap::DashMap;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

type Sender = mpsc::Sender<Result<Delivery, TransportError>>;

struct Subscriber {
    id: u64,
    tx: Sender,
}

#[derive(Default)]
struct Group {
    members: Vec<Subscriber>,
    next: usize,
}

impl Group {
    fn take_turn(&mut self) -> Option<Sender> {
        if self.members.is_empty() {
            return None;
        }
        let index = self.next % self.members.len();
        self.next = self.next.wrapping_add(1);
        Some(self.members[index].tx.clone())
    }
}

#[derive(Default)]
struct Topic {
    broadcast: Vec<Subscriber>,
    /// Competing groups; `None` is the default group.
    groups: HashMap<Option<String>, Group>,
}

impl Topic {
    fn prune(&mut self) {
        self.broadcast.retain(|s| !s.tx.is_closed());
        for group in self.groups.values_mut() {
            group.members.retain(|s| !s.tx.is_closed());
        }
        self.groups.retain(|_, group| !group.members.is_empty());
    }

    fn len(&self) -> usize {
        self.broadcast.len() + self.groups.values().map(|g| g.members.len()).sum::<usize>()
    }

    /// Senders that should receive the next message.
    fn targets(&mut self) -> Vec<Sender> {
        self.prune();
        let mut targets: Vec<Sender> = self.broadcast.iter().map(|s| s.tx.clone()).collect();
        targets.extend(self.groups.values_mut().filter_map(Group::take_turn));
        targets
    }
}

/// In-process [`PubSub`] for tests, demos and single-binary deployments.
pub struct ChannelBroker {
    config: ChannelConfig,
    topics: DashMap<String, Topic>,
    next_id: AtomicU64,
    closed: AtomicBool,
    redeliveries: TaskTracker,
}

impl ChannelBroker {
    pub fn new() -> Self {
        Self::with_config(ChannelConfig::default())
    }

    pub fn with_config(config: ChannelConfig) -> Self {
        Self {
            config,
            topics: DashMap::new(),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            redeliveries: TaskTracker::new(),
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Live subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get_mut(topic)
            .map(|mut t| {
                t.prune();
                t.len()
            })
            .unwrap_or(0)
    }

    fn delivery(&self, topic: &str, message: Message, tx: Sender) -> Delivery {
        Delivery::new(
            topic,
            message,
            Box::new(ChannelAcker {
                topic: topic.to_string(),
                tx,
                attempt: 0,
                max_redeliveries: self.config.max_redeliveries,
                redeliveries: self.redeliveries.clone(),
            }),
        )
    }
}

impl Default for ChannelBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PubSub for ChannelBroker {
    async fn publish(&self, topic: &str, message: Message) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed("channel broker is closed".into()));
        }

        let targets = match self.topics.get_mut(topic) {
            Some(mut state) => state.targets(),
            None => Vec::new(),
        };

        if targets.is_empty() {
            debug!(topic = %topic, message_id = %message.id, "no subscribers, message dropped");
            return Ok(());
        }

        for tx in targets {
            let delivery = self.delivery(topic, message.clone(), tx.clone());
            if tx.send(Ok(delivery)).await.is_err() {
                debug!(topic = %topic, message_id = %message.id, "subscriber went away");
            }
        }
        debug!(topic = %topic, message_id = %message.id, "published message");
        Ok(())
    }

    async fn subscribe(
        &self,
        ctx: &Context,
        topic: &str,
        options: SubscribeOptions,
    ) -> Result<DeliveryStream, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed("channel broker is closed".into()));
        }

        let (tx, rx) = mpsc::channel(self.config.buffer_size);
        let subscriber = Subscriber {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            tx,
        };
        let id = subscriber.id;

        {
            let mut state = self.topics.entry(topic.to_string()).or_default();
            match options.mode {
                DeliveryMode::Broadcast => state.broadcast.push(subscriber),
                DeliveryMode::Competing => state
                    .groups
                    .entry(options.group.clone())
                    .or_default()
                    .members
                    .push(subscriber),
            }
        }
        info!(
            topic = %topic,
            subscriber = id,
            mode = ?options.mode,
            group = options.group.as_deref().unwrap_or("default"),
            "subscribed to channel topic"
        );

        let ctx = ctx.clone();
        let stream = ReceiverStream::new(rx).take_until(async move {
            ctx.done().await;
        });
        Ok(Box::pin(stream))
    }

    async fn close(&self) -> Result<(), TransportError> {
        info!("closing channel broker");
        self.closed.store(true, Ordering::SeqCst);
        self.topics.clear();
        self.redeliveries.close();
        self.redeliveries.wait().await;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "channel"
    }
}

/// Nack puts the message back on the same subscriber's queue.
struct ChannelAcker {
    topic: String,
    tx: Sender,
    attempt: u32,
    max_redeliveries: u32,
    redeliveries: TaskTracker,
}

#[async_trait]
impl Acknowledger for ChannelAcker {
    async fn ack(&mut self, _message: &Message) -> Result<(), TransportError> {
        Ok(())
    }

    async fn nack(&mut self, message: &Message) -> Result<(), TransportError> {
        if self.attempt >= self.max_redeliveries {
            error!(
                topic = %self.topic,
                message_id = %message.id,
                attempts = self.attempt + 1,
                "giving up on message after repeated failures"
            );
            return Ok(());
        }

        let redelivery = Delivery::new(
            self.topic.clone(),
            message.clone(),
            Box::new(ChannelAcker {
                topic: self.topic.clone(),
                tx: self.tx.clone(),
                attempt: self.attempt + 1,
                max_redeliveries: self.max_redeliveries,
                redeliveries: self.redeliveries.clone(),
            }),
        );
        warn!(
            topic = %self.topic,
            message_id = %message.id,
            attempt = self.attempt + 1,
            "redelivering nacked message"
        );

        // The subscriber's own loop drains this queue, so never block on it here.
        match self.tx.try_send(Ok(redelivery)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(item)) => {
                let tx = self.tx.clone();
                let topic = self.topic.clone();
                self.redeliveries.spawn(async move {
                    if let Err(returned) = tx.send(item).await {
                        debug!(topic = %topic, "subscriber went away before redelivery");
                        if let Ok(delivery) = returned.0 {
                            let _ = delivery.ack().await;
                        }
                    }
                });
                Ok(())
            }
            Err(TrySendError::Closed(item)) => {
                if let Ok(delivery) = item {
                    // Nobody left to redeliver to.
                    let _ = delivery.ack().await;
                }
                Err(TransportError::Closed(format!(
                    "subscriber of '{}' is gone",
                    self.topic
                )))
            }
        }
    }
}
