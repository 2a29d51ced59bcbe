//! Matches query replies to the callers waiting for them.
//!
//! Replies for a query name all arrive on one response topic. The correlator
//! keeps a single broadcast subscription per response topic and routes each
//! reply by its correlation id, so concurrent callers of the same query never
//! see each other's results.

use crate::supervisor::TaskScope;
use courier_core::{BusError, Delivery, Message, PubSub, SubscribeOptions, TransportError};
use dashmap::DashMap;
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

type Waiters = Arc<DashMap<String, oneshot::Sender<Message>>>;

pub struct Correlator<P: ?Sized> {
    pubsub: Arc<P>,
    scope: TaskScope,
    waiters: Waiters,
    listening: Arc<Mutex<HashSet<String>>>,
}

impl<P: PubSub + ?Sized + 'static> Correlator<P> {
    pub fn new(pubsub: Arc<P>, scope: TaskScope) -> Self {
        Self {
            pubsub,
            scope,
            waiters: Arc::new(DashMap::new()),
            listening: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Make sure replies published on `topic` are being collected.
    ///
    /// Subscribes on first use; later calls return immediately.
    pub async fn listen(&self, topic: &str) -> Result<(), BusError> {
        let mut listening = self.listening.lock().await;
        if listening.contains(topic) {
            return Ok(());
        }

        let stream = self
            .pubsub
            .subscribe(&self.scope.context(), topic, SubscribeOptions::broadcast())
            .await?;
        listening.insert(topic.to_string());
        info!(topic = %topic, "listening for query replies");

        let waiters = Arc::clone(&self.waiters);
        let registered = Arc::clone(&self.listening);
        let topic = topic.to_string();
        self.scope.spawn(async move {
            let mut stream = stream;
            while let Some(next) = stream.next().await {
                match next {
                    Ok(delivery) => route(&waiters, delivery).await,
                    Err(err) => warn!(topic = %topic, error = %err, "reply subscription error"),
                }
            }
            // Forget the topic so the next caller subscribes again.
            registered.lock().await.remove(&topic);
            debug!(topic = %topic, "reply listener stopped");
        });
        Ok(())
    }

    /// Register interest in the reply to the request `id`.
    ///
    /// Must be called before the request is published.
    pub fn expect(&self, id: impl Into<String>) -> Waiter {
        let id = id.into();
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(id.clone(), tx);
        Waiter {
            id,
            rx,
            waiters: Arc::clone(&self.waiters),
        }
    }

    /// Requests still waiting for a reply.
    pub fn pending(&self) -> usize {
        self.waiters.len()
    }
}

async fn route(waiters: &Waiters, delivery: Delivery) {
    let waiter = delivery
        .message()
        .correlation_id
        .as_deref()
        .and_then(|id| waiters.remove(id))
        .map(|(_, tx)| tx);

    match waiter {
        Some(tx) => {
            if tx.send(delivery.message().clone()).is_err() {
                debug!(message_id = %delivery.id(), "caller stopped waiting for reply");
            }
        }
        None => debug!(
            topic = %delivery.topic(),
            correlation_id = ?delivery.message().correlation_id,
            "reply has no local waiter"
        ),
    }

    if let Err(err) = delivery.ack().await {
        warn!(error = %err, "failed to ack query reply");
    }
}

/// A pending reply. Dropping it withdraws the registration.
pub struct Waiter {
    id: String,
    rx: oneshot::Receiver<Message>,
    waiters: Waiters,
}

impl Waiter {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the reply.
    pub async fn recv(&mut self) -> Result<Message, BusError> {
        (&mut self.rx).await.map_err(|_| {
            BusError::Transport(TransportError::Closed(
                "reply listener stopped before the reply arrived".into(),
            ))
        })
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.waiters.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::ChannelBroker;
    use crate::supervisor::Supervisor;
    use std::time::Duration;

    #[tokio::test]
    async fn routes_replies_by_correlation_id() {
        let broker = Arc::new(ChannelBroker::new());
        let supervisor = Supervisor::new(8);
        let correlator = Correlator::new(Arc::clone(&broker), supervisor.scope().clone());

        correlator.listen("FindTicket_response").await.unwrap();
        correlator.listen("FindTicket_response").await.unwrap();
        assert_eq!(broker.subscriber_count("FindTicket_response"), 1);

        let mut first = correlator.expect("req-1");
        let mut second = correlator.expect("req-2");
        assert_eq!(correlator.pending(), 2);

        broker
            .publish("FindTicket_response", Message::new(b"\"two\"".to_vec()).with_correlation_id("req-2"))
            .await
            .unwrap();
        broker
            .publish("FindTicket_response", Message::new(b"\"one\"".to_vec()).with_correlation_id("req-1"))
            .await
            .unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(1), second.recv()).await.unwrap().unwrap();
        assert_eq!(reply.payload, b"\"two\"");
        let reply = tokio::time::timeout(Duration::from_secs(1), first.recv()).await.unwrap().unwrap();
        assert_eq!(reply.payload, b"\"one\"");
        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test]
    async fn dropped_waiter_is_forgotten() {
        let broker = Arc::new(ChannelBroker::new());
        let supervisor = Supervisor::new(8);
        let correlator = Correlator::new(broker, supervisor.scope().clone());

        let waiter = correlator.expect("req-1");
        assert_eq!(waiter.id(), "req-1");
        assert_eq!(correlator.pending(), 1);
        drop(waiter);
        assert_eq!(correlator.pending(), 0);
    }
}
