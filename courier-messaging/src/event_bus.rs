//! Event bus over a [`PubSub`] transport.

use crate::codec;
use crate::config::BusConfig;
use crate::supervisor::{self, Supervisor};
use async_trait::async_trait;
use courier_core::{
    validate_name, BusError, Context, Delivery, Event, EventBus, EventHandler, FanOut, FanOutMode,
    HandlerList, PubSub, SubscribeOptions, TransportError,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// Event bus that publishes each event to the topic named after it.
///
/// The first handler registered for a name subscribes the bus to that topic.
/// Every received event is fanned out to all handlers registered at that
/// moment; the delivery is acked when they all succeed and nacked otherwise.
///
/// Each bus receives every event unless [`BusConfig::event_group`] is set,
/// in which case the buses of that group take turns.
pub struct BrokerEventBus<T, P: ?Sized> {
    pubsub: Arc<P>,
    handlers: Arc<HandlerList<dyn EventHandler<T>>>,
    subscribed: Mutex<HashSet<String>>,
    config: BusConfig,
    mode: FanOutMode,
    supervisor: Supervisor,
}

impl<T, P> BrokerEventBus<T, P>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
    P: PubSub + ?Sized + 'static,
{
    pub fn new(pubsub: Arc<P>) -> Self {
        Self::with_config(pubsub, BusConfig::default())
    }

    pub fn with_config(pubsub: Arc<P>, config: BusConfig) -> Self {
        let supervisor = Supervisor::new(config.max_in_flight);
        Self {
            pubsub,
            handlers: Arc::new(HandlerList::new()),
            subscribed: Mutex::new(HashSet::new()),
            config,
            mode: FanOutMode::default(),
            supervisor,
        }
    }

    /// Choose how the handlers of one event are scheduled.
    pub fn with_fan_out(mut self, mode: FanOutMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn handler_count(&self, name: &str) -> usize {
        self.handlers.handler_count(name)
    }

    pub async fn shutdown(&self) {
        info!(backend = self.pubsub.backend(), "shutting down event bus");
        self.supervisor.shutdown().await;
    }

    async fn start(&self, name: &str) -> Result<(), BusError> {
        if self.supervisor.is_shutdown() {
            return Err(TransportError::Closed("event bus is shut down".into()).into());
        }

        let options = match self.config.event_group {
            Some(ref group) => SubscribeOptions::competing().in_group(group.clone()),
            None => SubscribeOptions::broadcast(),
        };
        let scope = self.supervisor.scope().clone();
        let stream = self.pubsub.subscribe(&scope.context(), name, options).await?;

        let timeout = self.config.handler_timeout();
        let mode = self.mode;
        let topic = name.to_string();
        let handlers = Arc::clone(&self.handlers);
        let workers = scope.clone();
        scope.consume(name, stream, move |delivery| {
            let handlers = handlers.snapshot(&topic);
            let ctx = workers.worker_context(timeout);
            let name = topic.clone();
            async move { deliver(&name, &ctx, FanOut::new(mode, handlers), delivery).await }
        });
        Ok(())
    }
}

async fn deliver<T>(name: &str, ctx: &Context, fan_out: FanOut<T>, delivery: Delivery)
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    let event: Event<T> = match codec::decode(name, delivery.message()) {
        Ok(event) => event,
        Err(err) => {
            error!(event = %name, message_id = %delivery.id(), error = %err, "failed to decode event");
            supervisor::nack(delivery).await;
            return;
        }
    };

    match fan_out.run(ctx, Arc::new(event)).await {
        Ok(()) => {
            debug!(event = %name, message_id = %delivery.id(), "event handled");
            supervisor::ack(delivery).await;
        }
        Err(err) => {
            error!(event = %name, message_id = %delivery.id(), error = %err, "event handling failed");
            supervisor::nack(delivery).await;
        }
    }
}

#[async_trait]
impl<T, P> EventBus<T> for BrokerEventBus<T, P>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
    P: PubSub + ?Sized + 'static,
{
    async fn register_handler(
        &self,
        name: &str,
        handler: Arc<dyn EventHandler<T>>,
    ) -> Result<(), BusError> {
        let count = self.handlers.append(name, Arc::clone(&handler))?;

        let mut subscribed = self.subscribed.lock().await;
        if !subscribed.contains(name) {
            if let Err(err) = self.start(name).await {
                self.handlers.remove_handler(name, &handler);
                error!(event = %name, error = %err, "failed to subscribe event handlers");
                return Err(err);
            }
            subscribed.insert(name.to_string());
            info!(event = %name, backend = self.pubsub.backend(), "subscribed to event");
        }
        debug!(event = %name, handlers = count, "registered event handler");
        Ok(())
    }

    async fn publish(&self, ctx: &Context, event: Event<T>) -> Result<(), BusError> {
        let name = event.name();
        validate_name(name)?;
        if let Some(reason) = ctx.err() {
            return Err(reason.into());
        }

        let message = codec::encode(event.payload())?;
        let id = message.id.clone();
        self.pubsub.publish(name, message).await.map_err(|err| {
            error!(event = %name, message_id = %id, error = %err, "failed to publish event");
            BusError::from(err)
        })?;

        debug!(event = %name, message_id = %id, "event published");
        Ok(())
    }
}
