//! Command bus over a [`PubSub`] transport.

use crate::codec;
use crate::config::BusConfig;
use crate::supervisor::{self, Supervisor};
use async_trait::async_trait;
use courier_core::{
    validate_name, BusError, Command, CommandBus, CommandHandler, Context, Delivery, EnvelopeKind,
    HandlerRegistry, PubSub, SubscribeOptions, TransportError,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Command bus that publishes each command to the topic named after it.
///
/// `dispatch` returns once the broker accepted the command. Registering a
/// handler subscribes this bus to the command's topic; each received command
/// is handled on its own task, then acked on success or nacked on failure.
pub struct BrokerCommandBus<T, P: ?Sized> {
    pubsub: Arc<P>,
    handlers: HandlerRegistry<dyn CommandHandler<T>>,
    config: BusConfig,
    supervisor: Supervisor,
}

impl<T, P> BrokerCommandBus<T, P>
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
            handlers: HandlerRegistry::new(EnvelopeKind::Command),
            config,
            supervisor,
        }
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.handlers.contains(name)
    }

    /// Stop every subscription and wait for in-flight handlers to be dropped.
    pub async fn shutdown(&self) {
        info!(backend = self.pubsub.backend(), "shutting down command bus");
        self.supervisor.shutdown().await;
    }

    async fn start(&self, name: &str, handler: Arc<dyn CommandHandler<T>>) -> Result<(), BusError> {
        if self.supervisor.is_shutdown() {
            return Err(TransportError::Closed("command bus is shut down".into()).into());
        }

        let scope = self.supervisor.scope().clone();
        let stream = self
            .pubsub
            .subscribe(&scope.context(), name, SubscribeOptions::competing())
            .await?;

        let timeout = self.config.handler_timeout();
        let topic = name.to_string();
        let workers = scope.clone();
        scope.consume(name, stream, move |delivery| {
            let handler = Arc::clone(&handler);
            let ctx = workers.worker_context(timeout);
            let name = topic.clone();
            async move { handle_command(&name, &ctx, handler.as_ref(), delivery).await }
        });
        Ok(())
    }
}

async fn handle_command<T>(name: &str, ctx: &Context, handler: &dyn CommandHandler<T>, delivery: Delivery)
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    let command: Command<T> = match codec::decode(name, delivery.message()) {
        Ok(command) => command,
        Err(err) => {
            error!(command = %name, message_id = %delivery.id(), error = %err, "failed to decode command");
            supervisor::nack(delivery).await;
            return;
        }
    };

    match handler.handle(ctx, command).await {
        Ok(()) => {
            debug!(command = %name, message_id = %delivery.id(), "command handled");
            supervisor::ack(delivery).await;
        }
        Err(err) => {
            error!(command = %name, message_id = %delivery.id(), error = %err, "command handler failed");
            supervisor::nack(delivery).await;
        }
    }
}

#[async_trait]
impl<T, P> CommandBus<T> for BrokerCommandBus<T, P>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
    P: PubSub + ?Sized + 'static,
{
    async fn register_handler(
        &self,
        name: &str,
        handler: Arc<dyn CommandHandler<T>>,
    ) -> Result<(), BusError> {
        self.handlers.register(name, Arc::clone(&handler))?;
        if let Err(err) = self.start(name, handler).await {
            self.handlers.remove(name);
            error!(command = %name, error = %err, "failed to subscribe command handler");
            return Err(err);
        }
        info!(command = %name, backend = self.pubsub.backend(), "registered command handler");
        Ok(())
    }

    async fn dispatch(&self, ctx: &Context, command: Command<T>) -> Result<(), BusError> {
        let name = command.name();
        validate_name(name)?;
        if self.config.require_local_handler && !self.handlers.contains(name) {
            return Err(BusError::HandlerNotFound {
                kind: EnvelopeKind::Command,
                name: name.to_string(),
            });
        }
        if let Some(reason) = ctx.err() {
            return Err(reason.into());
        }

        let message = codec::encode(command.payload())?;
        let id = message.id.clone();
        self.pubsub.publish(name, message).await.map_err(|err| {
            error!(command = %name, message_id = %id, error = %err, "failed to publish command");
            BusError::from(err)
        })?;

        debug!(command = %name, message_id = %id, "command published");
        Ok(())
    }
}
