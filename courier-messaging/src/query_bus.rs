//! Request/response query bus over a [`PubSub`] transport.

use crate::codec;
use crate::config::BusConfig;
use crate::correlator::Correlator;
use crate::supervisor::{self, Supervisor};
use async_trait::async_trait;
use courier_core::{
    response_topic, validate_name, BusError, Context, Delivery, EnvelopeKind, HandlerRegistry,
    PubSub, Query, QueryBus, QueryHandler, SubscribeOptions, TransportError,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Query bus that publishes each query on its name and waits for the reply
/// on `<name>_response`.
///
/// Replies are matched to callers by the request's message id, so any number
/// of concurrent queries may share a name. A handler error travels back as a
/// reply carrying the `courier-error` header and surfaces to the caller as
/// [`HandlerError::Remote`](courier_core::HandlerError::Remote).
pub struct BrokerQueryBus<T, R, P: ?Sized> {
    pubsub: Arc<P>,
    handlers: HandlerRegistry<dyn QueryHandler<T, R>>,
    correlator: Correlator<P>,
    config: BusConfig,
    supervisor: Supervisor,
    _result: PhantomData<fn() -> R>,
}

impl<T, R, P> BrokerQueryBus<T, R, P>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
    R: Serialize + DeserializeOwned + Send + Sync + 'static,
    P: PubSub + ?Sized + 'static,
{
    pub fn new(pubsub: Arc<P>) -> Self {
        Self::with_config(pubsub, BusConfig::default())
    }

    pub fn with_config(pubsub: Arc<P>, config: BusConfig) -> Self {
        let supervisor = Supervisor::new(config.max_in_flight);
        let correlator = Correlator::new(Arc::clone(&pubsub), supervisor.scope().clone());
        Self {
            pubsub,
            handlers: HandlerRegistry::new(EnvelopeKind::Query),
            correlator,
            config,
            supervisor,
            _result: PhantomData,
        }
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.handlers.contains(name)
    }

    /// Start listening for replies to `name` ahead of the first dispatch.
    pub async fn prepare(&self, name: &str) -> Result<(), BusError> {
        validate_name(name)?;
        self.correlator.listen(&response_topic(name)).await
    }

    /// Queries still waiting for their reply.
    pub fn pending(&self) -> usize {
        self.correlator.pending()
    }

    pub async fn shutdown(&self) {
        info!(backend = self.pubsub.backend(), "shutting down query bus");
        self.supervisor.shutdown().await;
    }

    async fn start(&self, name: &str, handler: Arc<dyn QueryHandler<T, R>>) -> Result<(), BusError> {
        if self.supervisor.is_shutdown() {
            return Err(TransportError::Closed("query bus is shut down".into()).into());
        }

        let scope = self.supervisor.scope().clone();
        let stream = self
            .pubsub
            .subscribe(&scope.context(), name, SubscribeOptions::competing())
            .await?;

        let timeout = self.config.handler_timeout();
        let topic = name.to_string();
        let pubsub = Arc::clone(&self.pubsub);
        let workers = scope.clone();
        scope.consume(name, stream, move |delivery| {
            let handler = Arc::clone(&handler);
            let pubsub = Arc::clone(&pubsub);
            let ctx = workers.worker_context(timeout);
            let name = topic.clone();
            async move { answer(&name, &ctx, handler.as_ref(), pubsub.as_ref(), delivery).await }
        });
        Ok(())
    }
}

/// Run the handler for one request and publish its reply.
async fn answer<T, R, P>(
    name: &str,
    ctx: &Context,
    handler: &dyn QueryHandler<T, R>,
    pubsub: &P,
    delivery: Delivery,
) where
    T: DeserializeOwned + Send + Sync + 'static,
    R: Serialize + Send + Sync + 'static,
    P: PubSub + ?Sized,
{
    let query: Query<T> = match codec::decode(name, delivery.message()) {
        Ok(query) => query,
        Err(err) => {
            error!(query = %name, message_id = %delivery.id(), error = %err, "failed to decode query");
            supervisor::nack(delivery).await;
            return;
        }
    };

    let outcome = handler.handle(ctx, query).await;
    if let Err(err) = &outcome {
        warn!(query = %name, message_id = %delivery.id(), error = %err, "query handler failed");
    }

    let reply = match codec::reply(delivery.message(), &outcome) {
        Ok(reply) => reply,
        Err(err) => {
            error!(query = %name, message_id = %delivery.id(), error = %err, "failed to encode query result");
            supervisor::nack(delivery).await;
            return;
        }
    };

    if let Err(err) = pubsub.publish(&response_topic(name), reply).await {
        error!(query = %name, message_id = %delivery.id(), error = %err, "failed to publish query reply");
        supervisor::nack(delivery).await;
        return;
    }

    // An error reply settles the request too.
    debug!(query = %name, message_id = %delivery.id(), success = outcome.is_ok(), "query answered");
    supervisor::ack(delivery).await;
}

#[async_trait]
impl<T, R, P> QueryBus<T, R> for BrokerQueryBus<T, R, P>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
    R: Serialize + DeserializeOwned + Send + Sync + 'static,
    P: PubSub + ?Sized + 'static,
{
    async fn register_handler(
        &self,
        name: &str,
        handler: Arc<dyn QueryHandler<T, R>>,
    ) -> Result<(), BusError> {
        self.handlers.register(name, Arc::clone(&handler))?;
        if let Err(err) = self.start(name, handler).await {
            self.handlers.remove(name);
            error!(query = %name, error = %err, "failed to subscribe query handler");
            return Err(err);
        }
        info!(query = %name, backend = self.pubsub.backend(), "registered query handler");
        Ok(())
    }

    async fn dispatch(&self, ctx: &Context, query: Query<T>) -> Result<R, BusError> {
        let name = query.name();
        validate_name(name)?;
        if self.config.require_local_handler && !self.handlers.contains(name) {
            return Err(BusError::HandlerNotFound {
                kind: EnvelopeKind::Query,
                name: name.to_string(),
            });
        }
        if let Some(reason) = ctx.err() {
            return Err(reason.into());
        }

        self.correlator.listen(&response_topic(name)).await?;

        let request = codec::encode(query.payload())?;
        let mut waiter = self.correlator.expect(request.id.clone());
        self.pubsub.publish(name, request).await.map_err(|err| {
            error!(query = %name, message_id = %waiter.id(), error = %err, "failed to publish query");
            BusError::from(err)
        })?;
        debug!(query = %name, message_id = %waiter.id(), "query published, waiting for reply");

        let reply = tokio::select! {
            biased;
            reason = ctx.done() => {
                debug!(query = %name, message_id = %waiter.id(), error = %reason, "stopped waiting for query reply");
                return Err(reason.into());
            }
            reply = waiter.recv() => reply?,
        };

        codec::read_reply(&reply)
    }
}
