//! In-process query bus.

use crate::bus::QueryBus;
use crate::context::Context;
use crate::envelope::{EnvelopeKind, Query};
use crate::error::{BusError, HandlerError};
use crate::handler::QueryHandler;
use crate::registry::HandlerRegistry;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Query bus that answers queries within the caller's process.
pub struct InProcessQueryBus<T, R> {
    handlers: HandlerRegistry<dyn QueryHandler<T, R>>,
}

impl<T, R> InProcessQueryBus<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    /// Create new query bus
    pub fn new() -> Self {
        Self {
            handlers: HandlerRegistry::new(EnvelopeKind::Query),
        }
    }

    /// Register a query handler
    pub fn register(
        &self,
        name: &str,
        handler: Arc<dyn QueryHandler<T, R>>,
    ) -> Result<(), BusError> {
        self.handlers.register(name, handler)?;
        debug!(query = %name, "registered query handler");
        Ok(())
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.handlers.contains(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.handlers.names()
    }

    /// Execute a query.
    ///
    /// The handler runs on its own task and races `ctx`; when both are ready
    /// the context wins, so a query asked with an expired context always
    /// yields a cancellation error. A handler the caller stopped waiting for
    /// keeps running to completion.
    pub async fn execute(&self, ctx: &Context, query: Query<T>) -> Result<R, BusError> {
        let handler = self.handlers.get(query.name())?;
        let name = query.name().to_string();

        let task = {
            let ctx = ctx.clone();
            tokio::spawn(async move { handler.handle(&ctx, query).await })
        };

        let joined = tokio::select! {
            biased;
            reason = ctx.done() => {
                warn!(query = %name, error = %reason, "query abandoned, handler left running");
                return Err(reason.into());
            }
            joined = task => joined,
        };

        joined
            .unwrap_or_else(|join_err| {
                Err(HandlerError::Failed(format!("handler task panicked: {join_err}")))
            })
            .map_err(|err| {
                error!(query = %name, error = %err, "query handler failed");
                BusError::from(err)
            })
    }
}

impl<T, R> Default for InProcessQueryBus<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T, R> QueryBus<T, R> for InProcessQueryBus<T, R>
where
    T: Send + Sync + 'static,
    R: Send + 'static,
{
    async fn register_handler(
        &self,
        name: &str,
        handler: Arc<dyn QueryHandler<T, R>>,
    ) -> Result<(), BusError> {
        self.register(name, handler)
    }

    async fn dispatch(&self, ctx: &Context, query: Query<T>) -> Result<R, BusError> {
        self.execute(ctx, query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CancellationError;
    use crate::handler::query_handler_fn;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn doubling() -> Arc<dyn QueryHandler<u32, u32>> {
        query_handler_fn(|_ctx, query: Query<u32>| async move {
            Ok::<_, HandlerError>(query.into_payload() * 2)
        })
    }

    #[tokio::test]
    async fn returns_the_handler_result() {
        let bus: InProcessQueryBus<u32, u32> = InProcessQueryBus::new();
        bus.register_handler("Double", doubling()).await.unwrap();

        let result = bus
            .dispatch(&Context::background(), Query::new("Double", 21))
            .await
            .unwrap();
        assert_eq!(result, 42);
    }

    #[tokio::test]
    async fn unknown_query_is_not_found() {
        let bus: InProcessQueryBus<u32, u32> = InProcessQueryBus::new();
        let err = bus
            .dispatch(&Context::background(), Query::new("Double", 1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BusError::HandlerNotFound { kind: EnvelopeKind::Query, ref name } if name == "Double"
        ));
    }

    #[tokio::test]
    async fn expired_context_wins_over_a_ready_handler() {
        let bus: InProcessQueryBus<u32, u32> = InProcessQueryBus::new();
        bus.register("Double", doubling()).unwrap();

        let ctx = Context::background().with_timeout(Duration::ZERO);
        let err = bus.execute(&ctx, Query::new("Double", 21)).await.unwrap_err();
        assert!(matches!(
            err,
            BusError::Cancelled(CancellationError::DeadlineExceeded)
        ));

        let ctx = Context::background();
        ctx.cancel();
        let err = bus.execute(&ctx, Query::new("Double", 21)).await.unwrap_err();
        assert!(matches!(err, BusError::Cancelled(CancellationError::Cancelled)));
    }

    #[tokio::test]
    async fn slow_handler_outlives_the_caller() {
        let bus: InProcessQueryBus<u32, u32> = InProcessQueryBus::new();
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        bus.register(
            "Slow",
            query_handler_fn(move |_ctx, query: Query<u32>| {
                let flag = flag.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    flag.store(true, Ordering::SeqCst);
                    Ok::<_, HandlerError>(query.into_payload())
                }
            }),
        )
        .unwrap();

        let ctx = Context::background().with_timeout(Duration::from_millis(10));
        let err = bus.execute(&ctx, Query::new("Slow", 1)).await.unwrap_err();
        assert!(err.is_cancellation());
        assert!(!finished.load(Ordering::SeqCst));

        // Giving up on the answer does not stop the handler.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn panicking_handler_is_a_failure() {
        let bus: InProcessQueryBus<u32, u32> = InProcessQueryBus::new();
        bus.register(
            "Broken",
            query_handler_fn(|_ctx, _query: Query<u32>| async move {
                if true {
                    panic!("index out of range");
                }
                Ok::<u32, HandlerError>(0)
            }),
        )
        .unwrap();

        let err = bus
            .execute(&Context::background(), Query::new("Broken", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Handler(HandlerError::Failed(_))));
    }

    #[tokio::test]
    async fn handler_error_is_propagated() {
        let bus: InProcessQueryBus<String, String> = InProcessQueryBus::new();
        bus.register(
            "FindTicket",
            query_handler_fn(|_ctx, query: Query<String>| async move {
                Err::<String, _>(HandlerError::NotFound(query.into_payload()))
            }),
        )
        .unwrap();

        let err = bus
            .execute(&Context::background(), Query::new("FindTicket", "Nobody".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Handler(HandlerError::NotFound(ref who)) if who == "Nobody"));
    }
}
