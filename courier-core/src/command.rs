//! In-process command bus.

use crate::bus::CommandBus;
use crate::context::Context;
use crate::envelope::{Command, EnvelopeKind};
use crate::error::BusError;
use crate::handler::CommandHandler;
use crate::registry::HandlerRegistry;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error};

/// Command bus that runs the handler on the caller's task.
pub struct InProcessCommandBus<T> {
    handlers: HandlerRegistry<dyn CommandHandler<T>>,
}

impl<T: Send + 'static> InProcessCommandBus<T> {
    /// Create new command bus
    pub fn new() -> Self {
        Self {
            handlers: HandlerRegistry::new(EnvelopeKind::Command),
        }
    }

    /// Register a command handler
    pub fn register(
        &self,
        name: &str,
        handler: Arc<dyn CommandHandler<T>>,
    ) -> Result<(), BusError> {
        self.handlers.register(name, handler)?;
        debug!(command = %name, "registered command handler");
        Ok(())
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.handlers.contains(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.handlers.names()
    }

    /// Execute a command.
    ///
    /// The handler runs even if `ctx` is already done; handlers are expected
    /// to check the context themselves.
    pub async fn execute(&self, ctx: &Context, command: Command<T>) -> Result<(), BusError> {
        let handler = self.handlers.get(command.name())?;
        let name = command.name().to_string();

        handler.handle(ctx, command).await.map_err(|err| {
            error!(command = %name, error = %err, "command handler failed");
            BusError::from(err)
        })
    }
}

impl<T: Send + 'static> Default for InProcessCommandBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> CommandBus<T> for InProcessCommandBus<T> {
    async fn register_handler(
        &self,
        name: &str,
        handler: Arc<dyn CommandHandler<T>>,
    ) -> Result<(), BusError> {
        self.register(name, handler)
    }

    async fn dispatch(&self, ctx: &Context, command: Command<T>) -> Result<(), BusError> {
        self.execute(ctx, command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use crate::handler::command_handler_fn;
    use dashmap::DashMap;

    #[derive(Debug, Clone)]
    struct Reserve {
        passenger: String,
        seat: u32,
    }

    #[tokio::test]
    async fn unknown_command_is_not_found() {
        let bus: InProcessCommandBus<Reserve> = InProcessCommandBus::new();
        let err = bus
            .dispatch(
                &Context::background(),
                Command::new(
                    "ReserveTicket",
                    Reserve {
                        passenger: "John Doe".into(),
                        seat: 12,
                    },
                ),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BusError::HandlerNotFound { kind: EnvelopeKind::Command, .. }
        ));
    }

    #[tokio::test]
    async fn handler_runs_and_error_is_returned_verbatim() {
        let store: Arc<DashMap<String, u32>> = Arc::new(DashMap::new());
        let bus: InProcessCommandBus<Reserve> = InProcessCommandBus::new();

        let writer = store.clone();
        bus.register_handler(
            "ReserveTicket",
            command_handler_fn(move |_ctx, command: Command<Reserve>| {
                let writer = writer.clone();
                async move {
                    let reserve = command.into_payload();
                    if reserve.seat == 0 {
                        return Err(HandlerError::Validation("seat must be positive".into()));
                    }
                    writer.insert(reserve.passenger, reserve.seat);
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();

        let ctx = Context::background();
        bus.dispatch(
            &ctx,
            Command::new(
                "ReserveTicket",
                Reserve {
                    passenger: "John Doe".into(),
                    seat: 12,
                },
            ),
        )
        .await
        .unwrap();
        assert_eq!(store.get("John Doe").map(|seat| *seat), Some(12));

        let err = bus
            .dispatch(
                &ctx,
                Command::new(
                    "ReserveTicket",
                    Reserve {
                        passenger: "Jane Roe".into(),
                        seat: 0,
                    },
                ),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Handler(HandlerError::Validation(_))));
    }

    #[tokio::test]
    async fn handler_still_runs_under_cancelled_context() {
        let bus: InProcessCommandBus<Reserve> = InProcessCommandBus::new();
        bus.register(
            "ReserveTicket",
            command_handler_fn(|ctx: Context, _command: Command<Reserve>| async move {
                match ctx.err() {
                    Some(reason) => Err(HandlerError::from(reason)),
                    None => Ok(()),
                }
            }),
        )
        .unwrap();

        let ctx = Context::background();
        ctx.cancel();
        let err = bus
            .execute(
                &ctx,
                Command::new(
                    "ReserveTicket",
                    Reserve {
                        passenger: "John Doe".into(),
                        seat: 12,
                    },
                ),
            )
            .await
            .unwrap_err();
        assert!(err.is_cancellation());
    }

    #[tokio::test]
    async fn second_registration_is_rejected() {
        let bus: InProcessCommandBus<Reserve> = InProcessCommandBus::new();
        let noop = || command_handler_fn(|_ctx, _c: Command<Reserve>| async { Ok::<(), HandlerError>(()) });

        bus.register("ReserveTicket", noop()).unwrap();
        assert!(matches!(
            bus.register("ReserveTicket", noop()),
            Err(BusError::DuplicateHandler { .. })
        ));
        assert!(bus.has_handler("ReserveTicket"));
    }
}
