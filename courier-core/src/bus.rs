//! Bus contracts shared by the in-process and broker-backed implementations.

use crate::context::Context;
use crate::envelope::{Command, Event, Query};
use crate::error::BusError;
use crate::handler::{CommandHandler, EventHandler, QueryHandler};
use async_trait::async_trait;
use std::sync::Arc;

/// Routes each command to its single handler.
#[async_trait]
pub trait CommandBus<T>: Send + Sync {
    /// Bind `handler` to the command `name`.
    async fn register_handler(
        &self,
        name: &str,
        handler: Arc<dyn CommandHandler<T>>,
    ) -> Result<(), BusError>;

    /// Send a command to its handler.
    ///
    /// In-process buses return the handler's outcome. Broker-backed buses
    /// return once the command was accepted for delivery.
    async fn dispatch(&self, ctx: &Context, command: Command<T>) -> Result<(), BusError>;
}

/// Routes each query to its single handler and returns the result.
#[async_trait]
pub trait QueryBus<T, R>: Send + Sync {
    /// Bind `handler` to the query `name`.
    async fn register_handler(
        &self,
        name: &str,
        handler: Arc<dyn QueryHandler<T, R>>,
    ) -> Result<(), BusError>;

    /// Ask a query and wait for its result or for `ctx` to finish.
    async fn dispatch(&self, ctx: &Context, query: Query<T>) -> Result<R, BusError>;
}

/// Delivers each event to every handler registered for its name.
#[async_trait]
pub trait EventBus<T>: Send + Sync {
    /// Add `handler` to the handlers of the event `name`.
    async fn register_handler(
        &self,
        name: &str,
        handler: Arc<dyn EventHandler<T>>,
    ) -> Result<(), BusError>;

    /// Publish an event. Missing interest is not an error.
    async fn publish(&self, ctx: &Context, event: Event<T>) -> Result<(), BusError>;
}
