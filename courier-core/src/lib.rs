//! # Courier Core
//!
//! Command, query and event buses for Courier.
//!
//! ## Features
//!
//! - **Command Bus** - one handler per name, write intents
//! - **Query Bus** - one handler per name, request/response
//! - **Event Bus** - any number of handlers per name, concurrent fan-out
//!   with every handler failure aggregated into one error
//! - **Context** - cooperative cancellation and deadlines for every dispatch
//! - **Transport port** - the [`PubSub`] trait implemented by broker adapters
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use courier_core::*;
//!
//! let bus: InProcessQueryBus<u32, u32> = InProcessQueryBus::new();
//! bus.register(
//!     "Double",
//!     query_handler_fn(|_ctx, query: Query<u32>| async move {
//!         Ok::<_, HandlerError>(query.into_payload() * 2)
//!     }),
//! )?;
//!
//! let doubled = bus.dispatch(&Context::background(), Query::new("Double", 21)).await?;
//! assert_eq!(doubled, 42);
//! ```

pub mod aggregate;
pub mod bus;
pub mod command;
pub mod context;
pub mod envelope;
pub mod error;
pub mod event;
pub mod handler;
pub mod port;
pub mod query;
pub mod registry;

pub use aggregate::{AggregateError, FanOut, FanOutMode};
pub use bus::{CommandBus, EventBus, QueryBus};
pub use command::InProcessCommandBus;
pub use context::Context;
pub use envelope::{
    response_topic, validate_name, Command, Envelope, EnvelopeKind, Event, Query,
    RESPONSE_SUFFIX,
};
pub use error::{BoxError, BusError, BusResult, CancellationError, HandlerError, TransportError};
pub use event::{EventBusBuilder, EventBusConfig, InProcessEventBus};
pub use handler::{
    command_handler_fn, event_handler_fn, query_handler_fn, CommandHandler, EventHandler,
    FnHandler, QueryHandler,
};
pub use port::{
    Acknowledger, Delivery, DeliveryMode, DeliveryStream, Message, PubSub, SubscribeOptions,
    ERROR_HEADER,
};
pub use query::InProcessQueryBus;
pub use registry::{HandlerList, HandlerRegistry};
