//! # Courier Messaging
//!
//! Broker-backed command, query and event buses for Courier.
//!
//! Every bus here is generic over a [`PubSub`](courier_core::PubSub) adapter:
//! - **Channel** - in-process broker over bounded channels, always available
//! - **Kafka** - Apache Kafka topics
//! - **Redis** - Redis streams with consumer groups
//!
//! ## Features
//!
//! - `kafka` - Apache Kafka support
//! - `redis` - Redis streams support
//! - `full` - All backends
//!
//! ## Example
//!
//! ```rust,ignore
//! use courier_core::*;
//! use courier_messaging::{BrokerQueryBus, ChannelBroker};
//! use std::sync::Arc;
//!
//! let broker = Arc::new(ChannelBroker::new());
//! let bus: BrokerQueryBus<u32, u32, _> = BrokerQueryBus::new(broker);
//! bus.register_handler(
//!     "Double",
//!     query_handler_fn(|_ctx, query: Query<u32>| async move {
//!         Ok::<_, HandlerError>(query.into_payload() * 2)
//!     }),
//! )
//! .await?;
//!
//! let doubled = bus.dispatch(&Context::background(), Query::new("Double", 21)).await?;
//! assert_eq!(doubled, 42);
//! ```

pub mod codec;
pub mod command_bus;
pub mod config;
pub mod correlator;
pub mod event_bus;
pub mod local;
pub mod query_bus;
pub mod supervisor;

#[cfg(feature = "kafka")]
pub mod kafka;

#[cfg(feature = "redis")]
pub mod redis_stream;

pub use command_bus::BrokerCommandBus;
pub use config::*;
pub use correlator::{Correlator, Waiter};
pub use event_bus::BrokerEventBus;
pub use local::ChannelBroker;
pub use query_bus::BrokerQueryBus;
pub use supervisor::{Supervisor, TaskScope};

#[cfg(feature = "kafka")]
pub use kafka::KafkaPubSub;

#[cfg(feature = "redis")]
pub use redis_stream::RedisStreamPubSub;
