// Courier - command, query and event buses for Rust
//
// The same bus contracts run in-process or over a publish/subscribe broker
// (local channels, Kafka, Redis streams).

// Re-export core functionality
pub use courier_core::*;

// Re-export broker-backed buses and adapters
pub use courier_messaging::{
    BrokerCommandBus, BrokerEventBus, BrokerQueryBus, BusConfig, ChannelBroker, ChannelConfig,
    KafkaConfig, RedisStreamConfig, Supervisor, TaskScope,
};

#[cfg(feature = "kafka")]
pub use courier_messaging::KafkaPubSub;

#[cfg(feature = "redis")]
pub use courier_messaging::RedisStreamPubSub;

pub use courier_messaging as messaging;

pub mod prelude {
    pub use crate::{
        BrokerCommandBus,
        BrokerEventBus,
        BrokerQueryBus,
        BusConfig,
        BusError,
        ChannelBroker,
        Command,
        CommandBus,
        CommandHandler,
        Context,
        Event,
        EventBus,
        EventHandler,
        HandlerError,
        InProcessCommandBus,
        InProcessEventBus,
        InProcessQueryBus,
        PubSub,
        Query,
        QueryBus,
        QueryHandler,
        command_handler_fn,
        event_handler_fn,
        query_handler_fn,
    };
}
