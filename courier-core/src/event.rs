//! In-process event bus.

use crate::aggregate::{FanOut, FanOutMode};
use crate::bus::EventBus;
use crate::context::Context;
use crate::envelope::Event;
use crate::error::BusError;
use crate::handler::EventHandler;
use crate::registry::HandlerList;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Event bus configuration
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Run handlers concurrently, one task each
    pub concurrent: bool,

    /// Enable event logging
    pub enable_logging: bool,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            concurrent: true,
            enable_logging: true,
        }
    }
}

impl EventBusConfig {
    fn fan_out_mode(&self) -> FanOutMode {
        if self.concurrent {
            FanOutMode::Concurrent
        } else {
            FanOutMode::Sequential
        }
    }
}

/// Event bus for in-process event publishing and handling
pub struct InProcessEventBus<T> {
    handlers: HandlerList<dyn EventHandler<T>>,
    config: EventBusConfig,
}

impl<T: Send + Sync + 'static> InProcessEventBus<T> {
    /// Create new event bus
    pub fn new() -> Self {
        Self::with_config(EventBusConfig::default())
    }

    /// Create event bus with custom config
    pub fn with_config(config: EventBusConfig) -> Self {
        Self {
            handlers: HandlerList::new(),
            config,
        }
    }

    /// Subscribe a handler to an event name.
    ///
    /// Handlers are additive: registering the same handler twice runs it twice.
    pub fn subscribe(&self, name: &str, handler: Arc<dyn EventHandler<T>>) -> Result<(), BusError> {
        let count = self.handlers.append(name, handler)?;
        if self.config.enable_logging {
            debug!(event = %name, handlers = count, "subscribed event handler");
        }
        Ok(())
    }

    /// Drop every handler of an event name
    pub fn unsubscribe(&self, name: &str) -> usize {
        let removed = self.handlers.remove(name);
        if self.config.enable_logging {
            debug!(event = %name, removed, "unsubscribed event handlers");
        }
        removed
    }

    /// Get handler count for an event name
    pub fn handler_count(&self, name: &str) -> usize {
        self.handlers.handler_count(name)
    }

    pub fn config(&self) -> &EventBusConfig {
        &self.config
    }

    /// Publish an event to every handler and aggregate their failures.
    pub async fn emit(&self, ctx: &Context, event: Event<T>) -> Result<(), BusError> {
        let handlers = self.handlers.snapshot(event.name());
        if handlers.is_empty() {
            if self.config.enable_logging {
                warn!(event = %event.name(), "no handlers registered for event");
            }
            return Ok(());
        }

        if self.config.enable_logging {
            info!(event = %event.name(), handlers = handlers.len(), "publishing event");
        }

        FanOut::new(self.config.fan_out_mode(), handlers)
            .run(ctx, Arc::new(event))
            .await
    }
}

impl<T: Send + Sync + 'static> Default for InProcessEventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> EventBus<T> for InProcessEventBus<T> {
    async fn register_handler(
        &self,
        name: &str,
        handler: Arc<dyn EventHandler<T>>,
    ) -> Result<(), BusError> {
        self.subscribe(name, handler)
    }

    async fn publish(&self, ctx: &Context, event: Event<T>) -> Result<(), BusError> {
        self.emit(ctx, event).await
    }
}

/// Event bus builder
pub struct EventBusBuilder {
    config: EventBusConfig,
}

impl EventBusBuilder {
    /// Create new event bus builder
    pub fn new() -> Self {
        Self {
            config: EventBusConfig::default(),
        }
    }

    /// Run handlers concurrently (default) or one after another
    pub fn concurrent(mut self, enabled: bool) -> Self {
        self.config.concurrent = enabled;
        self
    }

    /// Enable/disable logging
    pub fn enable_logging(mut self, enabled: bool) -> Self {
        self.config.enable_logging = enabled;
        self
    }

    /// Build the event bus
    pub fn build<T: Send + Sync + 'static>(self) -> InProcessEventBus<T> {
        InProcessEventBus::with_config(self.config)
    }
}

impl Default for EventBusBuilder {
    fn default() -> Self {
        Self::new()
    }
}
