//! Fan-out of one event to many handlers, with error aggregation.

use crate::context::Context;
use crate::envelope::Event;
use crate::error::{BusError, HandlerError};
use crate::handler::EventHandler;
use futures::future::join_all;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error};

/// Every failure produced by the handlers of one event publish.
#[derive(Debug)]
pub struct AggregateError {
    event: String,
    errors: Vec<HandlerError>,
}

impl AggregateError {
    pub fn new(event: impl Into<String>, errors: Vec<HandlerError>) -> Self {
        Self {
            event: event.into(),
            errors,
        }
    }

    /// Name of the event whose handlers failed.
    pub fn event(&self) -> &str {
        &self.event
    }

    /// The individual handler errors, in completion order.
    pub fn errors(&self) -> &[HandlerError] {
        &self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn into_errors(self) -> Vec<HandlerError> {
        self.errors
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} handler(s) failed for event '{}': [",
            self.errors.len(),
            self.event
        )?;
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{err}")?;
        }
        f.write_str("]")
    }
}

impl std::error::Error for AggregateError {}

/// How a [`FanOut`] schedules handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FanOutMode {
    /// One task per handler, all running at once
    #[default]
    Concurrent,
    /// Handlers run one after another, the next starting when the last is done
    Sequential,
}

/// Runs every handler registered for one event and merges their failures.
pub struct FanOut<T> {
    mode: FanOutMode,
    handlers: Vec<Arc<dyn EventHandler<T>>>,
}

impl<T: Send + Sync + 'static> FanOut<T> {
    pub fn new(mode: FanOutMode, handlers: Vec<Arc<dyn EventHandler<T>>>) -> Self {
        Self { mode, handlers }
    }

    /// Deliver `event` to every handler.
    ///
    /// Waits for all handlers or for `ctx` to finish, whichever comes first.
    /// On expiry the concurrent handlers are left running in the background.
    pub async fn run(self, ctx: &Context, event: Arc<Event<T>>) -> Result<(), BusError> {
        if self.handlers.is_empty() {
            return Ok(());
        }

        let errors = match self.mode {
            FanOutMode::Concurrent => self.run_concurrent(ctx, &event).await?,
            FanOutMode::Sequential => self.run_sequential(ctx, &event).await?,
        };

        if errors.is_empty() {
            debug!(event = %event.name(), "all event handlers succeeded");
            Ok(())
        } else {
            let aggregate = AggregateError::new(event.name(), errors);
            error!(event = %event.name(), error = %aggregate, "event handlers failed");
            Err(aggregate.into())
        }
    }

    async fn run_concurrent(
        self,
        ctx: &Context,
        event: &Arc<Event<T>>,
    ) -> Result<Vec<HandlerError>, BusError> {
        let tasks: Vec<_> = self
            .handlers
            .into_iter()
            .map(|handler| {
                let ctx = ctx.clone();
                let event = Arc::clone(event);
                tokio::spawn(async move { handler.handle(&ctx, &event).await })
            })
            .collect();

        let results = tokio::select! {
            biased;
            reason = ctx.done() => {
                error!(event = %event.name(), error = %reason, "stopped waiting for event handlers");
                return Err(reason.into());
            }
            results = join_all(tasks) => results,
        };

        Ok(results
            .into_iter()
            .filter_map(|joined| match joined {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(err),
                Err(join_err) => Some(HandlerError::Failed(format!(
                    "handler task panicked: {join_err}"
                ))),
            })
            .collect())
    }

    async fn run_sequential(
        self,
        ctx: &Context,
        event: &Arc<Event<T>>,
    ) -> Result<Vec<HandlerError>, BusError> {
        let mut errors = Vec::new();
        for handler in self.handlers {
            let task = {
                let ctx = ctx.clone();
                let event = Arc::clone(event);
                tokio::spawn(async move { handler.handle(&ctx, &event).await })
            };
            let joined = tokio::select! {
                biased;
                reason = ctx.done() => {
                    error!(event = %event.name(), error = %reason, "stopped waiting for event handlers");
                    return Err(reason.into());
                }
                joined = task => joined,
            };
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => errors.push(err),
                Err(join_err) => errors.push(HandlerError::Failed(format!(
                    "handler task panicked: {join_err}"
                ))),
            }
        }
        Ok(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CancellationError;
    use crate::handler::event_handler_fn;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn failing(message: &'static str) -> Arc<dyn EventHandler<String>> {
        event_handler_fn(move |_ctx, _event: Event<String>| async move {
            Err::<(), _>(HandlerError::failed(message))
        })
    }

    fn counting(counter: Arc<AtomicU32>) -> Arc<dyn EventHandler<String>> {
        event_handler_fn(move |_ctx, _event: Event<String>| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), HandlerError>(())
            }
        })
    }

    fn event() -> Arc<Event<String>> {
        Arc::new(Event::new("TicketBooked", "John Doe".to_string()))
    }

    #[test]
    fn display_lists_every_error() {
        let err = AggregateError::new(
            "TicketBooked",
            vec![HandlerError::failed("mail down"), HandlerError::failed("audit down")],
        );
        let text = err.to_string();
        assert!(text.starts_with("2 handler(s) failed for event 'TicketBooked'"));
        assert!(text.contains("mail down"));
        assert!(text.contains("audit down"));
    }

    #[tokio::test]
    async fn collects_all_failures() {
        let counter = Arc::new(AtomicU32::new(0));
        let handlers = vec![
            counting(counter.clone()),
            failing("first"),
            counting(counter.clone()),
            failing("second"),
        ];

        let err = FanOut::new(FanOutMode::Concurrent, handlers)
            .run(&Context::background(), event())
            .await
            .unwrap_err();

        match err {
            BusError::Aggregate(aggregate) => {
                assert_eq!(aggregate.len(), 2);
                let text = aggregate.to_string();
                assert!(text.contains("first") && text.contains("second"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn sequential_mode_aggregates_too() {
        let handlers = vec![failing("a"), failing("b"), failing("c")];
        let err = FanOut::new(FanOutMode::Sequential, handlers)
            .run(&Context::background(), event())
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Aggregate(ref a) if a.len() == 3));
    }

    #[tokio::test]
    async fn panicking_handler_is_reported() {
        let panicking = event_handler_fn(|_ctx, _event: Event<String>| async move {
            if true {
                panic!("handler bug");
            }
            Ok::<(), HandlerError>(())
        });

        let err = FanOut::new(FanOutMode::Concurrent, vec![panicking])
            .run(&Context::background(), event())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("panicked"));
    }

    #[tokio::test]
    async fn expiry_returns_cancellation_and_detaches_handlers() {
        let finished = Arc::new(AtomicU32::new(0));
        let slow = {
            let finished = finished.clone();
            event_handler_fn(move |_ctx, _event: Event<String>| {
                let finished = finished.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), HandlerError>(())
                }
            })
        };

        let ctx = Context::background().with_timeout(Duration::from_millis(10));
        let err = FanOut::new(FanOutMode::Concurrent, vec![slow])
            .run(&ctx, event())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BusError::Cancelled(CancellationError::DeadlineExceeded)
        ));

        // The handler keeps running after the caller gave up.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sequential_expiry_lets_the_running_handler_finish() {
        let finished = Arc::new(AtomicU32::new(0));
        let slow = || {
            let finished = finished.clone();
            event_handler_fn(move |_ctx, _event: Event<String>| {
                let finished = finished.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), HandlerError>(())
                }
            })
        };

        let ctx = Context::background().with_timeout(Duration::from_millis(10));
        let err = FanOut::new(FanOutMode::Sequential, vec![slow(), slow()])
            .run(&ctx, event())
            .await
            .unwrap_err();
        assert!(err.is_cancellation());

        // The first handler completes; the second is never started.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }
}
