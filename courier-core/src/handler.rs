//! Handler contracts consumed from application code.

use crate::context::Context;
use crate::envelope::{Command, Event, Query};
use crate::error::HandlerError;
use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// Command handler trait
#[async_trait]
pub trait CommandHandler<T>: Send + Sync {
    /// Handle the command
    async fn handle(&self, ctx: &Context, command: Command<T>) -> Result<(), HandlerError>;
}

/// Query handler trait
#[async_trait]
pub trait QueryHandler<T, R>: Send + Sync {
    /// Handle the query
    async fn handle(&self, ctx: &Context, query: Query<T>) -> Result<R, HandlerError>;
}

/// Event handler trait
///
/// Several handlers may receive the same event, so they only borrow it.
#[async_trait]
pub trait EventHandler<T>: Send + Sync {
    /// Handle the event
    async fn handle(&self, ctx: &Context, event: &Event<T>) -> Result<(), HandlerError>;
}

/// Closure-backed handler, see [`command_handler_fn`] and friends.
pub struct FnHandler<F, A> {
    f: F,
    _args: PhantomData<fn(A)>,
}

/// Wrap a closure as a [`CommandHandler`].
pub fn command_handler_fn<T, F, Fut>(f: F) -> Arc<dyn CommandHandler<T>>
where
    T: Send + 'static,
    F: Fn(Context, Command<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler::<F, Command<T>> {
        f,
        _args: PhantomData,
    })
}

/// Wrap a closure as a [`QueryHandler`].
pub fn query_handler_fn<T, R, F, Fut>(f: F) -> Arc<dyn QueryHandler<T, R>>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(Context, Query<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler::<F, Query<T>> {
        f,
        _args: PhantomData,
    })
}

/// Wrap a closure as an [`EventHandler`]. The closure receives its own copy of the event.
pub fn event_handler_fn<T, F, Fut>(f: F) -> Arc<dyn EventHandler<T>>
where
    T: Clone + Send + Sync + 'static,
    F: Fn(Context, Event<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler::<F, Event<T>> {
        f,
        _args: PhantomData,
    })
}

#[async_trait]
impl<T, F, Fut> CommandHandler<T> for FnHandler<F, Command<T>>
where
    T: Send + 'static,
    F: Fn(Context, Command<T>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, ctx: &Context, command: Command<T>) -> Result<(), HandlerError> {
        (self.f)(ctx.clone(), command).await
    }
}

#[async_trait]
impl<T, R, F, Fut> QueryHandler<T, R> for FnHandler<F, Query<T>>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(Context, Query<T>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<R, HandlerError>> + Send,
{
    async fn handle(&self, ctx: &Context, query: Query<T>) -> Result<R, HandlerError> {
        (self.f)(ctx.clone(), query).await
    }
}

#[async_trait]
impl<T, F, Fut> EventHandler<T> for FnHandler<F, Event<T>>
where
    T: Clone + Send + Sync + 'static,
    F: Fn(Context, Event<T>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, ctx: &Context, event: &Event<T>) -> Result<(), HandlerError> {
        (self.f)(ctx.clone(), event.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closure_query_handler() {
        let handler = query_handler_fn(|_ctx, query: Query<u32>| async move {
            Ok::<_, HandlerError>(query.into_payload() * 2)
        });

        let result = handler
            .handle(&Context::background(), Query::new("Double", 21))
            .await
            .unwrap();
        assert_eq!(result, 42);
    }

    #[tokio::test]
    async fn closure_command_handler_sees_context() {
        let handler = command_handler_fn(|ctx: Context, _command: Command<()>| async move {
            match ctx.err() {
                Some(reason) => Err(HandlerError::from(reason)),
                None => Ok(()),
            }
        });

        let ctx = Context::background();
        assert!(handler.handle(&ctx, Command::new("Noop", ())).await.is_ok());

        ctx.cancel();
        let err = handler.handle(&ctx, Command::new("Noop", ())).await.unwrap_err();
        assert!(matches!(err, HandlerError::Cancelled(_)));
    }
}
