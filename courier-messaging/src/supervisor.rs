//! Structured task group owning every background task of a bus.
//!
//! Subscription loops and message workers are spawned through a [`TaskScope`].
//! Cancelling the scope stops all of them; dropping the owning [`Supervisor`]
//! cancels the scope, so no task outlives its bus.

use courier_core::{Context, Delivery, DeliveryStream};
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

/// Cloneable handle used to spawn tasks into a supervisor's group.
#[derive(Clone)]
pub struct TaskScope {
    token: CancellationToken,
    tracker: TaskTracker,
    permits: Arc<Semaphore>,
}

impl TaskScope {
    /// A context cancelled when the scope shuts down.
    pub fn context(&self) -> Context {
        Context::from_token(self.token.child_token())
    }

    /// Context handed to one handler invocation.
    pub fn worker_context(&self, timeout: Option<Duration>) -> Context {
        let ctx = self.context();
        match timeout {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Spawn a task that is aborted at its next await point on shutdown.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = future => {}
            }
        });
    }

    /// Wait for an in-flight slot; `None` once the scope is shut down.
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            permit = Arc::clone(&self.permits).acquire_owned() => permit.ok(),
        }
    }

    /// Drain `stream`, running `process` for each delivery on its own task.
    ///
    /// At most `max_in_flight` deliveries are processed at once across the
    /// whole scope; the loop stops pulling while every slot is taken.
    ///
    /// The stream must come from a subscription made with [`context`](Self::context).
    /// On shutdown the loop keeps reading until the transport ends the stream,
    /// nacking what is left, so the subscription is torn down before
    /// [`Supervisor::shutdown`] returns.
    pub fn consume<F, Fut>(&self, topic: impl Into<String>, mut stream: DeliveryStream, process: F)
    where
        F: Fn(Delivery) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let topic = topic.into();
        let scope = self.clone();
        self.tracker.spawn(async move {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = scope.token.cancelled() => break,
                    next = stream.next() => next,
                };
                let Some(next) = next else {
                    debug!(topic = %topic, "subscription ended");
                    return;
                };
                let delivery = match next {
                    Ok(delivery) => delivery,
                    Err(err) => {
                        error!(topic = %topic, error = %err, "subscription error");
                        continue;
                    }
                };

                let Some(permit) = scope.acquire().await else {
                    nack(delivery).await;
                    break;
                };

                let work = process(delivery);
                scope.spawn(async move {
                    work.await;
                    drop(permit);
                });
            }

            while let Some(next) = stream.next().await {
                if let Ok(delivery) = next {
                    nack(delivery).await;
                }
            }
            debug!(topic = %topic, "subscription loop stopped");
        });
    }

    /// Number of tasks still running.
    pub fn running(&self) -> usize {
        self.tracker.len()
    }
}

/// Ack a processed delivery, logging a failure to do so.
pub(crate) async fn ack(delivery: Delivery) {
    let (topic, id) = (delivery.topic().to_string(), delivery.id().to_string());
    if let Err(err) = delivery.ack().await {
        warn!(topic = %topic, message_id = %id, error = %err, "failed to ack message");
    }
}

/// Nack a delivery whose processing failed, logging a failure to do so.
pub(crate) async fn nack(delivery: Delivery) {
    let (topic, id) = (delivery.topic().to_string(), delivery.id().to_string());
    if let Err(err) = delivery.nack().await {
        warn!(topic = %topic, message_id = %id, error = %err, "failed to nack message");
    }
}

/// Owner of a [`TaskScope`]. Dropping it cancels every task of the scope.
pub struct Supervisor {
    scope: TaskScope,
}

impl Supervisor {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            scope: TaskScope {
                token: CancellationToken::new(),
                tracker: TaskTracker::new(),
                permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            },
        }
    }

    pub fn scope(&self) -> &TaskScope {
        &self.scope
    }

    pub fn is_shutdown(&self) -> bool {
        self.scope.is_cancelled()
    }

    /// Cancel every task and wait until all of them have stopped.
    pub async fn shutdown(&self) {
        self.scope.token.cancel();
        self.scope.tracker.close();
        self.scope.tracker.wait().await;
        debug!("supervisor stopped");
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.scope.token.cancel();
        self.scope.tracker.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{Acknowledger, Message, TransportError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::ReceiverStream;

    struct Noop;

    #[async_trait::async_trait]
    impl Acknowledger for Noop {
        async fn ack(&mut self, _message: &Message) -> Result<(), TransportError> {
            Ok(())
        }

        async fn nack(&mut self, _message: &Message) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn shutdown_stops_long_running_tasks() {
        let supervisor = Supervisor::new(4);
        let finished = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let finished = finished.clone();
            supervisor.scope().spawn(async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                finished.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(supervisor.scope().running(), 3);

        tokio::time::timeout(Duration::from_secs(1), supervisor.shutdown())
            .await
            .unwrap();
        assert_eq!(supervisor.scope().running(), 0);
        assert_eq!(finished.load(Ordering::SeqCst), 0);
        assert!(supervisor.scope().acquire().await.is_none());
    }

    #[tokio::test]
    async fn consume_bounds_in_flight_work() {
        let supervisor = Supervisor::new(2);
        let (tx, rx) = mpsc::channel(16);
        let stream: DeliveryStream = Box::pin(ReceiverStream::new(rx));

        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        {
            let (active, peak, done) = (active.clone(), peak.clone(), done.clone());
            supervisor.scope().consume("ReserveTicket", stream, move |delivery| {
                let (active, peak, done) = (active.clone(), peak.clone(), done.clone());
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    delivery.ack().await.unwrap();
                    done.fetch_add(1, Ordering::SeqCst);
                }
            });
        }

        for _ in 0..6 {
            let delivery = Delivery::new("ReserveTicket", Message::new(vec![]), Box::new(Noop));
            tx.send(Ok(delivery)).await.unwrap();
        }

        tokio::time::timeout(Duration::from_secs(2), async {
            while done.load(Ordering::SeqCst) < 6 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn shutdown_waits_for_the_subscription_to_wind_down() {
        let supervisor = Supervisor::new(2);
        let ctx = supervisor.scope().context();
        let (tx, rx) = mpsc::channel::<Result<Delivery, TransportError>>(4);
        let stream: DeliveryStream = Box::pin(ReceiverStream::new(rx));
        let cleaned_up = Arc::new(AtomicUsize::new(0));

        // Stands in for a transport reader that cleans up after its context ends.
        let reader = {
            let cleaned_up = cleaned_up.clone();
            tokio::spawn(async move {
                ctx.done().await;
                tokio::time::sleep(Duration::from_millis(50)).await;
                cleaned_up.fetch_add(1, Ordering::SeqCst);
                drop(tx);
            })
        };

        supervisor.scope().consume("TicketBooked", stream, |delivery| async move {
            delivery.ack().await.unwrap();
        });

        tokio::time::timeout(Duration::from_secs(1), supervisor.shutdown())
            .await
            .unwrap();
        assert_eq!(cleaned_up.load(Ordering::SeqCst), 1);
        reader.await.unwrap();
    }

    #[tokio::test]
    async fn dropping_the_supervisor_cancels_the_context() {
        let supervisor = Supervisor::new(1);
        let ctx = supervisor.scope().context();
        assert!(!ctx.is_done());

        drop(supervisor);
        assert!(ctx.is_done());
    }
}
