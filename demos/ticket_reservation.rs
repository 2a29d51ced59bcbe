//! Ticket Reservation Example
//!
//! Reserves a seat with a command, confirms it from an event handler and
//! reads it back with a query, all over a broker.
//!
//! The broker is picked with `COURIER_BACKEND`:
//! - `channel` (default) - in-process channel broker
//! - `kafka` - needs `--features kafka` and `KAFKA_BROKERS`
//! - `redis` - needs `--features redis` and `REDIS_URL`
//!
//! ```text
//! RUST_LOG=courier_messaging=debug cargo run --example ticket_reservation
//! ```

use courier::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReserveTicket {
    passenger: String,
    seat: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TicketBooked {
    passenger: String,
    seat: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Ticket {
    id: String,
    passenger: String,
    seat: u32,
    confirmed: bool,
}

type Tickets = Arc<RwLock<HashMap<String, Ticket>>>;

async fn broker() -> Result<Arc<dyn PubSub>, Box<dyn std::error::Error>> {
    let backend = std::env::var("COURIER_BACKEND").unwrap_or_else(|_| "channel".to_string());
    let broker: Arc<dyn PubSub> = match backend.as_str() {
        #[cfg(feature = "kafka")]
        "kafka" => Arc::new(courier::KafkaPubSub::connect(courier::KafkaConfig::from_env()).await?),
        #[cfg(feature = "redis")]
        "redis" => Arc::new(
            courier::RedisStreamPubSub::connect(courier::RedisStreamConfig::from_env()).await?,
        ),
        "channel" => Arc::new(ChannelBroker::new()),
        other => return Err(format!("unsupported backend '{other}'").into()),
    };
    Ok(broker)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let broker = broker().await?;
    info!(backend = broker.backend(), "Starting ticket reservation demo");

    let config = BusConfig::from_env();
    let commands: BrokerCommandBus<ReserveTicket, dyn PubSub> =
        BrokerCommandBus::with_config(Arc::clone(&broker), config.clone());
    let events: Arc<BrokerEventBus<TicketBooked, dyn PubSub>> =
        Arc::new(BrokerEventBus::with_config(Arc::clone(&broker), config.clone()));
    let queries: BrokerQueryBus<String, Ticket, dyn PubSub> =
        BrokerQueryBus::with_config(Arc::clone(&broker), config);

    let tickets = Tickets::default();

    // Command: store the reservation and announce it
    {
        let tickets = Arc::clone(&tickets);
        let events = Arc::clone(&events);
        commands
            .register_handler(
                "ReserveTicket",
                command_handler_fn(move |ctx, command: Command<ReserveTicket>| {
                    let tickets = Arc::clone(&tickets);
                    let events = Arc::clone(&events);
                    async move {
                        let ReserveTicket { passenger, seat } = command.into_payload();
                        info!(%passenger, seat, "Reserving ticket");
                        let id = uuid::Uuid::new_v4().to_string();
                        tickets.write().await.insert(
                            id.clone(),
                            Ticket {
                                id,
                                passenger: passenger.clone(),
                                seat,
                                confirmed: false,
                            },
                        );
                        events
                            .publish(&ctx, Event::new("TicketBooked", TicketBooked { passenger, seat }))
                            .await
                            .map_err(|e| HandlerError::failed(e.to_string()))
                    }
                }),
            )
            .await?;
    }

    // Events: confirm the ticket and send a (pretend) email
    {
        let tickets = Arc::clone(&tickets);
        events
            .register_handler(
                "TicketBooked",
                event_handler_fn(move |_ctx, event: Event<TicketBooked>| {
                    let tickets = Arc::clone(&tickets);
                    async move {
                        let booked = event.into_payload();
                        let mut tickets = tickets.write().await;
                        match tickets.values_mut().find(|t| t.passenger == booked.passenger) {
                            Some(ticket) => {
                                ticket.confirmed = true;
                                Ok(())
                            }
                            None => Err(HandlerError::NotFound(booked.passenger)),
                        }
                    }
                }),
            )
            .await?;
        events
            .register_handler(
                "TicketBooked",
                event_handler_fn(|_ctx, event: Event<TicketBooked>| async move {
                    info!(passenger = %event.payload().passenger, "Sending confirmation email");
                    Ok::<(), HandlerError>(())
                }),
            )
            .await?;
    }

    // Query: look a ticket up by passenger
    {
        let tickets = Arc::clone(&tickets);
        queries
            .register_handler(
                "FindTicket",
                query_handler_fn(move |_ctx, query: Query<String>| {
                    let tickets = Arc::clone(&tickets);
                    async move {
                        let passenger = query.into_payload();
                        let found = tickets
                            .read()
                            .await
                            .values()
                            .find(|t| t.passenger == passenger)
                            .cloned();
                        found.ok_or(HandlerError::NotFound(passenger))
                    }
                }),
            )
            .await?;
    }

    let ctx = Context::background().with_timeout(Duration::from_secs(10));
    commands
        .dispatch(
            &ctx,
            Command::new(
                "ReserveTicket",
                ReserveTicket {
                    passenger: "John Doe".into(),
                    seat: 12,
                },
            ),
        )
        .await?;

    // The command is handled asynchronously; poll until the event has landed.
    let ticket = loop {
        let ticket = queries
            .dispatch(&ctx, Query::new("FindTicket", "John Doe".to_string()))
            .await;
        match ticket {
            Ok(ticket) if ticket.confirmed => break ticket,
            Ok(_) | Err(BusError::Handler(_)) => tokio::time::sleep(Duration::from_millis(50)).await,
            Err(e) => return Err(e.into()),
        }
    };
    info!(id = %ticket.id, passenger = %ticket.passenger, seat = ticket.seat, "Ticket confirmed");

    commands.shutdown().await;
    events.shutdown().await;
    queries.shutdown().await;
    broker.close().await?;
    Ok(())
}
