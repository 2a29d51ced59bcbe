//! Redis streams adapter.
//!
//! Every topic is a stream. Subscriptions read through consumer groups with
//! `XREADGROUP`, so unacked entries stay in the group's pending list.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::{
    Acknowledger, Context, Delivery, DeliveryMode, DeliveryStream, Message, PubSub,
    SubscribeOptions, TransportError,
};
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{Client, RedisError, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::RedisStreamConfig;

const SUBSCRIPTION_BUFFER: usize = 100;

const FIELD_ID: &str = "id";
const FIELD_PAYLOAD: &str = "payload";
const FIELD_CORRELATION_ID: &str = "correlation_id";
const FIELD_TIMESTAMP: &str = "timestamp";
const FIELD_HEADERS: &str = "headers";

fn connection_error(err: RedisError) -> TransportError {
    TransportError::Connection(err.to_string())
}

/// [`PubSub`] backed by Redis streams.
///
/// Competing subscriptions join their requested consumer group, or the
/// configured one. Broadcast subscriptions get a group of their own, created
/// at the end of the stream and destroyed when the subscription stops.
pub struct RedisStreamPubSub {
    client: Client,
    conn: ConnectionManager,
    config: RedisStreamConfig,
    shutdown: CancellationToken,
    pumps: TaskTracker,
}

impl RedisStreamPubSub {
    /// Connect to Redis
    pub async fn connect(config: RedisStreamConfig) -> Result<Self, TransportError> {
        info!(url = %config.url, "Connecting to Redis");
        let client = Client::open(config.url.as_str()).map_err(connection_error)?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(connection_error)?;

        info!("Connected to Redis successfully");
        Ok(Self {
            client,
            conn,
            config,
            shutdown: CancellationToken::new(),
            pumps: TaskTracker::new(),
        })
    }

    pub fn config(&self) -> &RedisStreamConfig {
        &self.config
    }

    /// Create `group` on `stream`, creating the stream too when missing.
    async fn create_group(&self, stream: &str, group: &str, start: &str) -> Result<(), TransportError> {
        let mut conn = self.conn.clone();
        let created: Result<(), RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg(start)
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(()) => {
                debug!(stream = %stream, group = %group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(TransportError::Subscribe(e.to_string())),
        }
    }
}

#[async_trait]
impl PubSub for RedisStreamPubSub {
    async fn publish(&self, topic: &str, message: Message) -> Result<(), TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Closed("Redis client is closed".into()));
        }

        let mut cmd = redis::cmd("XADD");
        cmd.arg(topic);
        if let Some(max_len) = self.config.max_len {
            cmd.arg("MAXLEN").arg("~").arg(max_len);
        }
        cmd.arg("*")
            .arg(FIELD_ID)
            .arg(&message.id)
            .arg(FIELD_PAYLOAD)
            .arg(message.payload.as_slice())
            .arg(FIELD_TIMESTAMP)
            .arg(message.timestamp.to_rfc3339());
        if let Some(ref correlation_id) = message.correlation_id {
            cmd.arg(FIELD_CORRELATION_ID).arg(correlation_id);
        }
        if !message.headers.is_empty() {
            let headers = serde_json::to_string(&message.headers)
                .map_err(|e| TransportError::Publish(e.to_string()))?;
            cmd.arg(FIELD_HEADERS).arg(headers);
        }

        let mut conn = self.conn.clone();
        let entry: String = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))?;

        debug!(stream = %topic, message_id = %message.id, entry = %entry, "Published message to Redis stream");
        Ok(())
    }

    async fn subscribe(
        &self,
        ctx: &Context,
        topic: &str,
        options: SubscribeOptions,
    ) -> Result<DeliveryStream, TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Closed("Redis client is closed".into()));
        }

        let group = match options.mode {
            DeliveryMode::Competing => {
                let group = options.group.clone().unwrap_or_else(|| self.config.group.clone());
                self.create_group(topic, &group, "0").await?;
                group
            }
            DeliveryMode::Broadcast => {
                let group = format!("courier-{}", uuid::Uuid::new_v4());
                self.create_group(topic, &group, "$").await?;
                group
            }
        };

        // XREADGROUP blocks, so each subscription reads on its own connection.
        let reader = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(connection_error)?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let pump = Pump {
            reader,
            acker: self.conn.clone(),
            stream: topic.to_string(),
            group: group.clone(),
            consumer: self.config.consumer.clone(),
            mode: options.mode,
            block_ms: self.config.block_ms,
            batch_size: self.config.batch_size,
        };
        self.pumps.spawn(pump.run(tx, ctx.clone(), self.shutdown.clone()));

        info!(stream = %topic, group = %group, mode = ?options.mode, "Subscribed to Redis stream");
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn close(&self) -> Result<(), TransportError> {
        info!("Closing Redis connections");
        self.shutdown.cancel();
        self.pumps.close();
        self.pumps.wait().await;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

/// Reads one consumer group and forwards entries to a subscription.
struct Pump {
    reader: MultiplexedConnection,
    acker: ConnectionManager,
    stream: String,
    group: String,
    consumer: String,
    mode: DeliveryMode,
    block_ms: u64,
    batch_size: usize,
}

impl Pump {
    async fn run(
        mut self,
        tx: mpsc::Sender<Result<Delivery, TransportError>>,
        ctx: Context,
        shutdown: CancellationToken,
    ) {
        'outer: loop {
            let read = tokio::select! {
                biased;
                _ = ctx.done() => break,
                _ = shutdown.cancelled() => break,
                _ = tx.closed() => break,
                read = self.read() => read,
            };

            match read {
                Ok(entries) => {
                    for (entry_id, fields) in entries {
                        let message = to_message(&entry_id, fields);
                        let delivery = Delivery::new(
                            self.stream.clone(),
                            message,
                            Box::new(RedisAcker {
                                conn: self.acker.clone(),
                                stream: self.stream.clone(),
                                group: self.group.clone(),
                                entry_id,
                            }),
                        );
                        if tx.send(Ok(delivery)).await.is_err() {
                            break 'outer;
                        }
                    }
                }
                Err(e) => {
                    error!(stream = %self.stream, group = %self.group, error = %e, "Redis stream read failed");
                    if tx.send(Err(TransportError::Broker(e.to_string()))).await.is_err() {
                        break;
                    }
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_millis(self.block_ms)) => {}
                    }
                }
            }
        }

        if self.mode == DeliveryMode::Broadcast {
            self.destroy_group().await;
        }
        debug!(stream = %self.stream, group = %self.group, "Redis stream reader stopped");
    }

    async fn read(&mut self) -> Result<Vec<(String, HashMap<String, Vec<u8>>)>, RedisError> {
        let reply: Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(self.batch_size)
            .arg("BLOCK")
            .arg(self.block_ms)
            .arg("STREAMS")
            .arg(&self.stream)
            .arg(">")
            .query_async(&mut self.reader)
            .await?;
        Ok(parse_read_reply(reply))
    }

    async fn destroy_group(&mut self) {
        let destroyed: Result<i64, RedisError> = redis::cmd("XGROUP")
            .arg("DESTROY")
            .arg(&self.stream)
            .arg(&self.group)
            .query_async(&mut self.acker)
            .await;
        if let Err(e) = destroyed {
            warn!(stream = %self.stream, group = %self.group, error = %e, "Failed to remove broadcast group");
        }
    }
}

/// Acks with `XACK`; nack leaves the entry in the pending list.
struct RedisAcker {
    conn: ConnectionManager,
    stream: String,
    group: String,
    entry_id: String,
}

#[async_trait]
impl Acknowledger for RedisAcker {
    async fn ack(&mut self, _message: &Message) -> Result<(), TransportError> {
        let _: i64 = redis::cmd("XACK")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&self.entry_id)
            .query_async(&mut self.conn)
            .await
            .map_err(|e| TransportError::Acknowledge(e.to_string()))?;
        Ok(())
    }

    async fn nack(&mut self, message: &Message) -> Result<(), TransportError> {
        warn!(
            stream = %self.stream,
            group = %self.group,
            entry = %self.entry_id,
            message_id = %message.id,
            "Entry left pending for the consumer group"
        );
        Ok(())
    }
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::SimpleString(s) => Some(s.clone()),
        _ => None,
    }
}

fn bytes(value: Value) -> Option<Vec<u8>> {
    match value {
        Value::BulkString(bytes) => Some(bytes),
        Value::SimpleString(s) => Some(s.into_bytes()),
        _ => None,
    }
}

/// Key/value pairs of a RESP2 flat array or a RESP3 map.
fn pairs(value: Value) -> Vec<(Value, Value)> {
    match value {
        Value::Map(pairs) => pairs,
        Value::Array(items) => {
            let mut items = items.into_iter();
            let mut pairs = Vec::new();
            while let (Some(key), Some(value)) = (items.next(), items.next()) {
                pairs.push((key, value));
            }
            pairs
        }
        _ => Vec::new(),
    }
}

/// Flatten an `XREADGROUP` reply into `(entry id, fields)` pairs.
fn parse_read_reply(reply: Value) -> Vec<(String, HashMap<String, Vec<u8>>)> {
    let streams = match reply {
        Value::Nil => return Vec::new(),
        Value::Map(streams) => streams.into_iter().map(|(_, entries)| entries).collect(),
        Value::Array(streams) => streams
            .into_iter()
            .filter_map(|stream| match stream {
                Value::Array(mut parts) if parts.len() == 2 => parts.pop(),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };

    let mut parsed = Vec::new();
    for entries in streams {
        let Value::Array(entries) = entries else { continue };
        for entry in entries {
            let Value::Array(mut parts) = entry else { continue };
            if parts.len() != 2 {
                continue;
            }
            let fields = parts.pop().map(pairs).unwrap_or_default();
            let Some(entry_id) = parts.pop().as_ref().and_then(text) else {
                continue;
            };

            let fields = fields
                .into_iter()
                .filter_map(|(key, value)| Some((text(&key)?, bytes(value)?)))
                .collect();
            parsed.push((entry_id, fields));
        }
    }
    parsed
}

fn to_message(entry_id: &str, mut fields: HashMap<String, Vec<u8>>) -> Message {
    let as_text = |value: Vec<u8>| String::from_utf8_lossy(&value).into_owned();

    let mut message = Message::new(fields.remove(FIELD_PAYLOAD).unwrap_or_default());
    message = match fields.remove(FIELD_ID) {
        Some(id) => message.with_id(as_text(id)),
        None => message.with_id(entry_id),
    };
    message.correlation_id = fields.remove(FIELD_CORRELATION_ID).map(as_text);

    if let Some(timestamp) = fields
        .remove(FIELD_TIMESTAMP)
        .and_then(|ts| DateTime::parse_from_rfc3339(&as_text(ts)).ok())
    {
        message = message.with_timestamp(timestamp.with_timezone(&Utc));
    }

    if let Some(headers) = fields.remove(FIELD_HEADERS) {
        match serde_json::from_slice(&headers) {
            Ok(headers) => message.headers = headers,
            Err(e) => warn!(entry = %entry_id, error = %e, "Ignoring malformed headers field"),
        }
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(s: &str) -> Value {
        Value::BulkString(s.as_bytes().to_vec())
    }

    fn entry(id: &str, fields: &[(&str, &str)]) -> Value {
        let fields = fields.iter().flat_map(|(k, v)| [bulk(k), bulk(v)]).collect();
        Value::Array(vec![bulk(id), Value::Array(fields)])
    }

    #[test]
    fn empty_read_yields_nothing() {
        assert!(parse_read_reply(Value::Nil).is_empty());
    }

    #[test]
    fn resp2_reply_is_flattened() {
        let reply = Value::Array(vec![Value::Array(vec![
            bulk("FindTicket_response"),
            Value::Array(vec![
                entry("1-0", &[("id", "m-1"), ("payload", "12"), ("correlation_id", "req-1")]),
                entry("1-1", &[("id", "m-2"), ("payload", "13")]),
            ]),
        ])]);

        let entries = parse_read_reply(reply);
        assert_eq!(entries.len(), 2);

        let (entry_id, fields) = entries.into_iter().next().unwrap();
        assert_eq!(entry_id, "1-0");
        let message = to_message(&entry_id, fields);
        assert_eq!(message.id, "m-1");
        assert_eq!(message.payload, b"12");
        assert_eq!(message.correlation_id.as_deref(), Some("req-1"));
    }

    #[test]
    fn resp3_map_reply_is_flattened() {
        let fields = Value::Map(vec![(bulk("id"), bulk("m-9")), (bulk("payload"), bulk("{}"))]);
        let reply = Value::Map(vec![(
            bulk("TicketBooked"),
            Value::Array(vec![Value::Array(vec![bulk("5-0"), fields])]),
        )]);

        let entries = parse_read_reply(reply);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "5-0");
        assert_eq!(entries[0].1.get("id").map(Vec::as_slice), Some(&b"m-9"[..]));
    }

    #[test]
    fn entry_without_metadata_uses_the_stream_id() {
        let mut fields = HashMap::new();
        fields.insert("payload".to_string(), b"\"x\"".to_vec());
        fields.insert("headers".to_string(), br#"{"courier-error":"boom"}"#.to_vec());

        let message = to_message("7-3", fields);
        assert_eq!(message.id, "7-3");
        assert!(message.correlation_id.is_none());
        assert_eq!(message.header("courier-error"), Some("boom"));
    }
}
