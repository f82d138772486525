//! Durable hand-off between parity verification and ERP projection
//! (spec.md §4.7): once an order/SKU pair is balance-checked, a
//! `ParityVerified` message crosses to the projector over a Redis Stream
//! rather than a direct call, so the projector can run as an independent,
//! restart-safe consumer group.
//!
//! Grounded 1:1 on `original_source/core/infrastructure/bus/redis_stream_publisher.py`
//! and `redis_stream_consumer.py`: same `XADD ... MAXLEN ~`, the same
//! `XGROUP CREATE ... MKSTREAM` / `XREADGROUP` / `XACK` cycle, default stream
//! name `finance` and consumer group `finance-consumers` (dropping the
//! original's product-specific `konozy:` prefix).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::streams::{StreamMaxlen, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use rust_decimal::Decimal;
use shared::ids::{ExecutionId, OrderId, Sku};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("malformed stream message {id}: missing or invalid field {field}")]
    MalformedMessage { id: String, field: &'static str },
}

/// `(order_id, sku, net_proceeds, account_id, timestamp, execution_id)`
/// (spec.md §4.7) — the unit of work handed off to the ERP projector.
#[derive(Debug, Clone, PartialEq)]
pub struct ParityVerified {
    pub order_id: OrderId,
    pub sku: Sku,
    pub net_proceeds: Decimal,
    pub account_id: u32,
    pub timestamp: DateTime<Utc>,
    pub execution_id: ExecutionId,
}

/// A message read off the stream, still unacknowledged.
#[derive(Debug, Clone)]
pub struct DeliveredMessage {
    pub id: String,
    pub message: ParityVerified,
}

#[async_trait]
pub trait HandoffStream: Send + Sync {
    async fn publish(&self, message: &ParityVerified) -> Result<String, StreamError>;

    /// Blocks up to `block` for up to `batch_size` undelivered messages.
    async fn read_batch(&self, batch_size: usize, block: Duration) -> Result<Vec<DeliveredMessage>, StreamError>;

    async fn ack(&self, message_id: &str) -> Result<(), StreamError>;
}

pub struct RedisHandoffStream {
    manager: ConnectionManager,
    stream_name: String,
    consumer_group: String,
    consumer_name: String,
    retention: usize,
}

impl RedisHandoffStream {
    pub async fn connect(
        redis_url: &str,
        stream_name: String,
        consumer_group: String,
        consumer_name: String,
        retention: usize,
    ) -> Result<Self, StreamError> {
        let client = redis::Client::open(redis_url)?;
        let mut manager = ConnectionManager::new(client).await?;

        let result: redis::RedisResult<()> =
            manager.xgroup_create_mkstream(&stream_name, &consumer_group, "0").await;
        if let Err(e) = result {
            if !e.to_string().contains("BUSYGROUP") {
                return Err(e.into());
            }
            tracing::debug!(stream = %stream_name, group = %consumer_group, "consumer group already exists");
        } else {
            tracing::info!(stream = %stream_name, group = %consumer_group, "created consumer group");
        }

        Ok(Self { manager, stream_name, consumer_group, consumer_name, retention })
    }
}

#[async_trait]
impl HandoffStream for RedisHandoffStream {
    async fn publish(&self, message: &ParityVerified) -> Result<String, StreamError> {
        let fields: [(&str, String); 6] = [
            ("order_id", message.order_id.to_string()),
            ("sku", message.sku.to_string()),
            ("net_proceeds", message.net_proceeds.to_string()),
            ("account_id", message.account_id.to_string()),
            ("timestamp", message.timestamp.to_rfc3339()),
            ("execution_id", message.execution_id.to_string()),
        ];

        let mut manager = self.manager.clone();
        let id: String = manager
            .xadd_maxlen(&self.stream_name, StreamMaxlen::Approx(self.retention), "*", &fields)
            .await?;

        tracing::info!(
            order_id = %message.order_id, sku = %message.sku, net_proceeds = %message.net_proceeds,
            msg_id = %id, "published ParityVerified"
        );
        Ok(id)
    }

    async fn read_batch(&self, batch_size: usize, block: Duration) -> Result<Vec<DeliveredMessage>, StreamError> {
        let opts = StreamReadOptions::default()
            .group(&self.consumer_group, &self.consumer_name)
            .count(batch_size)
            .block(block.as_millis() as usize);

        let mut manager = self.manager.clone();
        let reply: StreamReadReply = manager.xread_options(&[&self.stream_name], &[">"], &opts).await?;

        let mut delivered = Vec::new();
        for key in reply.keys {
            for stream_id in key.ids {
                let id = stream_id.id.clone();
                match parse_message(&stream_id) {
                    Ok(message) => delivered.push(DeliveredMessage { id, message }),
                    Err(e) => tracing::warn!(msg_id = %id, error = %e, "dropping malformed stream message"),
                }
            }
        }
        Ok(delivered)
    }

    async fn ack(&self, message_id: &str) -> Result<(), StreamError> {
        let mut manager = self.manager.clone();
        let _: i64 = manager.xack(&self.stream_name, &self.consumer_group, &[message_id]).await?;
        Ok(())
    }
}

fn parse_message(stream_id: &redis::streams::StreamId) -> Result<ParityVerified, StreamError> {
    let field = |name: &'static str| -> Result<String, StreamError> {
        stream_id.get::<String>(name).ok_or(StreamError::MalformedMessage { id: stream_id.id.clone(), field: name })
    };

    let order_id = OrderId::new(field("order_id")?)
        .map_err(|_| StreamError::MalformedMessage { id: stream_id.id.clone(), field: "order_id" })?;
    let sku = Sku::new(field("sku")?);
    let net_proceeds = Decimal::from_str(&field("net_proceeds")?)
        .map_err(|_| StreamError::MalformedMessage { id: stream_id.id.clone(), field: "net_proceeds" })?;
    let account_id: u32 = field("account_id")?
        .parse()
        .map_err(|_| StreamError::MalformedMessage { id: stream_id.id.clone(), field: "account_id" })?;
    let timestamp = DateTime::parse_from_rfc3339(&field("timestamp")?)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StreamError::MalformedMessage { id: stream_id.id.clone(), field: "timestamp" })?;
    let execution_id = Uuid::parse_str(&field("execution_id")?)
        .map(ExecutionId::from_uuid)
        .map_err(|_| StreamError::MalformedMessage { id: stream_id.id.clone(), field: "execution_id" })?;

    Ok(ParityVerified { order_id, sku, net_proceeds, account_id, timestamp, execution_id })
}

/// In-process stand-in for a Redis stream, used by orchestrator/projector
/// unit tests so they don't require a live Redis instance.
#[cfg(test)]
pub struct InMemoryHandoffStream {
    queue: tokio::sync::Mutex<std::collections::VecDeque<DeliveredMessage>>,
    next_id: std::sync::atomic::AtomicU64,
}

#[cfg(test)]
impl InMemoryHandoffStream {
    pub fn new() -> Self {
        Self { queue: tokio::sync::Mutex::new(std::collections::VecDeque::new()), next_id: std::sync::atomic::AtomicU64::new(1) }
    }
}

#[cfg(test)]
#[async_trait]
impl HandoffStream for InMemoryHandoffStream {
    async fn publish(&self, message: &ParityVerified) -> Result<String, StreamError> {
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let id = format!("{id}-0");
        self.queue.lock().await.push_back(DeliveredMessage { id: id.clone(), message: message.clone() });
        Ok(id)
    }

    async fn read_batch(&self, batch_size: usize, _block: Duration) -> Result<Vec<DeliveredMessage>, StreamError> {
        let mut queue = self.queue.lock().await;
        let drained: Vec<_> = (0..batch_size).filter_map(|_| queue.pop_front()).collect();
        Ok(drained)
    }

    async fn ack(&self, _message_id: &str) -> Result<(), StreamError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_message() -> ParityVerified {
        ParityVerified {
            order_id: OrderId::new("123-4567890-1234567").unwrap(),
            sku: Sku::new("JR-ZS283"),
            net_proceeds: dec!(149.96),
            account_id: 1075,
            timestamp: Utc::now(),
            execution_id: ExecutionId::new(),
        }
    }

    #[tokio::test]
    async fn in_memory_stream_round_trips_a_message() {
        let stream = InMemoryHandoffStream::new();
        let message = sample_message();
        let id = stream.publish(&message).await.unwrap();

        let delivered = stream.read_batch(10, Duration::from_millis(0)).await.unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].id, id);
        assert_eq!(delivered[0].message, message);

        stream.ack(&id).await.unwrap();
        let empty = stream.read_batch(10, Duration::from_millis(0)).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn read_batch_respects_batch_size() {
        let stream = InMemoryHandoffStream::new();
        for _ in 0..5 {
            stream.publish(&sample_message()).await.unwrap();
        }
        let delivered = stream.read_batch(3, Duration::from_millis(0)).await.unwrap();
        assert_eq!(delivered.len(), 3);
    }
}
