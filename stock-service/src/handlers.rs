use anyhow::Result;
use futures::StreamExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Message, Offset};
use shared::*;
use std::str::Utf8Error;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::compensation::CompensationHandler;
use crate::store::StockStore;

/// Consumes rollback signals from the delivery channel and publishes one
/// reply per processed signal.
pub struct RollbackConsumer<S> {
    handler: CompensationHandler<S>,
    producer: FutureProducer,
    reply_topic: String,
    max_retries: u32,
}

impl<S: StockStore> RollbackConsumer<S> {
    pub fn new(
        handler: CompensationHandler<S>,
        producer: FutureProducer,
        reply_topic: String,
        max_retries: u32,
    ) -> Self {
        Self {
            handler,
            producer,
            reply_topic,
            max_retries,
        }
    }

    pub async fn run(&self, consumer: StreamConsumer) {
        let mut message_stream = consumer.stream();

        while let Some(message) = message_stream.next().await {
            match message {
                Ok(m) => {
                    let delivery = match decode_payload(m.payload_view::<str>()) {
                        Some(signal) => Delivery::from_reply(&self.handle_signal(signal).await),
                        None => Delivery::Skipped,
                    };

                    if delivery.commits_offset() {
                        if let Err(e) = consumer.commit_message(&m, CommitMode::Async) {
                            error!("Error committing message: {}", e);
                        }
                    } else if let Err(e) = consumer.seek(
                        m.topic(),
                        m.partition(),
                        Offset::Offset(m.offset()),
                        Duration::from_secs(5),
                    ) {
                        error!("Error rewinding to undelivered rollback signal: {}", e);
                    }
                }
                Err(e) => error!("Error receiving message: {}", e),
            }
        }
    }

    async fn handle_signal(&self, signal: RollbackSignal) -> Result<()> {
        let response = self.handler.handle_signal(&signal, self.max_retries).await;
        if response.success {
            info!(
                goods_id = signal.goods_id,
                order_id = signal.order_id,
                "{}",
                response.message
            );
        }
        self.send_reply(RollbackReply::new(&signal, response))
            .await
            .map_err(|e| {
                error!(
                    goods_id = signal.goods_id,
                    order_id = signal.order_id,
                    "Error handling rollback signal: {}",
                    e
                );
                e
            })
    }

    async fn send_reply(&self, reply: RollbackReply) -> Result<()> {
        let json = serde_json::to_string(&reply)?;
        let key = reply.order_id.to_string();
        let record = FutureRecord::to(&self.reply_topic)
            .payload(&json)
            .key(&key);

        self.producer.send(record, Duration::from_secs(5)).await
            .map_err(|(e, _)| anyhow::anyhow!("Failed to send reply: {}", e))?;

        Ok(())
    }
}

/// What happened to one consumed message, and so whether its offset may be
/// committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Rollback decided and its reply published.
    Handled,
    /// Unreadable payload; redelivery would not help.
    Skipped,
    /// The reply never left. The signal stays uncommitted and is read again.
    ReplyFailed,
}

impl Delivery {
    pub fn from_reply(sent: &Result<()>) -> Self {
        match sent {
            Ok(()) => Delivery::Handled,
            Err(_) => Delivery::ReplyFailed,
        }
    }

    pub fn commits_offset(self) -> bool {
        !matches!(self, Delivery::ReplyFailed)
    }
}

fn decode_payload(
    payload: Option<std::result::Result<&str, Utf8Error>>,
) -> Option<RollbackSignal> {
    match payload {
        Some(Ok(json_str)) => match decode_signal(json_str) {
            Ok(signal) => Some(signal),
            Err(e) => {
                warn!("Skipping malformed rollback signal: {}", e);
                None
            }
        },
        Some(Err(e)) => {
            error!("Error parsing payload: {}", e);
            None
        }
        None => {
            warn!("Skipping rollback message without payload");
            None
        }
    }
}

/// Parses a rollback signal, rejecting ids and quantities no order can have.
pub fn decode_signal(payload: &str) -> Result<RollbackSignal> {
    let signal: RollbackSignal = serde_json::from_str(payload)?;
    if signal.goods_id <= 0 || signal.num <= 0 {
        anyhow::bail!(
            "invalid rollback signal for goods {} with quantity {}",
            signal.goods_id,
            signal.num
        );
    }
    Ok(signal)
}
