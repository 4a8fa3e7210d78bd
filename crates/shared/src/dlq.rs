//! 死信队列
//!
//! 结账消息在达到最大投递次数后仍无法处理时，由传输适配层转发到死信 topic，
//! 随后确认原消息，避免坏消息无限重投阻塞分区。
//! 死信信封保留原始负载和最后一次失败原因，供人工排查后重放。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::error::OrderError;
use crate::kafka::{ConsumerMessage, KafkaProducer};

/// 放弃一条消息后的去向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbandonOutcome {
    /// 消息已退回，稍后会被重新投递
    Requeued,
    /// 投递次数耗尽，消息已转入死信 topic
    DeadLettered,
}

/// 死信消息信封
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterMessage {
    pub message_id: String,
    pub source_topic: String,
    pub source_partition: i32,
    pub source_offset: i64,
    /// 原始负载，非 UTF-8 时做有损转换
    pub payload: String,
    /// 最后一次处理失败的原因
    pub error: String,
    pub delivery_count: u32,
    pub max_delivery_count: u32,
    pub dead_lettered_at: DateTime<Utc>,
    pub source_service: String,
}

impl DeadLetterMessage {
    pub fn from_message(
        msg: &ConsumerMessage,
        error: impl Into<String>,
        max_delivery_count: u32,
        source_service: impl Into<String>,
    ) -> Self {
        Self {
            message_id: msg.message_id(),
            source_topic: msg.topic.clone(),
            source_partition: msg.partition,
            source_offset: msg.offset,
            payload: String::from_utf8_lossy(&msg.payload).into_owned(),
            error: error.into(),
            delivery_count: msg.delivery_count,
            max_delivery_count,
            dead_lettered_at: Utc::now(),
            source_service: source_service.into(),
        }
    }
}

/// 判断消息是否已耗尽投递次数
///
/// `max_delivery_count` 为 0 时永不进入死信。
pub fn delivery_exhausted(delivery_count: u32, max_delivery_count: u32) -> bool {
    max_delivery_count > 0 && delivery_count >= max_delivery_count
}

/// DLQ 生产者
#[derive(Clone)]
pub struct DlqProducer {
    producer: KafkaProducer,
    topic: String,
    source_service: String,
}

impl DlqProducer {
    pub fn new(producer: KafkaProducer, topic: &str, source_service: &str) -> Self {
        Self {
            producer,
            topic: topic.to_string(),
            source_service: source_service.to_string(),
        }
    }

    /// 将消息包装为死信信封后发送
    pub async fn send(
        &self,
        msg: &ConsumerMessage,
        reason: &str,
        max_delivery_count: u32,
    ) -> Result<(), OrderError> {
        let envelope =
            DeadLetterMessage::from_message(msg, reason, max_delivery_count, &self.source_service);

        warn!(
            message_id = %envelope.message_id,
            delivery_count = envelope.delivery_count,
            dlq_topic = %self.topic,
            "消息投递次数耗尽，转入死信队列"
        );

        self.producer
            .send_json(&self.topic, &envelope.message_id, &envelope)
            .await
            .map(|_| ())
            .inspect_err(|e| {
                error!(
                    message_id = %envelope.message_id,
                    error = %e,
                    "发送死信失败，消息将继续重投"
                );
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn make_message(delivery_count: u32) -> ConsumerMessage {
        ConsumerMessage {
            topic: "checkoutmessagetopic".to_string(),
            partition: 2,
            offset: 57,
            key: Some("cart-9".to_string()),
            payload: br#"{"UserId":"u-1"}"#.to_vec(),
            timestamp: None,
            headers: HashMap::new(),
            delivery_count,
        }
    }

    #[test]
    fn test_delivery_exhausted() {
        assert!(!delivery_exhausted(1, 3));
        assert!(!delivery_exhausted(2, 3));
        assert!(delivery_exhausted(3, 3));
        assert!(delivery_exhausted(4, 3));
        // 0 表示无限重投
        assert!(!delivery_exhausted(1_000, 0));
    }

    #[test]
    fn test_dead_letter_envelope_keeps_source_metadata() {
        let msg = make_message(10);
        let envelope = DeadLetterMessage::from_message(&msg, "订单持久化失败", 10, "order-service");

        assert_eq!(envelope.message_id, "cart-9");
        assert_eq!(envelope.source_topic, "checkoutmessagetopic");
        assert_eq!(envelope.source_partition, 2);
        assert_eq!(envelope.source_offset, 57);
        assert_eq!(envelope.payload, r#"{"UserId":"u-1"}"#);
        assert_eq!(envelope.delivery_count, 10);
        assert_eq!(envelope.error, "订单持久化失败");

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["sourceTopic"], "checkoutmessagetopic");
        assert_eq!(json["maxDeliveryCount"], 10);
    }
}
