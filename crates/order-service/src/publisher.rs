//! 支付请求发布
//!
//! 以订单 ID 作为消息 key，同一订单的支付请求落在同一分区。

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use order_shared::error::{OrderError, Result};
use order_shared::kafka::KafkaProducer;
use parking_lot::Mutex;
use tracing::debug;

use crate::models::PaymentRequestMessage;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentRequestPublisher: Send + Sync {
    /// 发布支付请求，返回即代表 broker 已接收
    async fn publish(&self, message: &PaymentRequestMessage, topic: &str) -> Result<()>;
}

/// 基于 Kafka 生产者的发布实现
pub struct KafkaPaymentPublisher {
    producer: KafkaProducer,
}

impl KafkaPaymentPublisher {
    pub fn new(producer: KafkaProducer) -> Self {
        Self { producer }
    }
}

#[async_trait]
impl PaymentRequestPublisher for KafkaPaymentPublisher {
    async fn publish(&self, message: &PaymentRequestMessage, topic: &str) -> Result<()> {
        let (partition, offset) = self
            .producer
            .send_json(topic, &message.key(), message)
            .await?;

        debug!(
            order_id = message.order_id,
            message_id = %message.id,
            topic,
            partition,
            offset,
            "支付请求已发布"
        );
        Ok(())
    }
}

/// 记录所有已发布消息的内存实现
#[derive(Default)]
pub struct InMemoryPaymentPublisher {
    published: Mutex<Vec<(String, PaymentRequestMessage)>>,
    failures_remaining: AtomicU32,
}

impl InMemoryPaymentPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// 让接下来的 `count` 次发布失败
    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// 按发布顺序返回 (topic, message)
    pub fn published(&self) -> Vec<(String, PaymentRequestMessage)> {
        self.published.lock().clone()
    }

    pub fn published_order_ids(&self) -> Vec<i64> {
        self.published.lock().iter().map(|(_, m)| m.order_id).collect()
    }
}

#[async_trait]
impl PaymentRequestPublisher for InMemoryPaymentPublisher {
    async fn publish(&self, message: &PaymentRequestMessage, topic: &str) -> Result<()> {
        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(OrderError::Kafka(format!("发布到 {topic} 失败")));
        }

        self.published
            .lock()
            .push((topic.to_string(), message.clone()));
        Ok(())
    }
}
