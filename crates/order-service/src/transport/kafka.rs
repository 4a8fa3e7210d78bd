//! Kafka 传输实现
//!
//! 订阅名映射为消费组；确认即存储 offset，放弃即回退分区位置。

use std::sync::Arc;

use async_trait::async_trait;
use order_shared::config::KafkaConfig;
use order_shared::dlq::{AbandonOutcome, DlqProducer};
use order_shared::error::OrderError;
use order_shared::kafka::{ConsumerMessage, KafkaSubscription};

use super::{Subscription, SubscriptionClient};
use crate::error::PipelineError;

fn transport_error(err: OrderError) -> PipelineError {
    PipelineError::Transport(err.to_string())
}

pub struct KafkaSubscriptionClient {
    config: KafkaConfig,
    dead_letter: Option<DlqProducer>,
    max_delivery_count: u32,
}

impl KafkaSubscriptionClient {
    pub fn new(
        config: KafkaConfig,
        dead_letter: Option<DlqProducer>,
        max_delivery_count: u32,
    ) -> Self {
        Self {
            config,
            dead_letter,
            max_delivery_count,
        }
    }
}

#[async_trait]
impl SubscriptionClient for KafkaSubscriptionClient {
    async fn subscribe(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<Arc<dyn Subscription>, PipelineError> {
        let inner = KafkaSubscription::open(
            &self.config,
            topic,
            subscription,
            self.dead_letter.clone(),
            self.max_delivery_count,
        )
        .map_err(transport_error)?;
        Ok(Arc::new(inner))
    }
}

#[async_trait]
impl Subscription for KafkaSubscription {
    async fn receive(&self) -> Option<Result<ConsumerMessage, PipelineError>> {
        if self.is_closed() {
            return None;
        }
        Some(self.recv().await.map_err(transport_error))
    }

    async fn complete(&self, msg: &ConsumerMessage) -> Result<(), PipelineError> {
        self.ack(msg).map_err(transport_error)
    }

    async fn abandon(
        &self,
        msg: &ConsumerMessage,
        reason: &str,
    ) -> Result<AbandonOutcome, PipelineError> {
        KafkaSubscription::abandon(self, msg, reason)
            .await
            .map_err(transport_error)
    }

    async fn close(&self) -> Result<(), PipelineError> {
        KafkaSubscription::close(self).map_err(transport_error)
    }
}
