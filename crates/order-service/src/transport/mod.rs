//! 消息传输抽象
//!
//! 消息管道只看到"订阅 -> 接收 -> 确认/放弃 -> 关闭"这组操作，
//! 具体的 broker（Kafka、内存）在此之下实现。

mod kafka;
mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use order_shared::dlq::AbandonOutcome;
use order_shared::kafka::ConsumerMessage;

use crate::error::PipelineError;

pub use kafka::KafkaSubscriptionClient;
pub use memory::{InMemoryBroker, InMemorySubscription};

/// 订阅工厂，启动管道时调用一次
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SubscriptionClient: Send + Sync {
    async fn subscribe(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<Arc<dyn Subscription>, PipelineError>;
}

/// 一个打开的订阅
///
/// 所有方法可被多个处理任务并发调用。
#[async_trait]
pub trait Subscription: Send + Sync {
    /// 等待下一条投递
    ///
    /// 订阅关闭后返回 `None`；`Some(Err(_))` 表示与具体消息无关的传输错误，
    /// 调用方应记录后继续接收。实现必须可安全取消。
    async fn receive(&self) -> Option<Result<ConsumerMessage, PipelineError>>;

    /// 确认消息，broker 不再投递它
    async fn complete(&self, msg: &ConsumerMessage) -> Result<(), PipelineError>;

    /// 放弃消息，交由 broker 重投或转入死信
    async fn abandon(
        &self,
        msg: &ConsumerMessage,
        reason: &str,
    ) -> Result<AbandonOutcome, PipelineError>;

    /// 释放订阅资源，重复调用无副作用
    async fn close(&self) -> Result<(), PipelineError>;
}
