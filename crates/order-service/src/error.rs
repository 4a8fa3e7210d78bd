//! 订单消息管道错误类型
//!
//! 单条消息的处理错误（负载损坏、校验失败、持久化失败、发布失败）只影响该消息，
//! 结果都是"不确认、交给 broker 重投"；传输层错误只记录不影响消费者状态。

use order_shared::error::OrderError;

use crate::consumer::ConsumerState;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// 负载无法解码或缺少结构性字段
    #[error("消息负载无法解析: {0}")]
    MalformedPayload(String),

    /// 负载可以解码但缺少必填的业务字段
    #[error("结账事件校验失败: {0}")]
    Validation(String),

    #[error("订单持久化失败: {0}")]
    Persistence(#[source] OrderError),

    /// 订单已落库但支付请求未发出，重投时会重新走完整流程
    #[error("支付请求发布失败: {0}")]
    Publish(#[source] OrderError),

    /// 与具体消息无关的连接或订阅错误
    #[error("传输层错误: {0}")]
    Transport(String),

    /// 流程顺序被破坏，正常调用路径下不可达
    #[error("不变量被破坏: {0}")]
    InvariantViolation(String),

    #[error("消费者状态为 {current}，该操作要求 {expected}")]
    InvalidState {
        current: ConsumerState,
        expected: ConsumerState,
    },

    #[error(transparent)]
    Shared(#[from] OrderError),
}

impl PipelineError {
    /// 稳定的结果标签，用于日志字段和指标
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::MalformedPayload(_) => "malformed_payload",
            Self::Validation(_) => "validation",
            Self::Persistence(_) => "persistence",
            Self::Publish(_) => "publish",
            Self::Transport(_) => "transport",
            Self::InvariantViolation(_) => "invariant_violation",
            Self::InvalidState { .. } => "invalid_state",
            Self::Shared(_) => "internal",
        }
    }
}
