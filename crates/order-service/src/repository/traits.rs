//! 仓储 Trait 定义
//!
//! 消息管道只依赖抽象，便于 mock 测试和替换存储实现。

use async_trait::async_trait;
use order_shared::error::Result;

use crate::models::OrderHeader;

/// 订单仓储接口
///
/// 实现方需自行保证并发调用 `add_order` 的安全性。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderRepositoryTrait: Send + Sync {
    /// 持久化订单头及其全部明细，返回分配了 ID 的订单
    async fn add_order(&self, order: &OrderHeader) -> Result<OrderHeader>;
}
