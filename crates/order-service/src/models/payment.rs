//! 支付请求事件
//!
//! 订单持久化后发往支付处理服务，字段名与下游约定为 PascalCase。

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PaymentRequestMessage {
    /// 事件唯一标识，便于下游追踪
    pub id: Uuid,
    pub message_created: DateTime<Utc>,
    pub order_id: i64,
    pub name: String,
    pub card_number: Option<String>,
    #[serde(rename = "CVV")]
    pub cvv: Option<String>,
    pub expiry_month_year: Option<String>,
    /// 下游按数值解析金额
    #[serde(with = "rust_decimal::serde::float")]
    pub order_total: Decimal,
}

impl PaymentRequestMessage {
    /// 消息 key，同一订单的事件落在同一分区
    pub fn key(&self) -> String {
        self.order_id.to_string()
    }
}
