//! 订单聚合
//!
//! 订单头独占其订单明细；订单 ID 只能由订单仓储在持久化时分配。

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// 订单头
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderHeader {
    /// 持久化前为 None
    pub order_header_id: Option<i64>,
    pub user_id: String,
    pub coupon_code: Option<String>,
    pub order_total: Decimal,
    pub discount_total: Decimal,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub pickup_date_time: Option<DateTime<Utc>>,
    pub order_time: DateTime<Utc>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub card_number: Option<String>,
    pub cvv: Option<String>,
    pub expiry_month_year: Option<String>,
    /// 所有明细数量之和
    pub cart_total_items: i32,
    /// 支付结果由下游回写，本服务创建时总是 false
    pub payment_status: bool,
    pub order_details: Vec<OrderDetail>,
}

/// 订单明细
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderDetail {
    pub order_details_id: Option<i64>,
    pub order_header_id: Option<i64>,
    pub product_id: i64,
    pub product_name: String,
    pub price: Decimal,
    pub count: i32,
}

impl OrderHeader {
    pub fn is_persisted(&self) -> bool {
        self.order_header_id.is_some()
    }

    /// 名与姓以空格拼接，缺失部分按空串处理
    pub fn full_name(&self) -> String {
        format!(
            "{} {}",
            self.first_name.as_deref().unwrap_or_default(),
            self.last_name.as_deref().unwrap_or_default()
        )
    }

    /// 按明细重新计算商品件数
    pub fn computed_total_items(&self) -> i64 {
        self.order_details.iter().map(|d| i64::from(d.count)).sum()
    }
}
