//! 结账事件
//!
//! 上游购物车服务在用户结账时发布的消息，字段名为 PascalCase。
//! 字符串字段上游可能写 null，因此统一建模为 `Option`；
//! `CartDetails` 是结构性字段，缺失即视为负载损坏。

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// 结账事件头
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CheckoutHeader {
    #[serde(default)]
    pub cart_header_id: i64,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub coupon_code: Option<String>,
    pub order_total: Decimal,
    #[serde(default)]
    pub discount_total: Decimal,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default, with = "flexible_datetime")]
    pub pickup_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub card_number: Option<String>,
    #[serde(default, rename = "CVV")]
    pub cvv: Option<String>,
    #[serde(default)]
    pub expiry_month_year: Option<String>,
    /// 上游自报的商品件数，仅作参考，订单中的件数总是重新计算
    #[serde(default)]
    pub cart_total_items: i32,
    pub cart_details: Vec<CartDetail>,
}

/// 购物车行
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CartDetail {
    #[serde(default)]
    pub cart_details_id: i64,
    #[serde(default)]
    pub cart_header_id: i64,
    pub product_id: i64,
    pub product: CartProduct,
    pub count: i32,
}

/// 购物车行内嵌的商品快照
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CartProduct {
    #[serde(default)]
    pub product_id: i64,
    #[serde(default)]
    pub name: String,
    pub price: Decimal,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category_name: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
}

/// 兼容带时区（RFC 3339）和不带时区的时间字符串
///
/// 上游序列化器对未指定时区的时间不写偏移量，这类时间按 UTC 解释。
mod flexible_datetime {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(dt) => serializer.serialize_str(&dt.to_rfc3339()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let Some(raw) = Option::<String>::deserialize(deserializer)? else {
            return Ok(None);
        };

        if let Ok(dt) = DateTime::parse_from_rfc3339(&raw) {
            return Ok(Some(dt.with_timezone(&Utc)));
        }

        raw.parse::<NaiveDateTime>()
            .map(|naive| Some(naive.and_utc()))
            .map_err(|e| D::Error::custom(format!("无法解析时间 {raw:?}: {e}")))
    }
}
