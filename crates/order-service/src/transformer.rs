//! 事件转换
//!
//! 结账事件 -> 订单聚合 -> 支付请求事件的纯映射，不做任何 I/O。
//!
//! 必填字段：
//! - `UserId` 非空白
//! - `CartDetails` 至少一行
//! - 每行 `Count >= 1` 且商品名称非空白
//!
//! 文本长度与金额精度必须落在订单表的列定义之内（见 `migrations/`），
//! 超出的负载在这里就判为校验失败，避免写库时被截断、舍入或反复重试。
//!
//! `CartDetails` 整体缺失或类型不匹配在解码阶段即失败，不会进入这里。

use chrono::Utc;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::models::{CartDetail, CheckoutHeader, OrderDetail, OrderHeader, PaymentRequestMessage};

/// 金额列为 `NUMERIC(18, 2)`
const MONEY_SCALE: u32 = 2;
const MONEY_MAX_MANTISSA: i64 = 999_999_999_999_999_999;

/// 由结账事件构造待持久化的订单聚合
///
/// 头部字段原样复制；明细逐行一一映射，保持顺序；
/// 商品件数由明细数量累加得出，不采信上游的 `CartTotalItems`。
pub fn to_order_header(checkout: &CheckoutHeader) -> Result<OrderHeader, PipelineError> {
    let user_id = checkout
        .user_id
        .as_deref()
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| PipelineError::Validation("缺少用户标识 UserId".to_string()))?;

    check_len("UserId", Some(user_id), 128)?;
    check_len("CouponCode", checkout.coupon_code.as_deref(), 64)?;
    check_len("FirstName", checkout.first_name.as_deref(), 128)?;
    check_len("LastName", checkout.last_name.as_deref(), 128)?;
    check_len("Phone", checkout.phone.as_deref(), 32)?;
    check_len("Email", checkout.email.as_deref(), 256)?;
    check_len("CardNumber", checkout.card_number.as_deref(), 32)?;
    check_len("CVV", checkout.cvv.as_deref(), 8)?;
    check_len("ExpiryMonthYear", checkout.expiry_month_year.as_deref(), 16)?;
    check_money("OrderTotal", checkout.order_total)?;
    check_money("DiscountTotal", checkout.discount_total)?;

    if checkout.cart_details.is_empty() {
        return Err(PipelineError::Validation("购物车明细为空".to_string()));
    }

    let mut order_details = Vec::with_capacity(checkout.cart_details.len());
    let mut cart_total_items: i32 = 0;

    for (idx, line) in checkout.cart_details.iter().enumerate() {
        let detail = to_order_detail(idx, line)?;
        cart_total_items = cart_total_items
            .checked_add(detail.count)
            .ok_or_else(|| PipelineError::Validation("商品总件数溢出".to_string()))?;
        order_details.push(detail);
    }

    Ok(OrderHeader {
        order_header_id: None,
        user_id: user_id.to_owned(),
        coupon_code: checkout.coupon_code.clone(),
        order_total: checkout.order_total,
        discount_total: checkout.discount_total,
        first_name: checkout.first_name.clone(),
        last_name: checkout.last_name.clone(),
        pickup_date_time: checkout.pickup_date_time,
        order_time: Utc::now(),
        phone: checkout.phone.clone(),
        email: checkout.email.clone(),
        card_number: checkout.card_number.clone(),
        cvv: checkout.cvv.clone(),
        expiry_month_year: checkout.expiry_month_year.clone(),
        cart_total_items,
        payment_status: false,
        order_details,
    })
}

fn to_order_detail(idx: usize, line: &CartDetail) -> Result<OrderDetail, PipelineError> {
    if line.count < 1 {
        return Err(PipelineError::Validation(format!(
            "第 {} 行商品数量非法: {}",
            idx + 1,
            line.count
        )));
    }
    if line.product.name.trim().is_empty() {
        return Err(PipelineError::Validation(format!(
            "第 {} 行缺少商品名称",
            idx + 1
        )));
    }
    check_len(&format!("第 {} 行商品名称", idx + 1), Some(&line.product.name), 256)?;
    check_money(&format!("第 {} 行商品单价", idx + 1), line.product.price)?;

    Ok(OrderDetail {
        order_details_id: None,
        order_header_id: None,
        product_id: line.product_id,
        product_name: line.product.name.clone(),
        price: line.product.price,
        count: line.count,
    })
}

/// 文本按字符计数，与 `VARCHAR(n)` 一致
fn check_len(field: &str, value: Option<&str>, max: usize) -> Result<(), PipelineError> {
    match value {
        Some(v) if v.chars().count() > max => Err(PipelineError::Validation(format!(
            "{field} 超过 {max} 个字符"
        ))),
        _ => Ok(()),
    }
}

fn check_money(field: &str, value: Decimal) -> Result<(), PipelineError> {
    if value.normalize().scale() > MONEY_SCALE {
        return Err(PipelineError::Validation(format!(
            "{field} 小数位超过 {MONEY_SCALE} 位: {value}"
        )));
    }
    if value.abs() > Decimal::new(MONEY_MAX_MANTISSA, MONEY_SCALE) {
        return Err(PipelineError::Validation(format!(
            "{field} 超出金额范围: {value}"
        )));
    }
    Ok(())
}

/// 由已持久化的订单构造支付请求
///
/// 订单尚未分配 ID 时返回 `InvariantViolation`。
pub fn to_payment_request(order: &OrderHeader) -> Result<PaymentRequestMessage, PipelineError> {
    let order_id = order.order_header_id.ok_or_else(|| {
        PipelineError::InvariantViolation("订单尚未持久化，不能构造支付请求".to_string())
    })?;

    Ok(PaymentRequestMessage {
        id: Uuid::now_v7(),
        message_created: Utc::now(),
        order_id,
        name: order.full_name(),
        card_number: order.card_number.clone(),
        cvv: order.cvv.clone(),
        expiry_month_year: order.expiry_month_year.clone(),
        order_total: order.order_total,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CartProduct;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn line(product_id: i64, name: &str, price: Decimal, count: i32) -> CartDetail {
        CartDetail {
            cart_details_id: 0,
            cart_header_id: 0,
            product_id,
            product: CartProduct {
                product_id,
                name: name.to_string(),
                price,
                description: None,
                category_name: None,
                image_url: None,
            },
            count,
        }
    }

    fn checkout(lines: Vec<CartDetail>) -> CheckoutHeader {
        CheckoutHeader {
            cart_header_id: 1,
            user_id: Some("user-001".to_string()),
            coupon_code: Some("10OFF".to_string()),
            order_total: dec!(42.50),
            discount_total: dec!(10),
            first_name: Some("Ada".to_string()),
            last_name: Some("Lovelace".to_string()),
            pickup_date_time: None,
            phone: Some("555-0100".to_string()),
            email: Some("ada@example.com".to_string()),
            card_number: Some("4111111111111111".to_string()),
            cvv: Some("123".to_string()),
            expiry_month_year: Some("12/27".to_string()),
            // 上游自报值与真实件数不一致，应被忽略
            cart_total_items: 99,
            cart_details: lines,
        }
    }

    #[test]
    fn test_two_lines_sum_quantities() {
        let event = checkout(vec![
            line(7, "Samosa", dec!(12.50), 3),
            line(9, "Lassi", dec!(5), 1),
        ]);

        let order = to_order_header(&event).unwrap();

        assert_eq!(order.cart_total_items, 4);
        assert_eq!(order.order_details.len(), 2);
        assert_eq!(order.order_total, dec!(42.50));
        assert_eq!(order.discount_total, dec!(10));
        assert!(!order.payment_status);
        assert!(order.order_header_id.is_none());
        assert_eq!(order.coupon_code.as_deref(), Some("10OFF"));
        assert_eq!(order.email.as_deref(), Some("ada@example.com"));
    }

    #[test]
    fn test_lines_map_one_to_one_in_order() {
        let lines = vec![
            line(3, "Idli", dec!(2.25), 2),
            line(1, "Vada", dec!(1.75), 5),
            line(3, "Idli", dec!(2.25), 1),
        ];
        let event = checkout(lines.clone());

        let order = to_order_header(&event).unwrap();

        // 同一商品出现两次也不合并
        assert_eq!(order.order_details.len(), lines.len());
        for (detail, source) in order.order_details.iter().zip(&lines) {
            assert_eq!(detail.product_id, source.product_id);
            assert_eq!(detail.product_name, source.product.name);
            assert_eq!(detail.price, source.product.price);
            assert_eq!(detail.count, source.count);
        }
        assert_eq!(
            i64::from(order.cart_total_items),
            order.computed_total_items()
        );
    }

    #[test]
    fn test_missing_user_id_is_validation_error() {
        let mut event = checkout(vec![line(1, "Dosa", dec!(5), 1)]);
        event.user_id = None;
        assert!(matches!(
            to_order_header(&event),
            Err(PipelineError::Validation(_))
        ));

        event.user_id = Some("   ".to_string());
        assert!(matches!(
            to_order_header(&event),
            Err(PipelineError::Validation(_))
        ));
    }

    #[test]
    fn test_user_id_is_copied_verbatim() {
        let mut event = checkout(vec![line(1, "Dosa", dec!(5), 1)]);
        event.user_id = Some("  user-001 ".to_string());

        let order = to_order_header(&event).unwrap();

        assert_eq!(order.user_id, "  user-001 ");
    }

    #[test]
    fn test_overlong_text_is_validation_error() {
        let mut event = checkout(vec![line(1, "Dosa", dec!(5), 1)]);
        event.cvv = Some("123456789".to_string());
        let err = to_order_header(&event).unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
        assert!(err.to_string().contains("CVV"));

        let mut event = checkout(vec![line(1, &"a".repeat(257), dec!(5), 1)]);
        assert!(matches!(
            to_order_header(&event),
            Err(PipelineError::Validation(_))
        ));

        // 按字符而非字节计数
        event.cart_details = vec![line(1, &"饼".repeat(256), dec!(5), 1)];
        event.user_id = Some("用".repeat(128));
        assert!(to_order_header(&event).is_ok());
    }

    #[test]
    fn test_money_beyond_column_precision_is_validation_error() {
        let mut event = checkout(vec![line(1, "Dosa", dec!(5), 1)]);
        event.order_total = dec!(42.505);
        let err = to_order_header(&event).unwrap_err();
        assert!(err.to_string().contains("OrderTotal"));

        // 末尾的 0 不影响精度
        event.order_total = dec!(42.500);
        assert!(to_order_header(&event).is_ok());

        let event = checkout(vec![line(1, "Dosa", dec!(5.125), 1)]);
        let err = to_order_header(&event).unwrap_err();
        assert!(err.to_string().contains("第 1 行商品单价"));

        let mut event = checkout(vec![line(1, "Dosa", dec!(5), 1)]);
        event.discount_total = dec!(10000000000000000);
        assert!(matches!(
            to_order_header(&event),
            Err(PipelineError::Validation(_))
        ));
    }

    #[test]
    fn test_empty_cart_is_validation_error() {
        let event = checkout(vec![]);
        assert!(matches!(
            to_order_header(&event),
            Err(PipelineError::Validation(_))
        ));
    }

    #[test]
    fn test_non_positive_count_is_validation_error() {
        let event = checkout(vec![line(1, "Dosa", dec!(5), 1), line(2, "Uttapam", dec!(6), 0)]);
        let err = to_order_header(&event).unwrap_err();
        assert!(err.to_string().contains("第 2 行"));
    }

    #[test]
    fn test_blank_product_name_is_validation_error() {
        let event = checkout(vec![line(1, " ", dec!(5), 1)]);
        assert!(matches!(
            to_order_header(&event),
            Err(PipelineError::Validation(_))
        ));
    }

    #[test]
    fn test_quantity_overflow_is_validation_error() {
        let event = checkout(vec![
            line(1, "Dosa", dec!(5), i32::MAX),
            line(2, "Vada", dec!(1), 1),
        ]);
        assert!(matches!(
            to_order_header(&event),
            Err(PipelineError::Validation(_))
        ));
    }

    #[test]
    fn test_payment_request_from_persisted_order() {
        let event = checkout(vec![line(7, "Samosa", dec!(12.50), 3), line(9, "Lassi", dec!(5), 1)]);
        let mut order = to_order_header(&event).unwrap();
        order.order_header_id = Some(1001);

        let payment = to_payment_request(&order).unwrap();

        assert_eq!(payment.order_id, 1001);
        assert_eq!(payment.order_total, dec!(42.50));
        assert_eq!(payment.name, "Ada Lovelace");
        assert_eq!(payment.card_number.as_deref(), Some("4111111111111111"));
        assert_eq!(payment.cvv.as_deref(), Some("123"));
        assert_eq!(payment.expiry_month_year.as_deref(), Some("12/27"));
    }

    #[test]
    fn test_payment_request_requires_identity() {
        let event = checkout(vec![line(1, "Dosa", dec!(5), 1)]);
        let order = to_order_header(&event).unwrap();

        assert!(matches!(
            to_payment_request(&order),
            Err(PipelineError::InvariantViolation(_))
        ));
    }
}
