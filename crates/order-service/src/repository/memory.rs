//! 内存订单仓储
//!
//! 用于本地联调和集成测试，ID 从 1 开始单调递增，明细 ID 同理。

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use async_trait::async_trait;
use order_shared::error::{OrderError, Result};
use parking_lot::Mutex;

use super::traits::OrderRepositoryTrait;
use crate::models::OrderHeader;

#[derive(Default)]
pub struct InMemoryOrderRepository {
    next_header_id: AtomicI64,
    next_detail_id: AtomicI64,
    orders: Mutex<Vec<OrderHeader>>,
    /// 接下来这么多次写入直接返回可重试的数据库类错误
    failures_remaining: AtomicU32,
}

impl InMemoryOrderRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// 让接下来的 `count` 次 `add_order` 失败
    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    pub fn orders(&self) -> Vec<OrderHeader> {
        self.orders.lock().clone()
    }

    pub fn get(&self, order_header_id: i64) -> Option<OrderHeader> {
        self.orders
            .lock()
            .iter()
            .find(|o| o.order_header_id == Some(order_header_id))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.orders.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.lock().is_empty()
    }

    fn take_failure(&self) -> bool {
        self.failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl OrderRepositoryTrait for InMemoryOrderRepository {
    async fn add_order(&self, order: &OrderHeader) -> Result<OrderHeader> {
        if self.take_failure() {
            return Err(OrderError::ExternalServiceTimeout {
                service: "order-store".to_string(),
            });
        }

        let order_header_id = self.next_header_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut persisted = order.clone();
        persisted.order_header_id = Some(order_header_id);
        for detail in &mut persisted.order_details {
            detail.order_details_id = Some(self.next_detail_id.fetch_add(1, Ordering::SeqCst) + 1);
            detail.order_header_id = Some(order_header_id);
        }

        self.orders.lock().push(persisted.clone());
        Ok(persisted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderDetail;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn order(lines: usize) -> OrderHeader {
        OrderHeader {
            order_header_id: None,
            user_id: "user-1".to_string(),
            coupon_code: None,
            order_total: dec!(10),
            discount_total: dec!(0),
            first_name: None,
            last_name: None,
            pickup_date_time: None,
            order_time: Utc::now(),
            phone: None,
            email: None,
            card_number: None,
            cvv: None,
            expiry_month_year: None,
            cart_total_items: lines as i32,
            payment_status: false,
            order_details: (0..lines)
                .map(|i| OrderDetail {
                    order_details_id: None,
                    order_header_id: None,
                    product_id: i as i64,
                    product_name: format!("p{i}"),
                    price: dec!(1),
                    count: 1,
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_assigns_distinct_ids() {
        let repo = InMemoryOrderRepository::new();

        let first = repo.add_order(&order(2)).await.unwrap();
        let second = repo.add_order(&order(1)).await.unwrap();

        assert_eq!(first.order_header_id, Some(1));
        assert_eq!(second.order_header_id, Some(2));
        assert!(first
            .order_details
            .iter()
            .all(|d| d.order_header_id == Some(1) && d.order_details_id.is_some()));
        assert_eq!(second.order_details[0].order_details_id, Some(3));
        assert_eq!(repo.len(), 2);
        assert_eq!(repo.get(2).unwrap().order_details.len(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures_are_retryable_and_persist_nothing() {
        let repo = InMemoryOrderRepository::new();
        repo.fail_next(1);

        let err = repo.add_order(&order(1)).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(repo.is_empty());

        assert!(repo.add_order(&order(1)).await.is_ok());
        assert_eq!(repo.len(), 1);
    }
}
