//! 订单仓储（PostgreSQL）
//!
//! 订单头与明细在同一事务内写入，要么全部可见，要么全部回滚。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use order_shared::error::Result;
use rust_decimal::Decimal;
use sqlx::{PgConnection, PgPool};

use super::traits::OrderRepositoryTrait;
use crate::models::{OrderDetail, OrderHeader};

pub struct OrderRepository {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct OrderHeaderRow {
    order_header_id: i64,
    user_id: String,
    coupon_code: Option<String>,
    order_total: Decimal,
    discount_total: Decimal,
    first_name: Option<String>,
    last_name: Option<String>,
    pickup_date_time: Option<DateTime<Utc>>,
    order_time: DateTime<Utc>,
    phone: Option<String>,
    email: Option<String>,
    card_number: Option<String>,
    cvv: Option<String>,
    expiry_month_year: Option<String>,
    cart_total_items: i32,
    payment_status: bool,
}

#[derive(sqlx::FromRow)]
struct OrderDetailRow {
    order_details_id: i64,
    order_header_id: i64,
    product_id: i64,
    product_name: String,
    price: Decimal,
    count: i32,
}

impl OrderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 在事务中写入订单头，返回数据库分配的 ID
    async fn insert_header_in_tx(tx: &mut PgConnection, order: &OrderHeader) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO order_headers (user_id, coupon_code, order_total, discount_total,
                                       first_name, last_name, pickup_date_time, order_time,
                                       phone, email, card_number, cvv, expiry_month_year,
                                       cart_total_items, payment_status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            RETURNING order_header_id
            "#,
        )
        .bind(&order.user_id)
        .bind(&order.coupon_code)
        .bind(order.order_total)
        .bind(order.discount_total)
        .bind(&order.first_name)
        .bind(&order.last_name)
        .bind(order.pickup_date_time)
        .bind(order.order_time)
        .bind(&order.phone)
        .bind(&order.email)
        .bind(&order.card_number)
        .bind(&order.cvv)
        .bind(&order.expiry_month_year)
        .bind(order.cart_total_items)
        .bind(order.payment_status)
        .fetch_one(tx)
        .await?;

        Ok(id)
    }

    /// 在事务中写入一行明细，`line_no` 从 1 开始，用于还原明细顺序
    async fn insert_detail_in_tx(
        tx: &mut PgConnection,
        order_header_id: i64,
        line_no: i32,
        detail: &OrderDetail,
    ) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO order_details (order_header_id, line_no, product_id, product_name,
                                       price, count)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING order_details_id
            "#,
        )
        .bind(order_header_id)
        .bind(line_no)
        .bind(detail.product_id)
        .bind(&detail.product_name)
        .bind(detail.price)
        .bind(detail.count)
        .fetch_one(tx)
        .await?;

        Ok(id)
    }

    /// 按 ID 读取订单及其明细
    pub async fn get_order(&self, order_header_id: i64) -> Result<Option<OrderHeader>> {
        let header = sqlx::query_as::<_, OrderHeaderRow>(
            r#"
            SELECT order_header_id, user_id, coupon_code, order_total, discount_total,
                   first_name, last_name, pickup_date_time, order_time, phone, email,
                   card_number, cvv, expiry_month_year, cart_total_items, payment_status
            FROM order_headers
            WHERE order_header_id = $1
            "#,
        )
        .bind(order_header_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(header) = header else {
            return Ok(None);
        };

        let details = sqlx::query_as::<_, OrderDetailRow>(
            r#"
            SELECT order_details_id, order_header_id, product_id, product_name, price, count
            FROM order_details
            WHERE order_header_id = $1
            ORDER BY line_no ASC
            "#,
        )
        .bind(order_header_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(OrderHeader {
            order_header_id: Some(header.order_header_id),
            user_id: header.user_id,
            coupon_code: header.coupon_code,
            order_total: header.order_total,
            discount_total: header.discount_total,
            first_name: header.first_name,
            last_name: header.last_name,
            pickup_date_time: header.pickup_date_time,
            order_time: header.order_time,
            phone: header.phone,
            email: header.email,
            card_number: header.card_number,
            cvv: header.cvv,
            expiry_month_year: header.expiry_month_year,
            cart_total_items: header.cart_total_items,
            payment_status: header.payment_status,
            order_details: details
                .into_iter()
                .map(|row| OrderDetail {
                    order_details_id: Some(row.order_details_id),
                    order_header_id: Some(row.order_header_id),
                    product_id: row.product_id,
                    product_name: row.product_name,
                    price: row.price,
                    count: row.count,
                })
                .collect(),
        }))
    }
}

#[async_trait]
impl OrderRepositoryTrait for OrderRepository {
    async fn add_order(&self, order: &OrderHeader) -> Result<OrderHeader> {
        let mut tx = self.pool.begin().await?;

        let order_header_id = Self::insert_header_in_tx(&mut *tx, order).await?;

        let mut persisted = order.clone();
        persisted.order_header_id = Some(order_header_id);
        for (idx, detail) in persisted.order_details.iter_mut().enumerate() {
            let line_no = i32::try_from(idx + 1).unwrap_or(i32::MAX);
            let detail_id =
                Self::insert_detail_in_tx(&mut *tx, order_header_id, line_no, detail).await?;
            detail.order_details_id = Some(detail_id);
            detail.order_header_id = Some(order_header_id);
        }

        tx.commit().await?;

        tracing::debug!(
            order_header_id,
            lines = persisted.order_details.len(),
            "订单已写入数据库"
        );
        Ok(persisted)
    }
}
