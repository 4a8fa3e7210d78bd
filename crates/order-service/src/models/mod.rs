//! 数据模型
//!
//! - `checkout`: 入站结账事件
//! - `order`: 持久化的订单聚合
//! - `payment`: 出站支付请求事件

mod checkout;
mod order;
mod payment;

pub use checkout::{CartDetail, CartProduct, CheckoutHeader};
pub use order::{OrderDetail, OrderHeader};
pub use payment::PaymentRequestMessage;
