//! 订单服务
//!
//! 消费购物车服务发布的结账事件，将其转换为订单聚合并写入数据库，
//! 随后向支付处理服务发布支付请求。仅在订单落库且支付请求发布成功后才确认消息，
//! 其余情况交由 broker 重投（至少一次投递，不做去重）。

pub mod consumer;
pub mod error;
pub mod models;
pub mod publisher;
pub mod repository;
pub mod transformer;
pub mod transport;
