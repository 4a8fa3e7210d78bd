//! 订单服务入口
//!
//! 组装 Kafka 订阅、订单仓储与支付请求发布器，启动结账消息管道，
//! 收到退出信号后停止管道并释放资源。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use order_shared::{
    config::AppConfig, database::Database, dlq::DlqProducer, error::OrderError,
    kafka::KafkaProducer, observability,
};
use tokio::signal;
use tracing::{error, info, warn};

use order_service::{
    consumer::{CheckoutConsumer, ConsumerSettings},
    publisher::KafkaPaymentPublisher,
    repository::OrderRepository,
    transport::KafkaSubscriptionClient,
};

const SERVICE_NAME: &str = "order-service";
const PRODUCER_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // 1. 加载配置；失败原因要等可观测性初始化后才能输出
    let (config, load_error) = load_config();

    // 2. 可观测性
    let obs_config = config
        .observability
        .clone()
        .with_service_name(&config.service_name);
    let _guard = observability::init(&obs_config).await?;
    if let Some(e) = load_error {
        warn!(error = %e, "加载配置失败，使用默认配置");
    }

    info!(environment = %config.environment, "正在启动订单服务");

    // 3. 数据库
    let db = Database::connect(&config.database).await?;
    db.health_check().await?;
    db.run_migrations().await?;
    let order_repo = Arc::new(OrderRepository::new(db.pool().clone()));
    info!("订单仓储已就绪");

    // 4. Kafka 生产者：支付请求与死信共用
    let producer = KafkaProducer::new(&config.kafka)?;
    let publisher = Arc::new(KafkaPaymentPublisher::new(producer.clone()));
    let messaging = &config.messaging;
    let dead_letter = DlqProducer::new(
        producer.clone(),
        &messaging.dead_letter_topic,
        &config.service_name,
    );
    let client = Arc::new(KafkaSubscriptionClient::new(
        config.kafka.clone(),
        Some(dead_letter),
        messaging.max_delivery_count,
    ));

    // 5. 启动消息管道
    let consumer = CheckoutConsumer::new(
        client,
        order_repo,
        publisher,
        ConsumerSettings::from_config(messaging),
    );
    consumer.start().await?;

    shutdown_signal().await;

    // 6. 停止管道后再释放下游资源
    if let Err(e) = consumer.stop().await {
        error!(error = %e, "停止消息管道时出错");
    }
    if let Err(e) = producer.flush(PRODUCER_FLUSH_TIMEOUT) {
        warn!(error = %e, "退出前刷出生产者缓冲失败");
    }
    db.close().await;

    info!("订单服务已退出");
    Ok(())
}

/// 加载配置，失败时回退到默认值并把错误交还调用方记录
fn load_config() -> (AppConfig, Option<OrderError>) {
    match AppConfig::load(SERVICE_NAME) {
        Ok(config) => (config, None),
        Err(e) => {
            let config = AppConfig {
                service_name: SERVICE_NAME.to_string(),
                ..AppConfig::default()
            };
            (config, Some(OrderError::from(e)))
        }
    }
}

/// 优雅关闭信号处理
///
/// 监听 Ctrl+C 和 SIGTERM 信号，用于 Kubernetes 优雅关闭
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "无法监听 Ctrl+C 信号");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "无法监听 SIGTERM 信号");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BAD_ENV: &str = "ORDER_MESSAGING__MAX_CONCURRENT_CALLS";

    #[test]
    fn test_config_failure_falls_back_and_keeps_error() {
        // SAFETY: 本二进制内只有这个测试读写该环境变量
        unsafe { std::env::set_var(BAD_ENV, "not-a-number") };
        let (config, load_error) = load_config();
        unsafe { std::env::remove_var(BAD_ENV) };

        assert!(matches!(load_error, Some(OrderError::Config(_))));
        assert_eq!(config.service_name, SERVICE_NAME);
        assert_eq!(config.messaging.max_concurrent_calls, 8);
    }
}
