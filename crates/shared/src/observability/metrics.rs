//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::config::ObservabilityConfig;

/// Metrics 资源守卫，drop 时停止指标 HTTP 服务
pub struct MetricsHandle {
    server_handle: tokio::task::JoinHandle<()>,
}

impl Drop for MetricsHandle {
    fn drop(&mut self) {
        self.server_handle.abort();
    }
}

/// 初始化 Prometheus 指标导出
///
/// 启动一个独立的 HTTP 服务器在指定端口暴露 `/metrics` 与 `/health`。
pub async fn init(config: &ObservabilityConfig) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    register_pipeline_metrics(&config.service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle { server_handle })
}

/// 描述消息管道的业务指标，描述会出现在 /metrics 的 HELP 注释中
fn register_pipeline_metrics(service_name: &str) {
    metrics::describe_counter!(
        "checkout_messages_total",
        "Checkout messages handled, labelled by outcome"
    );
    metrics::describe_histogram!(
        "checkout_processing_duration_seconds",
        "Time from delivery to complete/abandon of a checkout message"
    );
    metrics::describe_counter!("orders_created_total", "Orders persisted by the pipeline");
    metrics::describe_counter!(
        "payment_requests_published_total",
        "Payment request events published"
    );
    metrics::describe_counter!(
        "transport_errors_total",
        "Transport level errors not tied to a message"
    );
    metrics::describe_counter!(
        "messages_dead_lettered_total",
        "Messages forwarded to the dead letter topic"
    );

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

async fn start_metrics_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", get(|| async { "OK" }));

    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(server_handle)
}

// ============================================================================
// 指标记录函数
// ============================================================================

/// 记录一条结账消息的最终结果（completed / 各类失败）
#[inline]
pub fn record_checkout_message(outcome: &str, duration_secs: f64) {
    metrics::counter!("checkout_messages_total", "outcome" => outcome.to_string()).increment(1);
    metrics::histogram!(
        "checkout_processing_duration_seconds",
        "outcome" => outcome.to_string()
    )
    .record(duration_secs);
}

#[inline]
pub fn record_order_created() {
    metrics::counter!("orders_created_total").increment(1);
}

#[inline]
pub fn record_payment_request_published(topic: &str) {
    metrics::counter!("payment_requests_published_total", "topic" => topic.to_string())
        .increment(1);
}

#[inline]
pub fn record_transport_error() {
    metrics::counter!("transport_errors_total").increment(1);
}

#[inline]
pub fn record_dead_letter(topic: &str) {
    metrics::counter!("messages_dead_lettered_total", "topic" => topic.to_string()).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_functions_do_not_panic() {
        // 没有安装 recorder 时，记录操作是空操作
        record_checkout_message("completed", 0.05);
        record_checkout_message("persistence", 0.2);
        record_order_created();
        record_payment_request_published("orderpaymentprocesstopic");
        record_transport_error();
        record_dead_letter("checkoutmessagetopic");
    }
}
