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

use super::ObservabilityConfig;

/// Metrics 资源守卫
pub struct MetricsHandle {
    _server_handle: tokio::task::JoinHandle<()>,
}

/// 初始化 Prometheus 指标导出
///
/// 启动一个独立的 HTTP 服务器在指定端口暴露 `/metrics` 端点。
pub async fn init(config: &ObservabilityConfig) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    register_common_metrics(&config.service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle {
        _server_handle: server_handle,
    })
}

/// 注册对账管道的指标描述
fn register_common_metrics(service_name: &str) {
    metrics::describe_counter!(
        "accrual_lookups_total",
        "Total number of accrual authority lookups by outcome"
    );
    metrics::describe_histogram!(
        "accrual_lookup_duration_seconds",
        "Accrual authority lookup duration in seconds"
    );
    metrics::describe_counter!(
        "accrual_order_updates_total",
        "Total number of order status updates written by the pipeline"
    );
    metrics::describe_counter!("accrual_batches_total", "Total number of dispatched batches");
    metrics::describe_histogram!("accrual_batch_size", "Number of orders per dispatched batch");
    metrics::describe_gauge!(
        "accrual_rate_limit_rpm",
        "Requests per minute currently permitted by the accrual authority"
    );

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

/// 启动指标 HTTP 服务器
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
// 便捷的指标记录函数
// ============================================================================

/// 记录一次核算查询及其结果（success / not_found / rate_limited / ...）
#[inline]
pub fn record_accrual_lookup(outcome: &str, duration_secs: f64) {
    metrics::counter!(
        "accrual_lookups_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);

    metrics::histogram!(
        "accrual_lookup_duration_seconds",
        "outcome" => outcome.to_string()
    )
    .record(duration_secs);
}

/// 记录订单状态回写
#[inline]
pub fn record_order_update(status: &str, success: bool) {
    metrics::counter!(
        "accrual_order_updates_total",
        "status" => status.to_string(),
        "result" => if success { "ok" } else { "error" }
    )
    .increment(1);
}

/// 记录一次批次派发
#[inline]
pub fn record_batch(size: usize) {
    metrics::counter!("accrual_batches_total").increment(1);
    metrics::histogram!("accrual_batch_size").record(size as f64);
}

/// 更新核算系统当前允许的每分钟请求数
#[inline]
pub fn set_rate_limit_rpm(rpm: u32) {
    metrics::gauge!("accrual_rate_limit_rpm").set(rpm as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_functions_do_not_panic() {
        // 即使没有初始化 recorder，这些函数也不应该 panic
        record_accrual_lookup("success", 0.1);
        record_accrual_lookup("rate_limited", 0.02);
        record_order_update("PROCESSED", true);
        record_order_update("INVALID", false);
        record_batch(20);
        set_rate_limit_rpm(60);
    }
}
