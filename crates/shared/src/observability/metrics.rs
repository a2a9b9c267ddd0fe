//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use std::net::SocketAddr;

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
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

    register_pipeline_metrics(&config.service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle {
        _server_handle: server_handle,
    })
}

/// 注册消费管道指标描述，出现在 /metrics 端点的 HELP 注释中
fn register_pipeline_metrics(service_name: &str) {
    metrics::describe_counter!(
        "pipeline_records_total",
        "Records that reached a terminal outcome"
    );
    metrics::describe_histogram!(
        "pipeline_record_duration_seconds",
        "Time from receipt to acknowledgment"
    );
    metrics::describe_counter!("pipeline_retries_total", "Handler retry attempts");
    metrics::describe_counter!(
        "pipeline_dead_letters_total",
        "Records quarantined to a dead-letter topic"
    );
    metrics::describe_counter!(
        "pipeline_dlq_publish_failures_total",
        "Dead-letter publishes that failed and were dropped"
    );
    metrics::describe_counter!(
        "pipeline_commit_failures_total",
        "Offset commits that failed"
    );
    metrics::describe_gauge!(
        "pipeline_inflight_records",
        "Records queued or processing in the worker pool"
    );
    metrics::describe_counter!(
        "pipeline_stream_errors_total",
        "Errors while polling the subscription stream"
    );
    metrics::describe_counter!(
        "pipeline_fatal_errors_total",
        "Pumps stopped by unrecoverable stream failures"
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
// 便捷的指标记录函数
// ============================================================================

/// 记录一条消息的终态
#[inline]
pub fn record_outcome(topic: &str, outcome: &'static str, duration_secs: f64) {
    metrics::counter!(
        "pipeline_records_total",
        "topic" => topic.to_string(),
        "outcome" => outcome
    )
    .increment(1);

    metrics::histogram!(
        "pipeline_record_duration_seconds",
        "topic" => topic.to_string()
    )
    .record(duration_secs);
}

#[inline]
pub fn record_retry(topic: &str) {
    metrics::counter!("pipeline_retries_total", "topic" => topic.to_string()).increment(1);
}

#[inline]
pub fn record_dead_letter(topic: &str, reason: &'static str) {
    metrics::counter!(
        "pipeline_dead_letters_total",
        "topic" => topic.to_string(),
        "reason" => reason
    )
    .increment(1);
}

#[inline]
pub fn record_dlq_publish_failure(topic: &str) {
    metrics::counter!("pipeline_dlq_publish_failures_total", "topic" => topic.to_string())
        .increment(1);
}

#[inline]
pub fn record_commit_failure(topic: &str) {
    metrics::counter!("pipeline_commit_failures_total", "topic" => topic.to_string()).increment(1);
}

#[inline]
pub fn set_inflight(topic: &str, inflight: usize) {
    metrics::gauge!("pipeline_inflight_records", "topic" => topic.to_string()).set(inflight as f64);
}

#[inline]
pub fn record_stream_error(topic: &str) {
    metrics::counter!("pipeline_stream_errors_total", "topic" => topic.to_string()).increment(1);
}

/// 致命错误需要告警，单独计数
#[inline]
pub fn record_fatal_error(topic: &str) {
    metrics::counter!("pipeline_fatal_errors_total", "topic" => topic.to_string()).increment(1);
}
