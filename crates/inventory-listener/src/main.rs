//! 库存事件监听服务
//!
//! 每个监听器使用独立的消费组与消费 pump，共享一个生产者用于发布死信。
//! 任一 pump 因订阅流不可恢复而退出时，整个进程以非零状态退出，交给进程管理器重启。

use std::sync::Arc;

use anyhow::Context;
use event_pipeline::{ConsumerError, RecordPublisher};
use inventory_listener::listeners::{
    ListenerPorts, PRODUCTS_IMPORTED_LISTENER, UNIT_UNSUITABLE_LISTENER, products_imported_pump,
    unit_unsuitable_pump,
};
use inventory_listener::store::InMemoryInventory;
use pipeline_shared::config::{AppConfig, ListenerConfig};
use pipeline_shared::kafka::{KafkaConsumer, KafkaProducer};
use pipeline_shared::observability;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info};

const SERVICE_NAME: &str = "inventory-listener";

type PumpResult = (String, Result<(), ConsumerError>);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load(SERVICE_NAME).context("加载配置失败")?;

    let obs_config = config
        .observability
        .clone()
        .with_service_name(&config.service_name);
    let _guard = observability::init(&obs_config).await?;

    info!(
        service = %config.service_name,
        environment = %config.environment,
        brokers = %config.kafka.brokers,
        "Starting inventory-listener..."
    );

    let publisher: Arc<dyn RecordPublisher> = Arc::new(KafkaProducer::new(&config.kafka)?);
    let inventory = Arc::new(InMemoryInventory::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut pumps: JoinSet<PumpResult> = JoinSet::new();

    let listener = config.listener(UNIT_UNSUITABLE_LISTENER)?.clone();
    let ports = kafka_ports(&config, UNIT_UNSUITABLE_LISTENER, &listener, publisher.clone())?;
    let pump = unit_unsuitable_pump(listener, ports, inventory.clone())?;
    let rx = shutdown_rx.clone();
    pumps.spawn(async move { (pump.name().to_string(), pump.run(rx).await) });

    let listener = config.listener(PRODUCTS_IMPORTED_LISTENER)?.clone();
    let ports = kafka_ports(&config, PRODUCTS_IMPORTED_LISTENER, &listener, publisher.clone())?;
    let pump = products_imported_pump(listener, ports, inventory.clone())?;
    let rx = shutdown_rx.clone();
    pumps.spawn(async move { (pump.name().to_string(), pump.run(rx).await) });

    let mut failed = Vec::new();

    tokio::select! {
        _ = shutdown_signal() => {}
        Some(joined) = pumps.join_next() => {
            // pump 只会在订阅流不可恢复时提前退出
            failed.extend(check_pump(joined));
        }
    }

    let _ = shutdown_tx.send(true);
    while let Some(joined) = pumps.join_next().await {
        failed.extend(check_pump(joined));
    }

    if !failed.is_empty() {
        anyhow::bail!("监听器异常退出: {}", failed.join(", "));
    }

    info!("Service shutdown complete");
    Ok(())
}

/// 为监听器创建独立消费组的消费者并订阅其 topic
fn kafka_ports(
    config: &AppConfig,
    name: &str,
    listener: &ListenerConfig,
    publisher: Arc<dyn RecordPublisher>,
) -> anyhow::Result<ListenerPorts> {
    let consumer = Arc::new(KafkaConsumer::new(
        &config.kafka,
        Some(name),
        listener.ack_mode,
    )?);
    consumer.subscribe(&[listener.topic.as_str()])?;

    Ok(ListenerPorts {
        source: consumer.clone(),
        committer: consumer,
        publisher,
    })
}

/// 返回异常退出的监听器名称
fn check_pump(joined: Result<PumpResult, JoinError>) -> Option<String> {
    match joined {
        Ok((name, Ok(()))) => {
            info!(listener = %name, "监听器已停止");
            None
        }
        Ok((name, Err(e))) => {
            error!(listener = %name, error = %e, "监听器因致命错误退出");
            Some(name)
        }
        Err(e) => {
            error!(error = %e, "监听器任务异常终止");
            Some("unknown".to_string())
        }
    }
}

/// 优雅关闭信号处理
///
/// 监听 Ctrl+C 和 SIGTERM 信号
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
