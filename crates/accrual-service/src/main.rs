//! 积分对账 worker
//!
//! 加载配置、初始化可观测性与数据库连接后启动对账调度器，
//! 收到 SIGTERM 或 Ctrl+C 时等待在途订单完成再退出。

use std::sync::Arc;

use accrual_service::{AccrualError, Dispatcher, HttpAccrualClient, PgOrderStore};
use loyalty_shared::{config::AppConfig, database::Database, observability};
use tokio::sync::watch;
use tracing::{error, info, warn};

const SERVICE_NAME: &str = "accrual-service";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 统一加载配置：从 config/{service_name}.toml 加载，包含可观测性配置
    let (config, load_error) = match AppConfig::load(SERVICE_NAME) {
        Ok(config) => (config, None),
        Err(e) => (AppConfig::for_service(SERVICE_NAME), Some(e)),
    };

    let obs_config = config
        .observability
        .clone()
        .with_service_name(&config.service_name);
    let _guard = observability::init(&obs_config).await?;

    // 日志初始化之后才能输出加载失败的原因
    if let Some(e) = load_error {
        warn!(code = e.code(), error = %e, "配置加载失败，使用默认配置");
    }

    info!(
        base_url = %config.accrual.base_url,
        pool_size = config.accrual.pool_size,
        "Starting accrual-service"
    );

    let db = Database::connect(&config.database).await?;
    let store = Arc::new(PgOrderStore::new(db.clone()));
    let client = Arc::new(HttpAccrualClient::new(
        &config.accrual.base_url,
        config.accrual.request_timeout(),
    )?);
    let dispatcher = Dispatcher::from_config(client, store, &config.accrual);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let result = match dispatcher.run(shutdown_rx).await {
        Ok(()) | Err(AccrualError::Cancelled) => Ok(()),
        Err(e) => {
            error!(error = %e, "对账调度器异常退出");
            Err(e.into())
        }
    };

    db.close().await;
    info!("accrual-service shutdown complete");

    result
}

/// 监听关闭信号
///
/// K8s 通过 SIGTERM 通知 Pod 停止；本地开发通过 Ctrl+C。
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "注册 Ctrl+C 处理器失败");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "注册 SIGTERM 处理器失败");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown..."),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown..."),
    }
}
