//! 对账调度器
//!
//! 轮询订单存储中的待处理订单，整批交给 worker 池处理，
//! 并在整批完成之后才拉取下一批。
//!
//! 状态流转：
//! - Polling：拉取至多 `pool_size` 个待处理订单号；拉取失败或结果为空时固定等待后重试
//! - Dispatching：投递整批订单并等待批次屏障归零，随后回到 Polling
//! - Stopping：收到关闭信号后等待在途订单完成，关闭 worker 池并返回 `Cancelled`

use std::sync::Arc;
use std::time::Duration;

use loyalty_shared::config::AccrualConfig;
use loyalty_shared::observability::metrics;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::client::AccrualClient;
use crate::error::AccrualError;
use crate::pool::WorkerPool;
use crate::shutdown::{is_shutdown, wait_for_shutdown};
use crate::store::OrderStore;

/// 对账调度器
///
/// 调度器只与订单存储和 worker 池交互，从不直接调用核算系统。
pub struct Dispatcher {
    client: Arc<dyn AccrualClient>,
    store: Arc<dyn OrderStore>,
    pool_size: usize,
    poll_interval: Duration,
}

impl Dispatcher {
    pub fn new(
        client: Arc<dyn AccrualClient>,
        store: Arc<dyn OrderStore>,
        pool_size: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            client,
            store,
            pool_size: pool_size.max(1),
            poll_interval,
        }
    }

    pub fn from_config(
        client: Arc<dyn AccrualClient>,
        store: Arc<dyn OrderStore>,
        config: &AccrualConfig,
    ) -> Self {
        Self::new(client, store, config.pool_size, config.poll_interval())
    }

    /// 主循环，直到收到关闭信号或启动失败
    ///
    /// 正常关闭时返回 `Err(AccrualError::Cancelled)`，返回前所有 worker 均已退出。
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), AccrualError> {
        self.store
            .ping()
            .await
            .map_err(|e| AccrualError::Startup(format!("订单存储不可用: {e}")))?;

        let pool = WorkerPool::start(
            self.pool_size,
            self.client.clone(),
            self.store.clone(),
            shutdown.clone(),
        );

        info!(
            pool_size = self.pool_size,
            poll_interval = ?self.poll_interval,
            "对账调度器已启动"
        );

        let mut stop = shutdown.clone();
        loop {
            if is_shutdown(&shutdown) {
                break;
            }

            match self.store.fetch_pending(self.pool_size).await {
                Ok(order_ids) if !order_ids.is_empty() => {
                    self.dispatch_batch(&pool, order_ids).await;
                    continue;
                }
                Ok(_) => debug!("暂无待处理订单"),
                Err(e) => error!(
                    code = e.code(),
                    retryable = e.is_retryable(),
                    error = %e,
                    "拉取待处理订单失败"
                ),
            }

            // 空结果与拉取失败使用同一个固定间隔
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = wait_for_shutdown(&mut stop) => break,
            }
        }

        info!(
            in_flight = pool.barrier().pending(),
            "收到关闭信号，等待在途订单完成"
        );
        pool.shutdown().await;
        info!("对账调度器已停止");

        Err(AccrualError::Cancelled)
    }

    /// 投递整批订单并等待全部完成
    async fn dispatch_batch(&self, pool: &WorkerPool, order_ids: Vec<String>) {
        let batch_size = order_ids.len();
        metrics::record_batch(batch_size);
        debug!(batch_size, "分发待处理订单");

        for order_id in order_ids {
            if let Err(e) = pool.submit(order_id).await {
                warn!(error = %e, "投递订单失败，放弃本批剩余订单");
                break;
            }
        }

        pool.wait_drained().await;
        debug!(batch_size, "本批订单处理完成");
    }
}
