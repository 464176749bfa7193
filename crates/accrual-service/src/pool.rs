//! 核算 worker 池
//!
//! 固定数量的 worker 从有界队列中逐个领取订单号，调用核算系统并回写结果。
//! 每个提交的订单都携带一张 `BatchTicket`，ticket 被 drop 时批次计数减一，
//! 因此无论成功、跳过、入队失败还是处理中 panic，每个订单都恰好完成一次计数。

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use futures::FutureExt;
use loyalty_shared::observability::metrics;
use tokio::sync::{Mutex, Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::client::AccrualClient;
use crate::error::AccrualError;
use crate::models::OrderStatus;
use crate::store::OrderStore;

// ---------------------------------------------------------------------------
// BatchBarrier
// ---------------------------------------------------------------------------

/// 批次屏障
///
/// 提交时加一，完成时减一，`wait` 阻塞到计数归零。
#[derive(Default)]
pub struct BatchBarrier {
    pending: AtomicUsize,
    submitted: AtomicU64,
    completed: AtomicU64,
    drained: Notify,
}

impl BatchBarrier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 登记一个待完成的订单
    pub fn ticket(self: &Arc<Self>) -> BatchTicket {
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.submitted.fetch_add(1, Ordering::SeqCst);
        BatchTicket {
            barrier: self.clone(),
        }
    }

    /// 尚未完成的订单数
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// 累计提交数
    #[cfg(test)]
    pub fn submitted_total(&self) -> u64 {
        self.submitted.load(Ordering::SeqCst)
    }

    /// 累计完成数
    #[cfg(test)]
    pub fn completed_total(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    /// 阻塞直到所有已登记的订单完成
    pub async fn wait(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            // 先注册再检查计数，避免错过 notify_waiters
            notified.as_mut().enable();

            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn complete(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }
}

/// 单个订单的完成凭证，drop 时计数减一
pub struct BatchTicket {
    barrier: Arc<BatchBarrier>,
}

impl Drop for BatchTicket {
    fn drop(&mut self) {
        self.barrier.complete();
    }
}

/// 队列中的工作项
struct WorkItem {
    order_id: String,
    _ticket: BatchTicket,
}

// ---------------------------------------------------------------------------
// WorkerPool
// ---------------------------------------------------------------------------

/// 核算 worker 池
///
/// 队列容量与 worker 数相同；Dispatcher 通过 `submit` 投递订单，
/// 通过 `wait_drained` 等待整批完成，最后调用 `shutdown` 关闭队列并回收所有 worker。
pub struct WorkerPool {
    size: usize,
    sender: mpsc::Sender<WorkItem>,
    workers: Vec<JoinHandle<()>>,
    barrier: Arc<BatchBarrier>,
}

impl WorkerPool {
    /// 启动 `size` 个 worker
    pub fn start(
        size: usize,
        client: Arc<dyn AccrualClient>,
        store: Arc<dyn OrderStore>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let size = size.max(1);
        let (sender, receiver) = mpsc::channel(size);
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..size)
            .map(|worker_id| {
                let worker = Worker {
                    id: worker_id,
                    queue: receiver.clone(),
                    client: client.clone(),
                    store: store.clone(),
                    shutdown: shutdown.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        info!(pool_size = size, "核算 worker 池已启动");

        Self {
            size,
            sender,
            workers,
            barrier: BatchBarrier::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn barrier(&self) -> Arc<BatchBarrier> {
        self.barrier.clone()
    }

    /// 投递一个订单，队列满时等待
    ///
    /// 队列已关闭时返回错误，此时 ticket 随工作项一起被 drop，计数不会泄漏。
    pub async fn submit(&self, order_id: String) -> Result<(), AccrualError> {
        let item = WorkItem {
            order_id,
            _ticket: self.barrier.ticket(),
        };

        self.sender
            .send(item)
            .await
            .map_err(|e| AccrualError::PoolClosed {
                order_id: e.0.order_id.clone(),
            })
    }

    /// 等待所有已投递订单处理完成
    pub async fn wait_drained(&self) {
        self.barrier.wait().await;
    }

    /// 等待在途订单完成，关闭队列并回收所有 worker
    pub async fn shutdown(self) {
        self.barrier.wait().await;

        let Self {
            sender, workers, ..
        } = self;
        drop(sender);

        for (worker_id, handle) in workers.into_iter().enumerate() {
            if let Err(e) = handle.await {
                error!(worker = worker_id, error = %e, "worker 任务异常退出");
            }
        }

        info!("核算 worker 池已关闭");
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

struct Worker {
    id: usize,
    queue: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
    client: Arc<dyn AccrualClient>,
    store: Arc<dyn OrderStore>,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    /// 逐个领取订单直到队列关闭
    ///
    /// 已领取的订单一定处理完毕；关闭期间等待限流许可的查询会立即以 Cancelled 结束。
    async fn run(self) {
        debug!(worker = self.id, "worker 已启动");

        loop {
            let item = {
                let mut queue = self.queue.lock().await;
                queue.recv().await
            };
            let Some(item) = item else {
                break;
            };

            let result = AssertUnwindSafe(self.handle(&item.order_id))
                .catch_unwind()
                .await;

            if let Err(panic) = result {
                error!(
                    worker = self.id,
                    order_id = %item.order_id,
                    panic = %panic_message(panic.as_ref()),
                    "处理订单时发生 panic"
                );
            }
            // item 在此 drop，ticket 完成计数
        }

        debug!(worker = self.id, "worker 已退出");
    }

    /// 处理单个订单，所有错误都在此处消化
    async fn handle(&self, order_id: &str) {
        debug!(worker = self.id, order_id, "处理订单");

        match process_order(self.client.as_ref(), self.store.as_ref(), &self.shutdown, order_id)
            .await
        {
            Ok(status) => {
                debug!(worker = self.id, order_id, status = %status, "订单核算结果已回写");
            }
            Err(e) if e.is_expected() => {
                debug!(worker = self.id, order_id, reason = %e, "订单暂不可核算，等待下一轮");
            }
            Err(AccrualError::Persistence(e)) => {
                error!(worker = self.id, order_id, code = e.code(), error = %e, "回写订单失败");
            }
            Err(e) => {
                error!(worker = self.id, order_id, error = %e, "查询订单核算结果失败");
            }
        }
    }
}

/// 查询核算结果并回写订单
///
/// 返回写入的状态；任何错误都不会重试，订单保持原待处理状态。
pub async fn process_order(
    client: &dyn AccrualClient,
    store: &dyn OrderStore,
    shutdown: &watch::Receiver<bool>,
    order_id: &str,
) -> Result<OrderStatus, AccrualError> {
    let start = Instant::now();
    let lookup = client.lookup(shutdown, order_id).await;
    let elapsed = start.elapsed().as_secs_f64();

    let decision = match lookup {
        Ok(decision) => {
            metrics::record_accrual_lookup("success", elapsed);
            decision
        }
        Err(e) => {
            metrics::record_accrual_lookup(e.outcome(), elapsed);
            return Err(e);
        }
    };

    if decision.order_id != order_id {
        warn!(
            order_id,
            response_order = %decision.order_id,
            "核算响应中的订单号与请求不一致，以请求订单号为准"
        );
    }

    let written = store
        .update_order(order_id, decision.status, decision.accrual)
        .await;
    metrics::record_order_update(decision.status.as_str(), written.is_ok());
    written?;

    Ok(decision.status)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockAccrualClient;
    use crate::models::AccrualDecision;
    use crate::store::MockOrderStore;
    use loyalty_shared::error::LoyaltyError;
    use std::time::Duration;

    fn processed(order_id: &str, accrual: f64) -> AccrualDecision {
        AccrualDecision {
            order_id: order_id.to_string(),
            status: OrderStatus::Processed,
            accrual: Some(accrual),
        }
    }

    #[tokio::test]
    async fn test_barrier_wait_returns_immediately_when_empty() {
        let barrier = BatchBarrier::new();
        barrier.wait().await;
        assert_eq!(barrier.pending(), 0);
    }

    #[tokio::test]
    async fn test_ticket_completes_exactly_once() {
        let barrier = BatchBarrier::new();
        let first = barrier.ticket();
        let second = barrier.ticket();
        assert_eq!(barrier.pending(), 2);

        drop(first);
        assert_eq!(barrier.pending(), 1);

        let waiter = {
            let barrier = barrier.clone();
            tokio::spawn(async move { barrier.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(second);
        waiter.await.unwrap();
        assert_eq!(barrier.submitted_total(), 2);
        assert_eq!(barrier.completed_total(), 2);
    }

    #[tokio::test]
    async fn test_processed_decision_updates_store_once() {
        let mut client = MockAccrualClient::new();
        client
            .expect_lookup()
            .withf(|_, order_id| order_id == "123")
            .times(1)
            .returning(|_, _| Ok(processed("123", 500.0)));

        let mut store = MockOrderStore::new();
        store
            .expect_update_order()
            .withf(|order_id, status, accrual| {
                order_id == "123" && *status == OrderStatus::Processed && *accrual == Some(500.0)
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let (_tx, rx) = watch::channel(false);
        let status = process_order(&client, &store, &rx, "123").await.unwrap();
        assert_eq!(status, OrderStatus::Processed);
    }

    #[tokio::test]
    async fn test_not_found_leaves_store_untouched() {
        let mut client = MockAccrualClient::new();
        client.expect_lookup().returning(|_, order_id| {
            Err(AccrualError::OrderNotFound {
                order_id: order_id.to_string(),
            })
        });

        let mut store = MockOrderStore::new();
        store.expect_update_order().never();

        let (_tx, rx) = watch::channel(false);
        let err = process_order(&client, &store, &rx, "12345678903")
            .await
            .unwrap_err();
        assert!(matches!(err, AccrualError::OrderNotFound { .. }));
        assert!(err.is_expected());
    }

    #[tokio::test]
    async fn test_rate_limited_leaves_store_untouched() {
        let mut client = MockAccrualClient::new();
        client
            .expect_lookup()
            .returning(|_, _| Err(AccrualError::RateLimited { limit: 5 }));

        let mut store = MockOrderStore::new();
        store.expect_update_order().never();

        let (_tx, rx) = watch::channel(false);
        let err = process_order(&client, &store, &rx, "1").await.unwrap_err();
        assert!(err.is_expected());
    }

    #[tokio::test]
    async fn test_persistence_failure_is_reported() {
        let mut client = MockAccrualClient::new();
        client
            .expect_lookup()
            .returning(|_, _| Ok(processed("1", 10.0)));

        let mut store = MockOrderStore::new();
        store
            .expect_update_order()
            .times(1)
            .returning(|_, _, _| Err(LoyaltyError::Internal("连接已关闭".to_string())));

        let (_tx, rx) = watch::channel(false);
        let err = process_order(&client, &store, &rx, "1").await.unwrap_err();
        assert!(matches!(err, AccrualError::Persistence(_)));
        assert!(!err.is_expected());
    }

    #[tokio::test]
    async fn test_update_uses_requested_order_id() {
        let mut client = MockAccrualClient::new();
        client
            .expect_lookup()
            .returning(|_, _| Ok(processed("999", 1.0)));

        let mut store = MockOrderStore::new();
        store
            .expect_update_order()
            .withf(|order_id, _, _| order_id == "123")
            .times(1)
            .returning(|_, _, _| Ok(()));

        let (_tx, rx) = watch::channel(false);
        process_order(&client, &store, &rx, "123").await.unwrap();
    }

    /// 按订单号返回固定结果的客户端，"boom" 会在查询时 panic
    struct ScriptedClient;

    #[async_trait::async_trait]
    impl AccrualClient for ScriptedClient {
        async fn lookup(
            &self,
            _shutdown: &watch::Receiver<bool>,
            order_id: &str,
        ) -> Result<AccrualDecision, AccrualError> {
            match order_id {
                "bad" => Err(AccrualError::MalformedResponse("not json".to_string())),
                "boom" => panic!("unexpected payload"),
                id => Ok(processed(id, 1.0)),
            }
        }
    }

    #[tokio::test]
    async fn test_pool_drains_batch_and_survives_errors() {
        let client = ScriptedClient;

        let mut store = MockOrderStore::new();
        store
            .expect_update_order()
            .times(3)
            .returning(|_, _, _| Ok(()));

        let (_tx, rx) = watch::channel(false);
        let pool = WorkerPool::start(2, Arc::new(client), Arc::new(store), rx);
        let barrier = pool.barrier();

        for id in ["a", "bad", "b", "boom", "c"] {
            pool.submit(id.to_string()).await.unwrap();
        }
        pool.wait_drained().await;

        assert_eq!(barrier.submitted_total(), 5);
        assert_eq!(barrier.completed_total(), 5);

        // panic 之后 worker 仍可继续处理
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_pool_size_is_at_least_one() {
        let client = MockAccrualClient::new();
        let store = MockOrderStore::new();
        let (_tx, rx) = watch::channel(false);

        let pool = WorkerPool::start(0, Arc::new(client), Arc::new(store), rx);
        assert_eq!(pool.size(), 1);
        pool.shutdown().await;
    }
}
