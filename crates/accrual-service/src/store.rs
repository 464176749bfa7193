//! 订单存储接口
//!
//! 对账管道只需要订单存储的两个能力：拉取待处理订单号、回写核算结果。
//! 通过 OrderStore trait 依赖抽象，测试时可注入 mock 或内存实现。

use async_trait::async_trait;
use loyalty_shared::database::Database;
use loyalty_shared::error::{LoyaltyError, Result};
use tracing::debug;

use crate::models::OrderStatus;

/// 订单存储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// 最多返回 `limit` 个处于 NEW / PROCESSING 状态的订单号，不保证顺序
    async fn fetch_pending(&self, limit: usize) -> Result<Vec<String>>;

    /// 覆盖写入订单状态与积分（幂等），订单不存在时返回 NotFound
    async fn update_order(
        &self,
        order_id: &str,
        status: OrderStatus,
        accrual: Option<f64>,
    ) -> Result<()>;

    /// 启动前的连通性检查
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// 基于 PostgreSQL 的订单存储
///
/// 依赖 `orders` 表：id、user_id、status、accrual、created_at、updated_at。
#[derive(Clone)]
pub struct PgOrderStore {
    db: Database,
}

impl PgOrderStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn fetch_pending(&self, limit: usize) -> Result<Vec<String>> {
        let limit = i64::try_from(limit)
            .map_err(|_| LoyaltyError::Validation(format!("limit 超出范围: {limit}")))?;

        let ids = sqlx::query_scalar::<_, String>(
            r#"
            SELECT id
            FROM orders
            WHERE status IN ($1, $2)
            LIMIT $3
            "#,
        )
        .bind(OrderStatus::New)
        .bind(OrderStatus::Processing)
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;

        debug!(count = ids.len(), limit, "拉取待处理订单");
        Ok(ids)
    }

    async fn update_order(
        &self,
        order_id: &str,
        status: OrderStatus,
        accrual: Option<f64>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET status = $2, accrual = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(order_id)
        .bind(status)
        .bind(accrual)
        .execute(self.db.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(LoyaltyError::NotFound {
                entity: "Order".to_string(),
                id: order_id.to_string(),
            });
        }

        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.db.health_check().await
    }
}
