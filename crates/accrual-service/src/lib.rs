//! 积分对账服务
//!
//! 后台轮询处于 NEW / PROCESSING 状态的订单，向外部积分核算系统查询核算结果，
//! 并把终态（INVALID / PROCESSED）或进度（PROCESSING）回写到订单存储。
//!
//! - `dispatcher`：轮询与整批屏障，拥有唯一的重试节奏
//! - `pool`：固定数量的 worker，唯一的并发边界
//! - `client`：带自适应限流的核算系统 HTTP 客户端
//! - `store`：订单存储抽象与 PostgreSQL 实现

pub mod client;
pub mod dispatcher;
pub mod error;
pub mod models;
pub mod pool;
pub mod rate_limiter;
pub mod shutdown;
pub mod store;

pub use client::{AccrualClient, HttpAccrualClient};
pub use dispatcher::Dispatcher;
pub use error::AccrualError;
pub use models::{AccrualDecision, AccrualResponse, OrderStatus};
pub use pool::{BatchBarrier, WorkerPool};
pub use store::{OrderStore, PgOrderStore};
