//! 积分对账服务专用错误类型
//!
//! 在共享库 LoyaltyError 基础上定义对账管道特有的错误变体。
//! 除 Cancelled 与 Startup 外，所有错误都只影响单个订单：
//! worker 记录日志后跳过，订单保持待处理状态，由下一轮轮询重试。

use loyalty_shared::error::LoyaltyError;

/// 对账管道错误
#[derive(Debug, thiserror::Error)]
pub enum AccrualError {
    /// 核算系统尚未登记该订单（HTTP 204），属于预期情况
    #[error("核算系统中不存在订单: {order_id}")]
    OrderNotFound { order_id: String },

    /// 核算系统限流（HTTP 429），限流器已按新的速率重新配置
    #[error("核算系统限流: 每分钟最多 {limit} 次请求")]
    RateLimited { limit: u32 },

    /// 响应体无法解析为约定的结构
    #[error("核算系统响应格式错误: {0}")]
    MalformedResponse(String),

    /// 429 响应体不符合 "No more than %d requests per minute allowed" 模板
    #[error("无法解析限流响应: {0}")]
    ThrottleParse(String),

    /// 核算系统返回其他 4xx/5xx
    #[error("核算系统返回错误: status={status}, body={body}")]
    RemoteError { status: u16, body: String },

    /// 网络错误或单次请求超时
    #[error("核算系统请求失败: {0}")]
    Transport(#[from] reqwest::Error),

    /// 订单回写失败，订单保持原待处理状态
    #[error("订单回写失败: {0}")]
    Persistence(#[from] LoyaltyError),

    /// 收到关闭信号
    #[error("对账管道已取消")]
    Cancelled,

    /// worker 队列已关闭，无法继续投递订单
    #[error("worker 队列已关闭: {order_id}")]
    PoolClosed { order_id: String },

    /// 启动阶段无法连接订单存储，交由进程所有者处理
    #[error("对账管道启动失败: {0}")]
    Startup(String),
}

impl AccrualError {
    /// 是否为预期内的跳过（不记录错误日志）
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            Self::OrderNotFound { .. } | Self::RateLimited { .. } | Self::Cancelled
        )
    }

    /// 指标标签
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::OrderNotFound { .. } => "not_found",
            Self::RateLimited { .. } => "rate_limited",
            Self::MalformedResponse(_) => "malformed",
            Self::ThrottleParse(_) => "throttle_parse",
            Self::RemoteError { .. } => "remote_error",
            Self::Transport(_) => "transport",
            Self::Persistence(_) => "persistence",
            Self::Cancelled => "cancelled",
            Self::PoolClosed { .. } => "pool_closed",
            Self::Startup(_) => "startup",
        }
    }
}
