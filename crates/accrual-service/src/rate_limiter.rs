//! 自适应限流器
//!
//! 核算系统通过 429 告知允许的每分钟请求数，客户端据此重建限流器。
//!
//! - `SlidingWindowLimiter`：任意连续 60 秒窗口内最多放行 `limit` 次请求
//! - `AdaptiveRateLimiter`：持有当前速率与限流器，只暴露"速率变化时重建"与"获取许可"两个操作
//!
//! 速率状态由单个 Mutex 保护，临界区只做读取和替换；
//! 等待许可在锁外进行，不会把无关的调用方串行化。

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::AccrualError;
use crate::shutdown::{is_shutdown, wait_for_shutdown};

/// 限流窗口长度
const WINDOW: Duration = Duration::from_secs(60);

/// 滑动窗口限流器
///
/// 记录窗口内每次放行的时间点，窗口已满时计算最早一次放行离开窗口所需的等待时间。
pub struct SlidingWindowLimiter {
    limit: u32,
    window: Duration,
    grants: Mutex<VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    /// 每分钟最多放行 `limit` 次
    pub fn per_minute(limit: u32) -> Self {
        Self::new(limit, WINDOW)
    }

    pub fn new(limit: u32, window: Duration) -> Self {
        let limit = limit.max(1);
        Self {
            limit,
            window,
            grants: Mutex::new(VecDeque::with_capacity(limit as usize)),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// 尝试立即获取许可，失败时返回需要等待的时长
    fn try_acquire(&self) -> Result<(), Duration> {
        let now = Instant::now();
        let mut grants = self.grants.lock();

        while let Some(&oldest) = grants.front() {
            if oldest + self.window <= now {
                grants.pop_front();
            } else {
                break;
            }
        }

        if grants.len() < self.limit as usize {
            grants.push_back(now);
            return Ok(());
        }

        // 窗口已满，front 必然存在
        let oldest = grants.front().copied().unwrap_or(now);
        Err((oldest + self.window).saturating_duration_since(now))
    }

    /// 等待直到获得许可，收到关闭信号时返回 `Cancelled`
    pub async fn acquire(&self, shutdown: &watch::Receiver<bool>) -> Result<(), AccrualError> {
        if is_shutdown(shutdown) {
            return Err(AccrualError::Cancelled);
        }

        let mut shutdown = shutdown.clone();
        loop {
            let wait = match self.try_acquire() {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };

            debug!(limit = self.limit, wait_ms = wait.as_millis() as u64, "等待限流许可");

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = wait_for_shutdown(&mut shutdown) => return Err(AccrualError::Cancelled),
            }
        }
    }
}

/// 当前生效的速率配置
struct RateState {
    requests_per_minute: u32,
    limiter: Arc<SlidingWindowLimiter>,
}

/// 根据核算系统的限流响应自我调整的限流器
///
/// 初始不限流；收到第一次 429 之后才会创建限流器。
#[derive(Default)]
pub struct AdaptiveRateLimiter {
    state: Mutex<Option<RateState>>,
}

impl AdaptiveRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前允许的每分钟请求数，未限流时为 None
    pub fn requests_per_minute(&self) -> Option<u32> {
        self.state.lock().as_ref().map(|s| s.requests_per_minute)
    }

    /// 当前限流器句柄
    pub fn current(&self) -> Option<Arc<SlidingWindowLimiter>> {
        self.state.lock().as_ref().map(|s| s.limiter.clone())
    }

    /// 速率发生变化时重建限流器，返回是否发生了替换
    ///
    /// 相同速率的重复 429 不会重置已有的许可计数。
    pub fn reconfigure(&self, requests_per_minute: u32) -> bool {
        let mut state = self.state.lock();

        if let Some(current) = state.as_ref()
            && current.requests_per_minute == requests_per_minute
        {
            return false;
        }

        let previous = state.as_ref().map(|s| s.requests_per_minute);
        *state = Some(RateState {
            requests_per_minute,
            limiter: Arc::new(SlidingWindowLimiter::per_minute(requests_per_minute)),
        });
        drop(state);

        info!(
            previous_rpm = ?previous,
            requests_per_minute,
            "核算系统限流速率已更新"
        );
        loyalty_shared::observability::metrics::set_rate_limit_rpm(requests_per_minute);

        true
    }

    /// 获取一次请求许可；未配置限流器时立即返回
    pub async fn acquire(&self, shutdown: &watch::Receiver<bool>) -> Result<(), AccrualError> {
        // 锁内只克隆 Arc，等待在锁外进行
        let limiter = self.current();
        match limiter {
            Some(limiter) => limiter.acquire(shutdown).await,
            None => Ok(()),
        }
    }
}
