//! 积分核算系统 HTTP 客户端
//!
//! 通过 AccrualClient trait 抽象核算查询，便于测试时注入 mock 实现。
//! HTTP 实现按核算系统的响应码区分结果：
//! - 200：解析订单核算结果
//! - 204：核算系统尚未登记该订单
//! - 429：解析响应体中的每分钟请求上限，重建限流器
//! - 其他 4xx/5xx：携带状态码与响应体返回

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::StatusCode;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::AccrualError;
use crate::models::{AccrualDecision, AccrualResponse};
use crate::rate_limiter::AdaptiveRateLimiter;
use crate::shutdown::is_shutdown;

/// 429 响应体模板：`No more than %d requests per minute allowed`
static THROTTLE_BODY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^No more than (\d+) requests per minute allowed").expect("限流响应模板正则无效")
});

/// 单次核算请求的默认超时
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Trait 抽象，便于测试时替换为 mock 实现
// ---------------------------------------------------------------------------

/// 核算系统客户端的抽象接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AccrualClient: Send + Sync {
    /// 查询单个订单的核算结果
    ///
    /// 等待限流许可期间收到关闭信号时返回 `Cancelled`；
    /// 已发出的请求不受关闭信号影响，只受单次请求超时约束。
    async fn lookup(
        &self,
        shutdown: &watch::Receiver<bool>,
        order_id: &str,
    ) -> Result<AccrualDecision, AccrualError>;
}

// ---------------------------------------------------------------------------
// HTTP 客户端实现
// ---------------------------------------------------------------------------

/// 核算系统 HTTP 客户端
///
/// reqwest::Client 内部带连接池，多个 worker 共享同一个实例。
pub struct HttpAccrualClient {
    base_url: String,
    http: reqwest::Client,
    request_timeout: Duration,
    limiter: AdaptiveRateLimiter,
}

impl HttpAccrualClient {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, AccrualError> {
        let http = reqwest::Client::builder().build()?;

        info!(
            base_url,
            request_timeout_ms = request_timeout.as_millis() as u64,
            "核算系统客户端已初始化"
        );

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            request_timeout,
            limiter: AdaptiveRateLimiter::new(),
        })
    }

    /// 订单查询地址：`<base>/api/orders/<order_id>`
    pub fn endpoint(&self, order_id: &str) -> String {
        format!("{}/api/orders/{}", self.base_url, order_id)
    }

    /// 自适应限流器（只读访问，用于监控和测试）
    pub fn rate_limiter(&self) -> &AdaptiveRateLimiter {
        &self.limiter
    }
}

#[async_trait]
impl AccrualClient for HttpAccrualClient {
    async fn lookup(
        &self,
        shutdown: &watch::Receiver<bool>,
        order_id: &str,
    ) -> Result<AccrualDecision, AccrualError> {
        if is_shutdown(shutdown) {
            return Err(AccrualError::Cancelled);
        }

        self.limiter.acquire(shutdown).await?;

        let url = self.endpoint(order_id);
        debug!(order_id, url = %url, "查询订单核算结果");

        let response = self
            .http
            .get(&url)
            .timeout(self.request_timeout)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if status == StatusCode::TOO_MANY_REQUESTS {
            let limit = parse_throttle_body(&body)?;
            self.limiter.reconfigure(limit);
            return Err(AccrualError::RateLimited { limit });
        }

        if status.as_u16() >= 400 {
            return Err(AccrualError::RemoteError {
                status: status.as_u16(),
                body,
            });
        }

        if status == StatusCode::NO_CONTENT {
            return Err(AccrualError::OrderNotFound {
                order_id: order_id.to_string(),
            });
        }

        let parsed: AccrualResponse = serde_json::from_str(&body).map_err(|e| {
            AccrualError::MalformedResponse(format!(
                "{e}; status={}, body={body}",
                status.as_u16()
            ))
        })?;

        AccrualDecision::try_from(parsed)
    }
}

/// 从 429 响应体中提取每分钟请求上限
pub fn parse_throttle_body(body: &str) -> Result<u32, AccrualError> {
    let captures = THROTTLE_BODY
        .captures(body)
        .ok_or_else(|| AccrualError::ThrottleParse(format!("响应体不匹配限流模板: {body:?}")))?;

    let limit: u32 = captures[1]
        .parse()
        .map_err(|e| AccrualError::ThrottleParse(format!("{e}: {body:?}")))?;

    if limit == 0 {
        return Err(AccrualError::ThrottleParse(format!(
            "每分钟请求上限必须大于 0: {body:?}"
        )));
    }

    Ok(limit)
}
