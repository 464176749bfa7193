//! 订单状态与核算结果模型
//!
//! 核算系统返回的状态是自由字符串（REGISTERED / PROCESSING / INVALID / PROCESSED），
//! 在进入订单存储之前统一映射为 `OrderStatus`，并保证"仅 PROCESSED 携带积分"这一不变量。

use serde::{Deserialize, Serialize};

use crate::error::AccrualError;

/// 订单状态
///
/// NEW 与 PROCESSING 为待处理状态，对账管道会持续轮询；
/// INVALID 与 PROCESSED 为终态，不再参与对账。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "varchar", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// 已上传，尚未被核算系统处理
    #[default]
    New,
    /// 核算系统处理中
    Processing,
    /// 核算系统拒绝计算积分
    Invalid,
    /// 核算完成，积分已确定
    Processed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Processing => "PROCESSING",
            Self::Invalid => "INVALID",
            Self::Processed => "PROCESSED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Invalid | Self::Processed)
    }

    pub fn is_pending(&self) -> bool {
        !self.is_terminal()
    }

    /// 将核算系统的状态字符串映射为订单状态
    ///
    /// REGISTERED 表示核算系统已登记但尚未开始计算，对应本地的 NEW。
    pub fn from_authority(status: &str) -> Option<Self> {
        match status {
            "REGISTERED" | "NEW" => Some(Self::New),
            "PROCESSING" => Some(Self::Processing),
            "INVALID" => Some(Self::Invalid),
            "PROCESSED" => Some(Self::Processed),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 核算系统响应体
///
/// 与核算系统的 JSON 协议逐字段对应：`{"order": "...", "accrual": 500, "status": "PROCESSED"}`，
/// accrual 字段在无积分时省略。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccrualResponse {
    pub order: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accrual: Option<f64>,
    pub status: String,
}

/// 核算结果
///
/// 每次查询创建，立即用于回写订单，随后丢弃。
#[derive(Debug, Clone, PartialEq)]
pub struct AccrualDecision {
    pub order_id: String,
    pub status: OrderStatus,
    pub accrual: Option<f64>,
}

impl TryFrom<AccrualResponse> for AccrualDecision {
    type Error = AccrualError;

    fn try_from(response: AccrualResponse) -> Result<Self, Self::Error> {
        let status = OrderStatus::from_authority(&response.status).ok_or_else(|| {
            AccrualError::MalformedResponse(format!(
                "未知的核算状态 {:?}，订单 {}",
                response.status, response.order
            ))
        })?;

        // 积分当且仅当 PROCESSED 时存在；PROCESSED 未带积分视为 0 积分
        let accrual = match status {
            OrderStatus::Processed => Some(response.accrual.unwrap_or(0.0)),
            _ => None,
        };

        Ok(Self {
            order_id: response.order,
            status,
            accrual,
        })
    }
}
