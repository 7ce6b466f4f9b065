//! cardlink-errors - 统一错误处理
//!
//! 对外统一返回极简 JSON 错误体 `{message, details?}`，
//! 内部细节只进日志，不进响应。

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 应用错误类型
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("External service error: {0}")]
    ExternalService(String),
}

impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    pub fn external_service(msg: impl Into<String>) -> Self {
        Self::ExternalService(msg.into())
    }

    /// 转换为 HTTP 状态码
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::Validation(_) => 400,
            Self::Unauthorized(_) => 401,
            // 部署级错误统一 500，不向调用方区分
            Self::Configuration(_) => 500,
            Self::Internal(_) => 500,
            Self::Database(_) => 500,
            Self::ExternalService(_) => 500,
        }
    }

    /// 转换为对外错误体
    ///
    /// 部署级错误（配置/数据库/上游服务）只返回笼统消息，
    /// 具体原因由调用处记录日志。
    pub fn to_body(&self) -> ErrorBody {
        match self {
            Self::NotFound(msg) => ErrorBody::new("Not found").with_details(msg.clone()),
            Self::Validation(msg) => ErrorBody::new("Invalid request").with_details(msg.clone()),
            Self::Unauthorized(msg) => ErrorBody::new(msg.clone()),
            Self::Configuration(_) | Self::Internal(_) | Self::Database(_) => {
                ErrorBody::new("Internal server error")
            }
            Self::ExternalService(_) => ErrorBody::new("Upstream service unavailable"),
        }
    }

    /// 是否为部署级错误（需要告警而不是提示用户）
    pub fn is_deployment_error(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::Database(_) | Self::ExternalService(_)
        )
    }
}

/// 对外极简错误体
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Result 类型别名
pub type AppResult<T> = Result<T, AppError>;
