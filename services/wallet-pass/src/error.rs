//! HTTP 错误响应适配

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::{debug, error};

use cardlink_errors::AppError;

/// AppError 的 axum 包装
#[derive(Debug)]
pub struct ApiError(pub AppError);

impl From<AppError> for ApiError {
    fn from(e: AppError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        // 部署级错误需要告警；调用方错误只留调试线索
        if self.0.is_deployment_error() || status.is_server_error() {
            error!(error = %self.0, "Request failed");
        } else {
            debug!(error = %self.0, "Request rejected");
        }

        (status, Json(self.0.to_body())).into_response()
    }
}

/// 处理函数通用返回类型
pub type ApiResult<T> = Result<T, ApiError>;
