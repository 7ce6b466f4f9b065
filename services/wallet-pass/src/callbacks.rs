//! 设备回调（Apple 生态 Web Service 协议）
//!
//! 设备按卡包里的 webServiceURL 回调注册/注销。凭证校验在一切
//! 业务处理之前：头缺失或不匹配直接 401，不产生任何遥测。

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use secrecy::ExposeSecret;
use tracing::info;

use cardlink_config::CallbackConfig;
use cardlink_errors::AppError;

use crate::error::{ApiError, ApiResult};
use crate::events::{EventType, TelemetryEvent};
use crate::routes::ClientIp;
use crate::state::AppState;

/// 回调凭证校验器
///
/// 期望完整的 `{scheme} {token}` 授权头，整体比对。
#[derive(Clone)]
pub struct CallbackAuth {
    expected: String,
}

impl CallbackAuth {
    pub fn new(config: &CallbackConfig) -> Self {
        Self {
            expected: format!("{} {}", config.scheme, config.token.expose_secret()),
        }
    }

    pub fn verify(&self, authorization: Option<&str>) -> bool {
        authorization == Some(self.expected.as_str())
    }
}

/// 回调路由（全部挂在凭证校验中间件之后）
pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        .route(
            "/v1/devices/{device_id}/registrations/{pass_type_id}/{serial}",
            axum::routing::post(register_device).delete(unregister_device),
        )
        .route(
            "/v1/devices/{device_id}/registrations/{pass_type_id}",
            get(list_registrations),
        )
        .layer(middleware::from_fn_with_state(state, require_callback_auth))
}

/// 凭证中间件：校验失败的请求到不了处理函数
async fn require_callback_auth(
    State(state): State<AppState>,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, ApiError> {
    let authorization = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    if !state.callback_auth.verify(authorization) {
        return Err(ApiError(AppError::unauthorized("Invalid pass credentials")));
    }

    Ok(next.run(request).await)
}

/// 设备注册：记一条安装事件
///
/// 协议上重复注册应答 200，但这里不存注册表，统一 201。
async fn register_device(
    State(state): State<AppState>,
    Path((device_id, _pass_type_id, serial)): Path<(String, String, String)>,
    headers: HeaderMap,
    ip: ClientIp,
) -> ApiResult<StatusCode> {
    info!(%device_id, %serial, "Device registered for pass updates");

    state.recorder.record(
        TelemetryEvent::new(EventType::Install, "apple", "callback")
            .with_pass(serial)
            .with_request_info(user_agent(&headers), ip.0),
    );

    Ok(StatusCode::CREATED)
}

/// 设备注销：记一条卸载事件
async fn unregister_device(
    State(state): State<AppState>,
    Path((device_id, _pass_type_id, serial)): Path<(String, String, String)>,
    headers: HeaderMap,
    ip: ClientIp,
) -> ApiResult<StatusCode> {
    info!(%device_id, %serial, "Device unregistered");

    state.recorder.record(
        TelemetryEvent::new(EventType::Uninstall, "apple", "callback")
            .with_pass(serial)
            .with_request_info(user_agent(&headers), ip.0),
    );

    Ok(StatusCode::OK)
}

/// 更新轮询：不维护注册表，永远没有待更新的卡
async fn list_registrations(
    Path((_device_id, _pass_type_id)): Path<(String, String)>,
) -> StatusCode {
    StatusCode::NO_CONTENT
}

fn user_agent(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}
