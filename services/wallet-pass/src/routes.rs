//! HTTP 入口与跳转链
//!
//! 入口 -> 平台分流 -> 生态终点，每一跳之间只靠重新签发的
//! 能力令牌传递状态。Apple 路径多一跳（二进制卡包必须由短期
//! 令牌换取），Google 路径在入口直接发卡并跳到 save 链接。

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode, header};
use axum::Json;
use axum::response::{IntoResponse, Response};
use axum::Router;
use axum::routing::{get, post};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use cardlink_telemetry::HealthStatus;

use crate::archive::{PassSpec, serial_number};
use crate::callbacks;
use crate::error::ApiResult;
use crate::events::{EventType, TelemetryEvent};
use crate::member::{MemberRecord, resolve_member};
use crate::platform::{self, Platform};
use crate::state::AppState;
use crate::tier::{Tier, normalize_strict, resolve_tier};
use crate::token::{CapabilityPayload, TokenTtl};

/// 组装完整路由
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/resolve", get(resolve_get).post(resolve_post))
        .route("/smart/{token}", get(smart_hop))
        .route("/google/{token}", get(google_hop))
        .route("/ios/{token}", get(ios_hop))
        .route("/telemetry/install", post(record_install))
        .route("/health", get(health))
        .merge(callbacks::router(state.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// 客户端 IP 提取器
///
/// 反向代理后面真实地址在 X-Forwarded-For 里（取最左一跳），
/// 直连时退回连接信息；两者都没有就记空，遥测照常进行。
pub struct ClientIp(pub Option<String>);

impl<S> FromRequestParts<S> for ClientIp
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let forwarded = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        let ip = forwarded.or_else(|| {
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        });

        Ok(Self(ip))
    }
}

/// 入口查询参数
#[derive(Debug, Deserialize)]
pub struct ResolveQuery {
    pub client: String,
    pub campaign: String,
    pub platform: Option<String>,
    pub tier: Option<String>,
    #[serde(rename = "externalId")]
    pub external_id: Option<String>,
    #[serde(rename = "displayName")]
    pub display_name: Option<String>,
}

/// 入口请求体（POST 变体），字段与 query 同义但优先级更高
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResolveBody {
    pub tier: Option<String>,
    pub external_id: Option<String>,
    pub display_name: Option<String>,
}

async fn resolve_get(
    State(state): State<AppState>,
    Query(query): Query<ResolveQuery>,
    headers: HeaderMap,
    ip: ClientIp,
) -> ApiResult<Response> {
    do_resolve(state, query, ResolveBody::default(), headers, ip).await
}

async fn resolve_post(
    State(state): State<AppState>,
    Query(query): Query<ResolveQuery>,
    headers: HeaderMap,
    ip: ClientIp,
    body: Option<Json<ResolveBody>>,
) -> ApiResult<Response> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    do_resolve(state, query, body, headers, ip).await
}

/// 入口：解析会员、裁决等级、按平台分流
async fn do_resolve(
    state: AppState,
    query: ResolveQuery,
    body: ResolveBody,
    headers: HeaderMap,
    ip: ClientIp,
) -> ApiResult<Response> {
    let ua = user_agent(&headers);
    let detected = platform::detect(ua.as_deref(), query.platform.as_deref());

    let member = lookup_member(&state, &query.client, &query.campaign).await;
    let tier = resolve_tier(
        body.tier.as_deref(),
        query.tier.as_deref(),
        member.as_ref().and_then(|m| m.tier_raw.as_deref()),
    );

    // 显式传入的身份字段永远压过库里的值
    let external_id = body
        .external_id
        .or(query.external_id)
        .or_else(|| member.as_ref().map(|m| m.external_id.clone()));
    let display_name = body
        .display_name
        .or(query.display_name)
        .or_else(|| member.as_ref().map(MemberRecord::display_name));

    let mut payload = CapabilityPayload::new(query.client, query.campaign);
    payload.external_id = external_id;
    payload.display_name = display_name;
    payload.tier = Some(tier.as_str().to_string());

    match detected {
        Platform::Apple => {
            // 平台已知，压到最短有效期再跳二进制卡包路径
            let token = state.tokens.issue(&payload, TokenTtl::DeviceHop)?;
            Ok(found(&format!("{}/{}", platform::next_hop(detected), token)))
        }
        Platform::Google => {
            let url = provision_google(&state, &payload, tier, ua, ip.0).await?;
            Ok(found(&url))
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct SmartQuery {
    pub platform: Option<String>,
}

/// 设备识别跳：邮件链接的落点，验旧令牌、按设备重新分流
async fn smart_hop(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Query(query): Query<SmartQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let payload = state.tokens.verify(&token)?;
    let detected = platform::detect(user_agent(&headers).as_deref(), query.platform.as_deref());

    // 换发短期令牌，旧令牌就此作废
    let next = state.tokens.issue(&payload, TokenTtl::DeviceHop)?;
    Ok(found(&format!("{}/{}", platform::next_hop(detected), next)))
}

/// Google 终点：发卡并跳到 save 链接
async fn google_hop(
    State(state): State<AppState>,
    Path(token): Path<String>,
    headers: HeaderMap,
    ip: ClientIp,
) -> ApiResult<Response> {
    let payload = state.tokens.verify(&token)?;
    let tier = tier_for(&state, &payload).await;
    let url = provision_google(&state, &payload, tier, user_agent(&headers), ip.0).await?;
    Ok(found(&url))
}

/// Apple 终点：现做现签的二进制卡包
async fn ios_hop(
    State(state): State<AppState>,
    Path(token): Path<String>,
    headers: HeaderMap,
    ip: ClientIp,
) -> ApiResult<Response> {
    let payload = state.tokens.verify(&token)?;
    let tier = tier_for(&state, &payload).await;

    let serial = serial_number(payload.client_code.as_str(), payload.campaign_code.as_str(), tier);
    let barcode_value = account_id(&payload);
    let spec = PassSpec {
        serial_number: serial.clone(),
        display_name: payload
            .display_name
            .clone()
            .unwrap_or_else(|| barcode_value.clone()),
        barcode_value,
        campaign_code: payload.campaign_code.to_string(),
        tier,
    };
    let bytes = state.archives.build(&spec)?;

    state.recorder.record(
        TelemetryEvent::new(EventType::Install, "apple", "download")
            .with_member(account_id(&payload))
            .with_pass(serial.clone())
            .with_request_info(user_agent(&headers), ip.0),
    );

    Ok((
        StatusCode::OK,
        [
            (
                header::CONTENT_TYPE,
                "application/vnd.apple.pkpass".to_string(),
            ),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}.pkpass\"", serial),
            ),
        ],
        bytes,
    )
        .into_response())
}

/// 遥测上报请求体；字段全可缺省，坏 JSON 同样吞下
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct InstallReport {
    platform: Option<String>,
    source: Option<String>,
    event_type: Option<String>,
    member_id: Option<String>,
    pass_id: Option<String>,
}

/// 安装上报：对调用方永不失败
async fn record_install(
    State(state): State<AppState>,
    headers: HeaderMap,
    ip: ClientIp,
    body: Bytes,
) -> StatusCode {
    let report: InstallReport = serde_json::from_slice(&body).unwrap_or_default();

    let event_type = report
        .event_type
        .as_deref()
        .and_then(EventType::parse)
        .unwrap_or(EventType::Install);

    let mut event = TelemetryEvent::new(
        event_type,
        report.platform.unwrap_or_else(|| "unknown".to_string()),
        report.source.unwrap_or_else(|| "report".to_string()),
    )
    .with_request_info(user_agent(&headers), ip.0);
    if let Some(member_id) = report.member_id {
        event = event.with_member(member_id);
    }
    if let Some(pass_id) = report.pass_id {
        event = event.with_pass(pass_id);
    }
    state.recorder.record(event);

    StatusCode::ACCEPTED
}

async fn health(State(state): State<AppState>) -> Response {
    let mut status = HealthStatus::new();
    match state.events.check().await {
        Ok(()) => status.add_check("telemetry_store", true, None),
        Err(e) => status.add_check("telemetry_store", false, Some(e.to_string())),
    }

    let code = if status.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = serde_json::json!({
        "healthy": status.healthy,
        "checks": status
            .checks
            .iter()
            .map(|c| serde_json::json!({ "name": c.name, "healthy": c.healthy }))
            .collect::<Vec<_>>(),
    });
    (code, Json(body)).into_response()
}

/// 发 Google 卡并记安装遥测
async fn provision_google(
    state: &AppState,
    payload: &CapabilityPayload,
    tier: Tier,
    ua: Option<String>,
    ip: Option<String>,
) -> ApiResult<String> {
    let account_id = account_id(payload);
    let account_name = payload
        .display_name
        .clone()
        .unwrap_or_else(|| account_id.clone());

    let url = state
        .google
        .save_url(
            &account_id,
            &account_name,
            payload.client_code.as_str(),
            payload.campaign_code.as_str(),
            tier,
        )
        .await?;

    state.recorder.record(
        TelemetryEvent::new(EventType::Install, "google", "save_url")
            .with_member(account_id)
            .with_request_info(ua, ip),
    );

    Ok(url)
}

/// 令牌里带等级就用令牌的；否则重新走一遍会员库裁决
async fn tier_for(state: &AppState, payload: &CapabilityPayload) -> Tier {
    if let Some(tier) = payload.tier.as_deref().and_then(normalize_strict) {
        return tier;
    }

    let member =
        lookup_member(state, payload.client_code.as_str(), payload.campaign_code.as_str()).await;
    resolve_tier(
        None,
        None,
        member.as_ref().and_then(|m| m.tier_raw.as_deref()),
    )
}

/// 会员解析对发卡是尽力而为：库故障记日志、继续用原始编码
async fn lookup_member(state: &AppState, client: &str, campaign: &str) -> Option<MemberRecord> {
    match resolve_member(state.members.as_ref(), client, campaign).await {
        Ok(found) => {
            if found.is_none() {
                warn!(%client, %campaign, "Member not resolved, falling back to raw client code");
            }
            found
        }
        Err(e) => {
            warn!(error = %e, %client, %campaign, "Member store unavailable, proceeding without record");
            None
        }
    }
}

/// 账户标识：外部 ID 缺失时退回原始 client code
fn account_id(payload: &CapabilityPayload) -> String {
    payload
        .external_id
        .clone()
        .unwrap_or_else(|| payload.client_code.to_string())
}

fn user_agent(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

/// 302 跳转；axum 的 Redirect 不含 302，手工拼
fn found(location: &str) -> Response {
    (
        StatusCode::FOUND,
        [(header::LOCATION, location.to_string())],
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn extract_ip(request: axum::http::Request<()>) -> Option<String> {
        let (mut parts, _) = request.into_parts();
        let ClientIp(ip) = ClientIp::from_request_parts(&mut parts, &()).await.unwrap();
        ip
    }

    #[tokio::test]
    async fn test_client_ip_prefers_forwarded_header() {
        let request = axum::http::Request::builder()
            .header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
            .body(())
            .unwrap();
        assert_eq!(extract_ip(request).await.as_deref(), Some("203.0.113.9"));
    }

    #[tokio::test]
    async fn test_client_ip_falls_back_to_connect_info() {
        let mut request = axum::http::Request::builder().body(()).unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([192, 168, 1, 7], 443))));
        assert_eq!(extract_ip(request).await.as_deref(), Some("192.168.1.7"));
    }

    #[tokio::test]
    async fn test_client_ip_absent_stays_none() {
        let request = axum::http::Request::builder().body(()).unwrap();
        assert!(extract_ip(request).await.is_none());

        // 空的代理头不算地址
        let request = axum::http::Request::builder()
            .header("x-forwarded-for", "")
            .body(())
            .unwrap();
        assert!(extract_ip(request).await.is_none());
    }
}
