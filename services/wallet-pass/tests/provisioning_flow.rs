//! 发卡全链路集成测试
//!
//! 路由用替身（内存会员库/事件存储/远端钱包服务）跑通，
//! 不依赖 PostgreSQL 与网络。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rsa::RsaPrivateKey;
use rsa::pkcs1::EncodeRsaPrivateKey;
use secrecy::Secret;
use tower::util::ServiceExt;

use cardlink_config::{CallbackConfig, GoogleWalletConfig, PassArchiveConfig};
use cardlink_errors::AppResult;

use wallet_pass::archive::PassArchiveBuilder;
use wallet_pass::callbacks::CallbackAuth;
use wallet_pass::events::{EventSink, EventType, TelemetryEvent, TelemetryRecorder};
use wallet_pass::google::{GoogleProvisioner, UpstreamStatus, WalletObjects};
use wallet_pass::member::{FieldMap, LookupError, LookupFilter, MemberRecord, MemberStore};
use wallet_pass::routes;
use wallet_pass::state::AppState;
use wallet_pass::token::{CapabilityPayload, CapabilityTokens, TokenTtl};

const IPHONE_UA: &str =
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15";
const ANDROID_UA: &str = "Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36";

// ---- 替身 ----

/// 内存会员库：只应答精确匹配
struct StubMembers(Option<MemberRecord>);

#[async_trait]
impl MemberStore for StubMembers {
    async fn find(
        &self,
        _fields: &'static FieldMap,
        filter: LookupFilter,
        _client_code: &str,
        _campaign_code: &str,
    ) -> Result<Option<MemberRecord>, LookupError> {
        if filter == LookupFilter::Exact {
            Ok(self.0.clone())
        } else {
            Ok(None)
        }
    }
}

/// 内存事件存储
#[derive(Default)]
struct MemorySink {
    events: Mutex<Vec<TelemetryEvent>>,
    fail_check: bool,
}

#[async_trait]
impl EventSink for MemorySink {
    async fn append(&self, event: &TelemetryEvent) -> AppResult<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }

    async fn check(&self) -> AppResult<()> {
        if self.fail_check {
            Err(cardlink_errors::AppError::database("store down"))
        } else {
            Ok(())
        }
    }
}

/// 内存远端钱包服务：一切资源都不存在，记录创建请求
#[derive(Default)]
struct MemoryWalletObjects {
    created: Mutex<Vec<(String, serde_json::Value)>>,
}

#[async_trait]
impl WalletObjects for MemoryWalletObjects {
    async fn get(&self, _resource: &str, _id: &str) -> AppResult<UpstreamStatus> {
        Ok(UpstreamStatus::NotFound)
    }

    async fn create(&self, resource: &str, body: serde_json::Value) -> AppResult<()> {
        self.created
            .lock()
            .unwrap()
            .push((resource.to_string(), body));
        Ok(())
    }
}

// ---- 组装 ----

struct Harness {
    app: Router,
    tokens: CapabilityTokens,
    sink: Arc<MemorySink>,
    objects: Arc<MemoryWalletObjects>,
}

fn signing_key_pem() -> String {
    let key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
    key.to_pkcs1_pem(rsa::pkcs8::LineEnding::LF)
        .unwrap()
        .to_string()
}

fn template_dir() -> String {
    let dir = std::env::temp_dir().join(format!("pass-flow-{}", cardlink_common::new_id()));
    std::fs::create_dir_all(&dir).unwrap();
    for name in ["icon.png", "icon@2x.png", "logo.png"] {
        std::fs::write(dir.join(name), b"\x89PNG\r\n\x1a\n").unwrap();
    }
    dir.to_string_lossy().into_owned()
}

fn member() -> MemberRecord {
    MemberRecord {
        external_id: "MBR-00042".to_string(),
        first_name: Some("Ada".to_string()),
        last_name: Some("Lovelace".to_string()),
        client_code: "L0083".to_string(),
        campaign_code: "CP0163".to_string(),
        tier_raw: Some("Gold 15%".to_string()),
    }
}

fn harness(member: Option<MemberRecord>, fail_check: bool) -> Harness {
    let pem = signing_key_pem();
    let google_config: GoogleWalletConfig = serde_json::from_value(serde_json::json!({
        "issuer_id": "3388000000012345",
        "service_account_email": "wallet@project.iam.gserviceaccount.com",
        "signing_key_pem": pem,
        "origin": "https://cards.example.com"
    }))
    .unwrap();
    let callbacks = CallbackConfig {
        scheme: "ApplePass".to_string(),
        token: Secret::new("cb-secret".to_string()),
        web_service_url: "https://cards.example.com/callbacks".to_string(),
    };
    let archive_config = PassArchiveConfig {
        pass_type_identifier: "pass.com.cardlink.member".to_string(),
        team_identifier: "ABCDE12345".to_string(),
        organization_name: "Cardlink".to_string(),
        template_dir: template_dir(),
        signing_key_pem: Some(Secret::new(signing_key_pem())),
        certificate_pem: None,
    };

    let tokens = CapabilityTokens::new(&Secret::new("test-secret".to_string()), 15, 7);
    let sink = Arc::new(MemorySink {
        events: Mutex::new(Vec::new()),
        fail_check,
    });
    let objects = Arc::new(MemoryWalletObjects::default());

    let state = AppState {
        tokens: tokens.clone(),
        members: Arc::new(StubMembers(member)),
        google: Arc::new(GoogleProvisioner::new(
            google_config,
            "Cardlink",
            objects.clone(),
        )),
        archives: Arc::new(PassArchiveBuilder::new(archive_config, &callbacks)),
        events: sink.clone(),
        recorder: TelemetryRecorder::new(sink.clone()),
        callback_auth: CallbackAuth::new(&callbacks),
    };

    Harness {
        app: routes::router(state),
        tokens,
        sink,
        objects,
    }
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec();
    (status, headers, body)
}

fn location(headers: &axum::http::HeaderMap) -> String {
    headers
        .get(header::LOCATION)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string()
}

/// 解开 JWT 的载荷段（不验签，仅测试观察用）
fn jwt_payload(token: &str) -> serde_json::Value {
    let segment = token.split('.').nth(1).unwrap();
    let bytes = URL_SAFE_NO_PAD.decode(segment).unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn drain_recorder() {
    // 遥测写入挂在独立任务上，给它让出一点时间
    tokio::time::sleep(Duration::from_millis(50)).await;
}

// ---- 跳转链 ----

#[tokio::test(flavor = "multi_thread")]
async fn apple_resolve_redirects_to_pass_route_with_token() {
    let h = harness(Some(member()), false);

    let (status, headers, _) = send(
        &h.app,
        Request::get("/resolve?client=L0083&campaign=CP0163")
            .header(header::USER_AGENT, IPHONE_UA)
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::FOUND);
    let location = location(&headers);
    let token = location.strip_prefix("/ios/").expect("apple route");

    let claims = jwt_payload(token);
    assert_eq!(claims["client_code"], "L0083");
    assert_eq!(claims["campaign_code"], "CP0163");
    assert_eq!(claims["external_id"], "MBR-00042");
    assert_eq!(claims["tier"], "gold");
}

#[tokio::test(flavor = "multi_thread")]
async fn google_resolve_redirects_to_save_url() {
    let h = harness(Some(member()), false);

    let (status, headers, _) = send(
        &h.app,
        Request::get("/resolve?client=L0083&campaign=CP0163")
            .header(header::USER_AGENT, ANDROID_UA)
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::FOUND);
    let location = location(&headers);
    let jwt = location
        .strip_prefix("https://pay.google.com/gp/v/save/")
        .expect("save url");

    let claims = jwt_payload(jwt);
    assert_eq!(claims["aud"], "google");
    assert_eq!(claims["typ"], "savetowallet");
    assert_eq!(claims["origins"][0], "https://cards.example.com");
    let object = &claims["payload"]["loyaltyObjects"][0];
    assert_eq!(object["accountId"], "MBR-00042");
    assert_eq!(object["accountName"], "Ada Lovelace");
    assert!(object["id"].as_str().unwrap().contains("-gold-"));

    // 类和对象都被创建过一次
    let created = h.objects.created.lock().unwrap();
    let resources: Vec<&str> = created.iter().map(|(r, _)| r.as_str()).collect();
    assert_eq!(resources, vec!["loyaltyClass", "loyaltyObject"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn unresolved_member_falls_back_to_raw_client_code() {
    let h = harness(None, false);

    let (status, headers, _) = send(
        &h.app,
        Request::get("/resolve?client=L0083&campaign=CP0163")
            .header(header::USER_AGENT, ANDROID_UA)
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::FOUND);
    let jwt = location(&headers)
        .strip_prefix("https://pay.google.com/gp/v/save/")
        .unwrap()
        .to_string();
    let claims = jwt_payload(&jwt);
    let object = &claims["payload"]["loyaltyObjects"][0];
    assert_eq!(object["accountId"], "L0083");
    // 没有库等级也没有显式等级，落回默认 blue
    assert!(object["id"].as_str().unwrap().contains("-blue-"));
}

#[tokio::test(flavor = "multi_thread")]
async fn body_tier_overrides_query_and_store() {
    let h = harness(Some(member()), false);

    let (status, headers, _) = send(
        &h.app,
        Request::post("/resolve?client=L0083&campaign=CP0163&tier=gold")
            .header(header::USER_AGENT, ANDROID_UA)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"tier":"blue"}"#))
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::FOUND);
    let jwt = location(&headers)
        .strip_prefix("https://pay.google.com/gp/v/save/")
        .unwrap()
        .to_string();
    let object = jwt_payload(&jwt)["payload"]["loyaltyObjects"][0].clone();
    assert!(object["id"].as_str().unwrap().contains("-blue-"));
}

#[tokio::test(flavor = "multi_thread")]
async fn smart_hop_reissues_token_per_device() {
    let h = harness(Some(member()), false);
    let token = h
        .tokens
        .issue(&CapabilityPayload::new("L0083", "CP0163"), TokenTtl::EmailLink)
        .unwrap();

    let (status, headers, _) = send(
        &h.app,
        Request::get(format!("/smart/{}", token))
            .header(header::USER_AGENT, IPHONE_UA)
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::FOUND);
    let location = location(&headers);
    let next = location.strip_prefix("/ios/").expect("apple route");
    // 每跳换发新令牌
    assert_ne!(next, token);
    assert_eq!(jwt_payload(next)["client_code"], "L0083");
}

// ---- 二进制卡包 ----

#[tokio::test(flavor = "multi_thread")]
async fn ios_hop_streams_signed_archive() {
    let h = harness(Some(member()), false);
    let mut payload = CapabilityPayload::new("L0083", "CP0163");
    payload.external_id = Some("MBR-00042".to_string());
    payload.display_name = Some("Ada Lovelace".to_string());
    payload.tier = Some("gold".to_string());
    let token = h.tokens.issue(&payload, TokenTtl::DeviceHop).unwrap();

    let (status, headers, body) = send(
        &h.app,
        Request::get(format!("/ios/{}", token))
            .header(header::USER_AGENT, IPHONE_UA)
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        headers.get(header::CONTENT_TYPE).unwrap(),
        "application/vnd.apple.pkpass"
    );
    assert!(
        headers
            .get(header::CONTENT_DISPOSITION)
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("attachment")
    );
    // zip 魔数
    assert_eq!(&body[..2], b"PK");

    drain_recorder().await;
    let events = h.sink.events.lock().unwrap();
    assert!(
        events
            .iter()
            .any(|e| e.event_type == EventType::Install && e.platform == "apple")
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_and_expired_tokens_get_same_rejection() {
    let h = harness(Some(member()), false);

    let (status, _, body) = send(
        &h.app,
        Request::get("/ios/not-a-token")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["message"], "Invalid or expired link");
}

// ---- 设备回调 ----

#[tokio::test(flavor = "multi_thread")]
async fn callback_without_credential_is_rejected_before_processing() {
    let h = harness(Some(member()), false);

    let (status, _, _) = send(
        &h.app,
        Request::post("/v1/devices/dev1/registrations/pass.com.cardlink.member/serial1")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    drain_recorder().await;
    // 未授权请求不得产生任何遥测
    assert!(h.sink.events.lock().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn callback_lifecycle_records_events() {
    let h = harness(Some(member()), false);
    let auth = "ApplePass cb-secret";

    let (status, _, _) = send(
        &h.app,
        Request::post("/v1/devices/dev1/registrations/pass.com.cardlink.member/serial1")
            .header(header::AUTHORIZATION, auth)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, _, _) = send(
        &h.app,
        Request::delete("/v1/devices/dev1/registrations/pass.com.cardlink.member/serial1")
            .header(header::AUTHORIZATION, auth)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, _) = send(
        &h.app,
        Request::get("/v1/devices/dev1/registrations/pass.com.cardlink.member")
            .header(header::AUTHORIZATION, auth)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    drain_recorder().await;
    let events = h.sink.events.lock().unwrap();
    let kinds: Vec<EventType> = events.iter().map(|e| e.event_type).collect();
    assert!(kinds.contains(&EventType::Install));
    assert!(kinds.contains(&EventType::Uninstall));
}

// ---- 遥测与健康 ----

#[tokio::test(flavor = "multi_thread")]
async fn telemetry_report_never_fails_caller() {
    let h = harness(Some(member()), false);

    // 合法上报
    let (status, _, _) = send(
        &h.app,
        Request::post("/telemetry/install")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                r#"{"platform":"apple","source":"email","memberId":"MBR-00042"}"#,
            ))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    // 坏 JSON 同样 202
    let (status, _, _) = send(
        &h.app,
        Request::post("/telemetry/install")
            .body(Body::from("{not json"))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    drain_recorder().await;
    assert_eq!(h.sink.events.lock().unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn forwarded_client_ip_lands_in_recorded_events() {
    let h = harness(Some(member()), false);

    let (status, _, _) = send(
        &h.app,
        Request::post("/telemetry/install")
            .header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"platform":"apple","source":"email"}"#))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, _, _) = send(
        &h.app,
        Request::post("/v1/devices/dev1/registrations/pass.com.cardlink.member/serial1")
            .header(header::AUTHORIZATION, "ApplePass cb-secret")
            .header("x-forwarded-for", "198.51.100.4")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    drain_recorder().await;
    let events = h.sink.events.lock().unwrap();
    let ips: Vec<Option<&str>> = events.iter().map(|e| e.ip_address.as_deref()).collect();
    // 代理链只取最左一跳
    assert!(ips.contains(&Some("203.0.113.9")));
    assert!(ips.contains(&Some("198.51.100.4")));
}

#[tokio::test(flavor = "multi_thread")]
async fn health_reflects_store_connectivity() {
    let h = harness(Some(member()), false);
    let (status, _, _) = send(&h.app, Request::get("/health").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);

    let h = harness(Some(member()), true);
    let (status, _, _) = send(&h.app, Request::get("/health").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}
