//! Google 钱包发卡
//!
//! 类/对象的幂等创建（GET 不在则 POST）加 savetowallet 声明的
//! RS256 签名。对象 ID 由编码+活动+等级+修订号确定性拼出，
//! 同一会员重复领卡是更新而不是再发一张。

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use reqwest::StatusCode;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use cardlink_common::{RetryConfig, is_retryable_error, sanitize_token, with_conditional_retry};
use cardlink_config::GoogleWalletConfig;
use cardlink_errors::{AppError, AppResult};

use crate::tier::Tier;

/// 钱包对象资源名
pub const LOYALTY_CLASS: &str = "loyaltyClass";
pub const LOYALTY_OBJECT: &str = "loyaltyObject";

/// 远端图片引用
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    #[serde(rename = "sourceUri")]
    pub source_uri: SourceUri,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceUri {
    pub uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Barcode {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextModule {
    pub header: String,
    pub body: String,
}

/// 发卡活动对应的卡类
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoyaltyClass {
    pub id: String,
    pub issuer_name: String,
    pub program_name: String,
    pub review_status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hex_background_color: Option<String>,
}

/// 单个会员的卡对象
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoyaltyObject {
    pub id: String,
    pub class_id: String,
    pub state: String,
    pub account_id: String,
    pub account_name: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub text_modules_data: Vec<TextModule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hero_image: Option<Image>,
    pub barcode: Barcode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hex_background_color: Option<String>,
}

/// 卡类 ID：每个活动一类
pub fn class_id(issuer_id: &str, campaign_code: &str, revision: u32) -> String {
    format!("{}.{}-c{}", issuer_id, sanitize_token(campaign_code), revision)
}

/// 卡对象 ID：编码+活动+等级+修订号，确定性拼接
///
/// 相同输入必然得到相同 ID，远端视为更新而非新建。
pub fn object_id(
    issuer_id: &str,
    client_code: &str,
    campaign_code: &str,
    tier: Tier,
    revision: u32,
) -> String {
    format!(
        "{}.{}-{}-{}-r{}",
        issuer_id,
        sanitize_token(client_code),
        sanitize_token(campaign_code),
        tier.as_str(),
        revision
    )
}

/// GET 探测的结论
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamStatus {
    Found,
    NotFound,
}

/// 远端钱包对象服务
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WalletObjects: Send + Sync {
    async fn get(&self, resource: &str, id: &str) -> AppResult<UpstreamStatus>;

    /// 创建资源；远端已存在（409）按成功处理
    async fn create(&self, resource: &str, body: serde_json::Value) -> AppResult<()>;
}

/// 幂等保障组合子：先 GET，404 才 POST
///
/// GET 是幂等的，瞬时故障最多重试一次；POST 从不重试。
pub async fn ensure_exists(
    objects: &dyn WalletObjects,
    resource: &str,
    id: &str,
    body: serde_json::Value,
) -> AppResult<()> {
    let status = with_conditional_retry(
        &RetryConfig::idempotent_get(),
        "wallet object lookup",
        || objects.get(resource, id),
        |e: &AppError| is_retryable_error(&e.to_string()),
    )
    .await?;

    match status {
        UpstreamStatus::Found => {
            debug!(resource, id, "Wallet resource already exists");
            Ok(())
        }
        UpstreamStatus::NotFound => {
            debug!(resource, id, "Wallet resource missing, creating");
            objects.create(resource, body).await
        }
    }
}

/// 基于 REST API 的钱包对象服务客户端
pub struct RestWalletObjects {
    client: reqwest::Client,
    api_base: String,
    api_token: Option<String>,
}

impl RestWalletObjects {
    pub fn new(config: &GoogleWalletConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_token: config
                .api_token
                .as_ref()
                .map(|t| t.expose_secret().clone()),
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl WalletObjects for RestWalletObjects {
    async fn get(&self, resource: &str, id: &str) -> AppResult<UpstreamStatus> {
        let url = format!("{}/{}/{}", self.api_base, resource, id);
        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(|e| AppError::external_service(format!("wallet service GET failed: {}", e)))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(UpstreamStatus::NotFound),
            status if status.is_success() => Ok(UpstreamStatus::Found),
            status => Err(AppError::external_service(format!(
                "wallet service GET {} returned {}",
                resource, status
            ))),
        }
    }

    async fn create(&self, resource: &str, body: serde_json::Value) -> AppResult<()> {
        let url = format!("{}/{}", self.api_base, resource);
        let response = self
            .authorize(self.client.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::external_service(format!("wallet service POST failed: {}", e)))?;

        let status = response.status();
        // 并发创建撞上已存在的资源不算失败
        if status.is_success() || status == StatusCode::CONFLICT {
            Ok(())
        } else {
            Err(AppError::external_service(format!(
                "wallet service POST {} returned {}",
                resource, status
            )))
        }
    }
}

/// savetowallet 签名声明
#[derive(Debug, Serialize)]
struct SaveClaims<'a> {
    iss: &'a str,
    aud: &'static str,
    typ: &'static str,
    iat: i64,
    origins: Vec<&'a str>,
    payload: SavePayload,
}

#[derive(Debug, Serialize)]
struct SavePayload {
    #[serde(rename = "loyaltyObjects")]
    loyalty_objects: Vec<LoyaltyObject>,
}

/// 发卡编排：确保类与对象存在，再签出 save 链接
pub struct GoogleProvisioner {
    objects: Arc<dyn WalletObjects>,
    config: GoogleWalletConfig,
    organization: String,
    // 启动时解析一次，之后只读
    signing_key: Option<EncodingKey>,
}

impl GoogleProvisioner {
    pub fn new(
        config: GoogleWalletConfig,
        organization: impl Into<String>,
        objects: Arc<dyn WalletObjects>,
    ) -> Self {
        let signing_key = load_signing_key(&config);
        Self {
            objects,
            config,
            organization: organization.into(),
            signing_key,
        }
    }

    fn issuer_id(&self) -> AppResult<&str> {
        self.config
            .issuer_id
            .as_deref()
            .ok_or_else(|| AppError::configuration("google wallet issuer is not configured"))
    }

    /// 组装卡对象：配色/文案只看等级，从不用自由文本
    fn build_object(
        &self,
        issuer_id: &str,
        account_id: &str,
        account_name: &str,
        client_code: &str,
        campaign_code: &str,
        tier: Tier,
    ) -> LoyaltyObject {
        LoyaltyObject {
            id: object_id(
                issuer_id,
                client_code,
                campaign_code,
                tier,
                self.config.revision,
            ),
            class_id: class_id(issuer_id, campaign_code, self.config.revision),
            state: "ACTIVE".to_string(),
            account_id: account_id.to_string(),
            account_name: account_name.to_string(),
            text_modules_data: vec![TextModule {
                header: format!("{} membership", tier.label()),
                body: tier.benefit_text().to_string(),
            }],
            hero_image: None,
            barcode: Barcode {
                kind: "CODE_128".to_string(),
                value: cardlink_common::to_barcode_safe(account_id),
            },
            hex_background_color: Some(tier.hex_color().to_string()),
        }
    }

    /// 类是活动内所有等级共享的，不得携带任何等级配色，
    /// 否则首个发卡会员的等级会永久定下整类的底色。
    fn build_class(&self, issuer_id: &str, campaign_code: &str) -> LoyaltyClass {
        LoyaltyClass {
            id: class_id(issuer_id, campaign_code, self.config.revision),
            issuer_name: self.organization.clone(),
            program_name: campaign_code.to_string(),
            review_status: "UNDER_REVIEW".to_string(),
            hex_background_color: None,
        }
    }

    /// 发卡并返回 save 跳转链接
    pub async fn save_url(
        &self,
        account_id: &str,
        account_name: &str,
        client_code: &str,
        campaign_code: &str,
        tier: Tier,
    ) -> AppResult<String> {
        let issuer_id = self.issuer_id()?.to_string();

        let class = self.build_class(&issuer_id, campaign_code);
        let object = self.build_object(
            &issuer_id,
            account_id,
            account_name,
            client_code,
            campaign_code,
            tier,
        );

        ensure_exists(
            self.objects.as_ref(),
            LOYALTY_CLASS,
            &class.id,
            serde_json::to_value(&class)
                .map_err(|e| AppError::internal(format!("class serialization failed: {}", e)))?,
        )
        .await?;
        ensure_exists(
            self.objects.as_ref(),
            LOYALTY_OBJECT,
            &object.id,
            serde_json::to_value(&object)
                .map_err(|e| AppError::internal(format!("object serialization failed: {}", e)))?,
        )
        .await?;

        self.sign_save_url(object)
    }

    fn sign_save_url(&self, object: LoyaltyObject) -> AppResult<String> {
        let issuer = self
            .config
            .service_account_email
            .as_deref()
            .ok_or_else(|| {
                AppError::configuration("google wallet service account is not configured")
            })?;
        let key = self.signing_key.as_ref().ok_or_else(|| {
            AppError::configuration("google wallet signing key is not configured")
        })?;

        let claims = SaveClaims {
            iss: issuer,
            aud: "google",
            typ: "savetowallet",
            iat: chrono::Utc::now().timestamp(),
            origins: vec![self.config.origin.as_str()],
            payload: SavePayload {
                loyalty_objects: vec![object],
            },
        };

        let jwt = encode(&Header::new(Algorithm::RS256), &claims, key)
            .map_err(|e| AppError::internal(format!("save claim signing failed: {}", e)))?;

        Ok(format!(
            "{}/{}",
            self.config.save_endpoint.trim_end_matches('/'),
            jwt
        ))
    }
}

fn load_signing_key(config: &GoogleWalletConfig) -> Option<EncodingKey> {
    let pem = config.signing_key_pem.as_ref()?;
    match EncodingKey::from_rsa_pem(pem.expose_secret().as_bytes()) {
        Ok(key) => Some(key),
        Err(e) => {
            warn!(error = %e, "Google wallet signing key is present but unparseable");
            None
        }
    }
}
