//! 能力令牌服务
//!
//! 每次跳转边界签发一个短期令牌，下一跳验完即弃，从不落库。
//! 持有未过期的令牌即视为有权领取对应会员的卡——它是传输能力，
//! 不是会话。

use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use tracing::debug;

use cardlink_common::{CampaignCode, ClientCode};
use cardlink_errors::{AppError, AppResult};

/// 验签失败对外的统一话术，过期与签名错误不得区分
const REJECT_MESSAGE: &str = "Invalid or expired link";

/// 跳转间携带的最小身份载荷
///
/// 不变量：除这四个身份字段（加 tier）外不得携带任何东西。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityPayload {
    pub client_code: ClientCode,
    pub campaign_code: CampaignCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
}

impl CapabilityPayload {
    pub fn new(client_code: impl Into<String>, campaign_code: impl Into<String>) -> Self {
        Self {
            client_code: ClientCode::new(client_code),
            campaign_code: CampaignCode::new(campaign_code),
            external_id: None,
            display_name: None,
            tier: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CapabilityClaims {
    #[serde(flatten)]
    payload: CapabilityPayload,
    iat: i64,
    exp: i64,
}

/// 令牌有效期档位
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenTtl {
    /// 已知平台后的设备跳转：15 分钟档，压缩重放窗口
    DeviceHop,
    /// 嵌在外发邮件里的链接：7 天档
    EmailLink,
}

/// 能力令牌签发/验证服务（HS256，单一共享密钥）
#[derive(Clone)]
pub struct CapabilityTokens {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    device_ttl: Duration,
    email_ttl: Duration,
}

impl CapabilityTokens {
    pub fn new(secret: &Secret<String>, device_ttl_minutes: i64, email_ttl_days: i64) -> Self {
        let secret = secret.expose_secret().as_bytes();
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            device_ttl: Duration::minutes(device_ttl_minutes),
            email_ttl: Duration::days(email_ttl_days),
        }
    }

    /// 签发令牌
    pub fn issue(&self, payload: &CapabilityPayload, ttl: TokenTtl) -> AppResult<String> {
        let validity = match ttl {
            TokenTtl::DeviceHop => self.device_ttl,
            TokenTtl::EmailLink => self.email_ttl,
        };
        self.issue_for(payload, validity)
    }

    fn issue_for(&self, payload: &CapabilityPayload, validity: Duration) -> AppResult<String> {
        let now = Utc::now();
        let claims = CapabilityClaims {
            payload: payload.clone(),
            iat: now.timestamp(),
            exp: (now + validity).timestamp(),
        };

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| AppError::internal(format!("Failed to issue capability token: {}", e)))
    }

    /// 验证令牌并取出载荷
    ///
    /// 过期与签名无效对调用方一视同仁（401，同一条消息），
    /// 具体原因只进 debug 日志。
    pub fn verify(&self, token: &str) -> AppResult<CapabilityPayload> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;

        match decode::<CapabilityClaims>(token, &self.decoding_key, &validation) {
            Ok(data) => Ok(data.claims.payload),
            Err(e) => {
                debug!(reason = %e, "Capability token rejected");
                Err(AppError::unauthorized(REJECT_MESSAGE))
            }
        }
    }
}
