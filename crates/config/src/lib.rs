//! cardlink-config - 配置加载库

use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use secrecy::Secret;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] figment::Error),
}

/// 服务器配置
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// 数据库配置
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    // 根据环境自动调整连接池大小
    // 开发环境: 10, 生产环境: 50
    match std::env::var("APP_ENV").as_deref() {
        Ok("production") => 50,
        _ => 10,
    }
}

/// 遥测配置
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// 能力令牌配置
///
/// 单一共享密钥（HS256），密钥轮换不在范围内。
#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    pub secret: Secret<String>,
    /// 已知平台后的最终跳转令牌有效期（分钟）
    #[serde(default = "default_device_ttl_minutes")]
    pub device_ttl_minutes: i64,
    /// 邮件外发链接令牌有效期（天）
    #[serde(default = "default_email_ttl_days")]
    pub email_ttl_days: i64,
}

fn default_device_ttl_minutes() -> i64 {
    15
}

fn default_email_ttl_days() -> i64 {
    7
}

/// Google 钱包配置
///
/// issuer_id / signing_key 缺失属于部署错误，在发卡时以 500 暴露，
/// 不在启动时 panic，以便其他入口（如 iOS 路径）继续可用。
#[derive(Debug, Clone, Deserialize)]
pub struct GoogleWalletConfig {
    pub issuer_id: Option<String>,
    pub service_account_email: Option<String>,
    pub signing_key_pem: Option<Secret<String>>,
    pub api_token: Option<Secret<String>>,
    #[serde(default = "default_wallet_api_base")]
    pub api_base: String,
    #[serde(default = "default_save_endpoint")]
    pub save_endpoint: String,
    /// 允许发起 save 的源站
    pub origin: String,
    /// 对象 ID 的修订号，换版式时递增
    #[serde(default = "default_revision")]
    pub revision: u32,
}

fn default_wallet_api_base() -> String {
    "https://walletobjects.googleapis.com/walletobjects/v1".to_string()
}

fn default_save_endpoint() -> String {
    "https://pay.google.com/gp/v/save".to_string()
}

fn default_revision() -> u32 {
    1
}

/// 二进制卡包配置（Apple 生态）
#[derive(Debug, Clone, Deserialize)]
pub struct PassArchiveConfig {
    pub pass_type_identifier: String,
    pub team_identifier: String,
    pub organization_name: String,
    /// 模板目录，须包含 icon.png / icon@2x.png / logo.png
    pub template_dir: String,
    pub signing_key_pem: Option<Secret<String>>,
    pub certificate_pem: Option<String>,
}

/// 设备回调凭证配置
#[derive(Debug, Clone, Deserialize)]
pub struct CallbackConfig {
    #[serde(default = "default_callback_scheme")]
    pub scheme: String,
    pub token: Secret<String>,
    /// 写进卡包 webServiceURL 的回调基址
    pub web_service_url: String,
}

fn default_callback_scheme() -> String {
    "ApplePass".to_string()
}

/// 应用配置
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub app_name: String,
    pub app_env: String,
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub telemetry: TelemetryConfig,
    pub tokens: TokenConfig,
    pub google_wallet: GoogleWalletConfig,
    pub pass_archive: PassArchiveConfig,
    pub callbacks: CallbackConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    pub fn load(config_dir: &str) -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config: Self = Figment::new()
            .merge(Toml::file(format!("{}/default.toml", config_dir)))
            .merge(Toml::file(format!("{}/{}.toml", config_dir, env)))
            .merge(Env::prefixed("").split("_"))
            .extract()?;

        Ok(config)
    }

    /// 是否为生产环境
    pub fn is_production(&self) -> bool {
        self.app_env == "production"
    }

    /// 是否为开发环境
    pub fn is_development(&self) -> bool {
        self.app_env == "development"
    }
}

#[cfg(test)]
mod tests;
