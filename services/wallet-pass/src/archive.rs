//! 二进制卡包生成（Apple 生态）
//!
//! pass.json + SHA-1 清单 + RSA 签名打成 zip。同样的输入必须
//! 得到逐字节相同的包：清单按文件名排序，zip 条目定序、时间戳
//! 固定，签名用确定性的 PKCS#1 v1.5。

use rsa::RsaPrivateKey;
use rsa::pkcs1v15::SigningKey;
use rsa::sha2::Sha256 as RsaSha256;
use rsa::signature::{SignatureEncoding, Signer};
use secrecy::ExposeSecret;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::io::Write;
use tracing::warn;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use cardlink_common::to_barcode_safe;
use cardlink_config::{CallbackConfig, PassArchiveConfig};
use cardlink_errors::{AppError, AppResult};

use crate::tier::Tier;

/// 模板目录里必须存在的图标资源
const REQUIRED_ASSETS: &[&str] = &["icon.png", "icon@2x.png", "logo.png"];

/// 卡包序列号：身份三元组的 SHA-256 前 20 个十六进制字符
///
/// 同一会员同一等级永远拿到同一序列号，重复下载不会在设备上
/// 出现第二张卡。
pub fn serial_number(client_code: &str, campaign_code: &str, tier: Tier) -> String {
    let digest = Sha256::digest(format!("{}:{}:{}", client_code, campaign_code, tier.as_str()));
    hex::encode(digest)[..20].to_string()
}

/// 一张卡的全部可变输入
#[derive(Debug, Clone)]
pub struct PassSpec {
    pub serial_number: String,
    pub barcode_value: String,
    pub display_name: String,
    pub campaign_code: String,
    pub tier: Tier,
}

/// 卡包构建器
///
/// 签名私钥启动时解析一次；缺失或坏损在构建时以配置错误暴露，
/// 不影响其他入口。
pub struct PassArchiveBuilder {
    config: PassArchiveConfig,
    web_service_url: String,
    auth_token: String,
    signing_key: Option<RsaPrivateKey>,
}

impl PassArchiveBuilder {
    pub fn new(config: PassArchiveConfig, callbacks: &CallbackConfig) -> Self {
        let signing_key = config
            .signing_key_pem
            .as_ref()
            .and_then(|pem| match parse_rsa_key(pem.expose_secret()) {
                Some(key) => Some(key),
                None => {
                    warn!("Pass signing key is present but unparseable");
                    None
                }
            });

        Self {
            web_service_url: callbacks.web_service_url.clone(),
            auth_token: callbacks.token.expose_secret().clone(),
            config,
            signing_key,
        }
    }

    /// 生成签好名的卡包字节流
    pub fn build(&self, spec: &PassSpec) -> AppResult<Vec<u8>> {
        let key = self.signing_key.as_ref().ok_or_else(|| {
            AppError::configuration("pass signing key is not configured")
        })?;

        // BTreeMap 保证清单与 zip 条目都按文件名定序
        let mut entries: BTreeMap<String, Vec<u8>> = self.load_assets()?;
        entries.insert("pass.json".to_string(), self.pass_json(spec)?);
        if let Some(cert) = &self.config.certificate_pem {
            entries.insert("certificate.pem".to_string(), cert.clone().into_bytes());
        }

        // 清单盖住除自身与签名外的全部条目
        let manifest = manifest_json(&entries)?;
        let signature = sign_manifest(key, &manifest);
        entries.insert("manifest.json".to_string(), manifest);
        entries.insert("signature".to_string(), signature);

        write_archive(&entries)
    }

    fn load_assets(&self) -> AppResult<BTreeMap<String, Vec<u8>>> {
        let mut assets = BTreeMap::new();
        for name in REQUIRED_ASSETS {
            let path = std::path::Path::new(&self.config.template_dir).join(name);
            let bytes = std::fs::read(&path).map_err(|e| {
                AppError::configuration(format!(
                    "pass template asset {} is missing: {}",
                    name, e
                ))
            })?;
            assets.insert((*name).to_string(), bytes);
        }
        Ok(assets)
    }

    fn pass_json(&self, spec: &PassSpec) -> AppResult<Vec<u8>> {
        // serde_json 的 Map 按键排序，序列化结果天然稳定
        let pass = serde_json::json!({
            "formatVersion": 1,
            "passTypeIdentifier": self.config.pass_type_identifier,
            "teamIdentifier": self.config.team_identifier,
            "organizationName": self.config.organization_name,
            "serialNumber": spec.serial_number,
            "description": format!("{} membership card", spec.campaign_code),
            "webServiceURL": self.web_service_url,
            "authenticationToken": self.auth_token,
            "backgroundColor": spec.tier.background_color(),
            "foregroundColor": spec.tier.foreground_color(),
            "barcode": {
                "format": "PKBarcodeFormatCode128",
                "message": to_barcode_safe(&spec.barcode_value),
                "messageEncoding": "iso-8859-1"
            },
            "storeCard": {
                "primaryFields": [
                    { "key": "member", "label": "MEMBER", "value": spec.display_name }
                ],
                "secondaryFields": [
                    { "key": "tier", "label": "TIER", "value": spec.tier.label() }
                ],
                "auxiliaryFields": [
                    { "key": "benefit", "label": "BENEFIT", "value": spec.tier.benefit_text() }
                ]
            }
        });

        serde_json::to_vec(&pass)
            .map_err(|e| AppError::internal(format!("pass.json serialization failed: {}", e)))
    }
}

/// 清单：条目名到其内容 SHA-1 十六进制摘要
fn manifest_json(entries: &BTreeMap<String, Vec<u8>>) -> AppResult<Vec<u8>> {
    let manifest: BTreeMap<&str, String> = entries
        .iter()
        .map(|(name, bytes)| (name.as_str(), hex::encode(Sha1::digest(bytes))))
        .collect();

    serde_json::to_vec(&manifest)
        .map_err(|e| AppError::internal(format!("manifest serialization failed: {}", e)))
}

/// PKCS#1 v1.5 是确定性签名，不引入随机字节
fn sign_manifest(key: &RsaPrivateKey, manifest: &[u8]) -> Vec<u8> {
    SigningKey::<RsaSha256>::new(key.clone())
        .sign(manifest)
        .to_vec()
}

fn write_archive(entries: &BTreeMap<String, Vec<u8>>) -> AppResult<Vec<u8>> {
    let mut writer = ZipWriter::new(std::io::Cursor::new(Vec::new()));
    // 固定时间戳，复跑不改变输出
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default());

    for (name, bytes) in entries {
        writer
            .start_file(name, options)
            .map_err(|e| AppError::internal(format!("archive entry {} failed: {}", name, e)))?;
        writer
            .write_all(bytes)
            .map_err(|e| AppError::internal(format!("archive write failed: {}", e)))?;
    }

    let cursor = writer
        .finish()
        .map_err(|e| AppError::internal(format!("archive finalization failed: {}", e)))?;
    Ok(cursor.into_inner())
}

fn parse_rsa_key(pem: &str) -> Option<RsaPrivateKey> {
    use rsa::pkcs1::DecodeRsaPrivateKey;
    use rsa::pkcs8::DecodePrivateKey;

    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .ok()
}
