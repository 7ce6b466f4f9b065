//! 通用类型定义

use derive_more::{Display, From};
use serde::{Deserialize, Serialize};

/// 客户编码（会员卡所属客户，例如 "L0083"）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From)]
#[display("{_0}")]
pub struct ClientCode(pub String);

impl ClientCode {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// 活动编码（发卡活动，例如 "CP0163"）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From)]
#[display("{_0}")]
pub struct CampaignCode(pub String);

impl CampaignCode {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}
