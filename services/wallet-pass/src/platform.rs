//! 平台识别与跳转状态机
//!
//! 无会话设计：每次跳转都把下一跳需要的最小状态重新签进新令牌，
//! 这里只负责纯函数部分（识别平台、给出下一跳路径）。

/// 目标钱包生态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Apple,
    Google,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Apple => "apple",
            Self::Google => "google",
        }
    }

    /// 解析显式 platform 参数；不认识的值不构成覆盖
    pub fn from_param(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "apple" | "ios" => Some(Self::Apple),
            "google" | "android" => Some(Self::Google),
            _ => None,
        }
    }
}

/// Apple 设备族 UA 标记，大小写不敏感的子串匹配
const APPLE_UA_MARKERS: &[&str] = &["iphone", "ipad", "ipod", "macintosh", "mac os x"];

/// 识别请求平台
///
/// 显式参数永远优先（邮件链接和手工测试用）；
/// 否则按 UA 标记判断；都不命中则默认走 Google 路径。
pub fn detect(user_agent: Option<&str>, explicit: Option<&str>) -> Platform {
    if let Some(param) = explicit {
        if let Some(platform) = Platform::from_param(param) {
            return platform;
        }
    }

    let ua = match user_agent {
        Some(ua) => ua.to_lowercase(),
        None => return Platform::Google,
    };

    if APPLE_UA_MARKERS.iter().any(|marker| ua.contains(marker)) {
        Platform::Apple
    } else {
        Platform::Google
    }
}

/// 状态机转移：已知平台后的下一跳路径前缀
pub fn next_hop(platform: Platform) -> &'static str {
    match platform {
        Platform::Apple => "/ios",
        Platform::Google => "/google",
    }
}
