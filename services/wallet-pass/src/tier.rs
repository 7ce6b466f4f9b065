//! 等级归一化
//!
//! 严格匹配和宽松匹配是两个独立的纯函数：
//! 严格匹配用于用户显式传入的 query/body 值，
//! 宽松匹配只用于外部库里的自由文本（可能夹着营销文案）。

use serde::{Deserialize, Serialize};

/// 会员等级，决定卡面配色与权益文案
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Blue,
    Gold,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blue => "blue",
            Self::Gold => "gold",
        }
    }

    /// 卡面展示名
    pub fn label(&self) -> &'static str {
        match self {
            Self::Blue => "Blue",
            Self::Gold => "Gold",
        }
    }

    /// Google 钱包对象的背景色
    pub fn hex_color(&self) -> &'static str {
        match self {
            Self::Blue => "#2b5da8",
            Self::Gold => "#d4af37",
        }
    }

    /// 卡包背景色（rgb 文本格式）
    pub fn background_color(&self) -> &'static str {
        match self {
            Self::Blue => "rgb(43,93,168)",
            Self::Gold => "rgb(212,175,55)",
        }
    }

    /// 卡包前景色
    pub fn foreground_color(&self) -> &'static str {
        match self {
            Self::Blue => "rgb(255,255,255)",
            Self::Gold => "rgb(40,32,8)",
        }
    }

    /// 权益说明，两个生态的卡面保持一致
    pub fn benefit_text(&self) -> &'static str {
        match self {
            Self::Blue => "Blue member: 5% off every visit.",
            Self::Gold => "Gold member: 15% off every visit.",
        }
    }
}

/// 严格匹配的精确 token 集合
const GOLD_TOKENS: &[&str] = &["gold", "15", "15%"];
const BLUE_TOKENS: &[&str] = &["blue", "5", "5%"];

/// 宽松匹配的关键词集合，先查 gold 再查 blue
/// （"15" 包含 "5"，顺序不能反）
const GOLD_KEYWORDS: &[&str] = &["gold", "15"];
const BLUE_KEYWORDS: &[&str] = &["blue", "5"];

/// 严格归一化：必须整体等于某个精确 token
pub fn normalize_strict(raw: &str) -> Option<Tier> {
    let value = raw.trim().to_lowercase();
    if value.is_empty() {
        return None;
    }
    if GOLD_TOKENS.contains(&value.as_str()) {
        return Some(Tier::Gold);
    }
    if BLUE_TOKENS.contains(&value.as_str()) {
        return Some(Tier::Blue);
    }
    None
}

/// 宽松归一化：包含关键词即可，只用于外部库的自由文本
pub fn normalize_loose(raw: &str) -> Option<Tier> {
    let value = raw.trim().to_lowercase();
    if value.is_empty() {
        return None;
    }
    if GOLD_KEYWORDS.iter().any(|k| value.contains(k)) {
        return Some(Tier::Gold);
    }
    if BLUE_KEYWORDS.iter().any(|k| value.contains(k)) {
        return Some(Tier::Blue);
    }
    None
}

/// 等级裁决：body > query > 外部库 > 默认 blue
///
/// 这是全局唯一的优先级实现，所有入口都经过这里，
/// 调用方永远可以覆盖库里的值。
pub fn resolve_tier(body: Option<&str>, query: Option<&str>, store: Option<&str>) -> Tier {
    body.and_then(normalize_strict)
        .or_else(|| query.and_then(normalize_strict))
        .or_else(|| store.and_then(normalize_loose))
        .unwrap_or(Tier::Blue)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strict_exact_tokens_only() {
        assert_eq!(normalize_strict("gold"), Some(Tier::Gold));
        assert_eq!(normalize_strict("GOLD"), Some(Tier::Gold));
        assert_eq!(normalize_strict(" 15% "), Some(Tier::Gold));
        assert_eq!(normalize_strict("blue"), Some(Tier::Blue));
        assert_eq!(normalize_strict("5"), Some(Tier::Blue));
        // 自由文本不被严格匹配接受
        assert_eq!(normalize_strict("Gold 15%"), None);
        assert_eq!(normalize_strict("platinum"), None);
        assert_eq!(normalize_strict(""), None);
    }

    #[test]
    fn test_loose_matches_free_text() {
        assert_eq!(normalize_loose("Gold 15%"), Some(Tier::Gold));
        assert_eq!(normalize_loose("VIP gold member"), Some(Tier::Gold));
        assert_eq!(normalize_loose("blue 5% welcome"), Some(Tier::Blue));
        // "15" 含 "5"，必须先判 gold
        assert_eq!(normalize_loose("15% off"), Some(Tier::Gold));
        assert_eq!(normalize_loose("silver"), None);
    }

    #[test]
    fn test_precedence_body_wins() {
        // body=blue, query=gold, store="Gold 15%" => blue
        let tier = resolve_tier(Some("blue"), Some("gold"), Some("Gold 15%"));
        assert_eq!(tier, Tier::Blue);
    }

    #[test]
    fn test_precedence_query_over_store() {
        let tier = resolve_tier(None, Some("gold"), Some("blue"));
        assert_eq!(tier, Tier::Gold);
    }

    #[test]
    fn test_precedence_store_then_default() {
        assert_eq!(resolve_tier(None, None, Some("Gold 15%")), Tier::Gold);
        assert_eq!(resolve_tier(None, None, None), Tier::Blue);
        // 库里的垃圾值落回默认
        assert_eq!(resolve_tier(None, None, Some("n/a")), Tier::Blue);
    }

    #[test]
    fn test_unmatched_body_falls_through() {
        // body 给了但不是精确 token，不能拦住 query
        assert_eq!(resolve_tier(Some("platinum"), Some("gold"), None), Tier::Gold);
    }
}
