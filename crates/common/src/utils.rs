//! 通用工具函数

use uuid::Uuid;

/// 生成新的 UUID v7（时间有序）
pub fn new_id() -> Uuid {
    Uuid::now_v7()
}

/// 把任意编码压成标识符安全的形式
///
/// 钱包对象 ID 只允许 `[A-Za-z0-9_]`，其余字符一律替换为下划线。
pub fn sanitize_token(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// 去掉无法进入一维条码的字符（仅保留可打印 ASCII）
pub fn to_barcode_safe(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii() && !c.is_ascii_control())
        .collect()
}
