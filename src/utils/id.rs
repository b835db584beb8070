//! 标识生成
//!
//! 运行时内部对象（事件订阅等）使用 `前缀_10 位 62 进制` 形式的标识。

use rand::distributions::Alphanumeric;
use rand::Rng;

/// 随机部分长度
const ID_BODY_LENGTH: usize = 10;

/// 订阅标识前缀
pub const SUBSCRIPTION_PREFIX: &str = "sub";

/// 生成带前缀的随机标识
///
/// # 示例
///
/// ```
/// use chips_runtime::utils::id::generate_id;
///
/// let id = generate_id("sub");
/// assert!(id.starts_with("sub_"));
/// assert_eq!(id.len(), 14);
/// ```
pub fn generate_id(prefix: &str) -> String {
    let body: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ID_BODY_LENGTH)
        .map(char::from)
        .collect();
    format!("{}_{}", prefix, body)
}

/// 生成事件订阅标识
pub fn generate_subscription_id() -> String {
    generate_id(SUBSCRIPTION_PREFIX)
}

/// 验证标识格式
///
/// 要求形如 `prefix_xxxxxxxxxx`，随机部分为 10 位字母数字。
pub fn is_valid_id(id: &str, prefix: &str) -> bool {
    match id.split_once('_') {
        Some((head, body)) => {
            head == prefix
                && body.len() == ID_BODY_LENGTH
                && body.chars().all(|c| c.is_ascii_alphanumeric())
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generate_id_format() {
        let id = generate_subscription_id();
        assert!(is_valid_id(&id, SUBSCRIPTION_PREFIX));
    }

    #[test]
    fn test_generate_id_uniqueness() {
        let ids: HashSet<String> = (0..1000).map(|_| generate_subscription_id()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_is_valid_id() {
        assert!(is_valid_id("sub_a1B2c3D4e5", "sub"));
        assert!(!is_valid_id("sub_short", "sub"));
        assert!(!is_valid_id("evt_a1B2c3D4e5", "sub"));
        assert!(!is_valid_id("suba1B2c3D4e5", "sub"));
        assert!(!is_valid_id("sub_a1B2c3D4-5", "sub"));
    }
}
