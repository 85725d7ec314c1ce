//! 会话引用解析
//!
//! 支持的格式：
//! - `-100123456789` / `123456789`（数字 ID）
//! - `@username`
//! - `t.me/username`、`https://t.me/username`
//! - `t.me/c/123456789`（私有频道，转换为 `-100123456789`）

use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

/// 私有频道 ID 前缀
const CHANNEL_ID_PREFIX: &str = "-100";

static PRIVATE_LINK: OnceLock<Option<Regex>> = OnceLock::new();
static PUBLIC_LINK: OnceLock<Option<Regex>> = OnceLock::new();

fn private_link() -> Option<&'static Regex> {
    PRIVATE_LINK
        .get_or_init(|| Regex::new(r"^(?:https?://)?t\.me/c/(\d+)").ok())
        .as_ref()
}

fn public_link() -> Option<&'static Regex> {
    PUBLIC_LINK
        .get_or_init(|| Regex::new(r"^(?:https?://)?t\.me/([A-Za-z0-9_]+)").ok())
        .as_ref()
}

/// 解析后的会话引用
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatRef {
    /// 数字 ID
    Id(i64),
    /// 公开用户名（不含 @）
    Username(String),
}

impl fmt::Display for ChatRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatRef::Id(id) => write!(f, "{}", id),
            ChatRef::Username(name) => write!(f, "{}", name),
        }
    }
}

/// 解析会话链接 / ID / 用户名
///
/// 无法识别时返回 None
pub fn parse_chat_ref(raw: &str) -> Option<ChatRef> {
    let link = raw.trim();
    if link.is_empty() {
        return None;
    }

    if let Ok(id) = link.parse::<i64>() {
        return Some(ChatRef::Id(id));
    }

    if let Some(name) = link.strip_prefix('@') {
        return (!name.is_empty()).then(|| ChatRef::Username(name.to_string()));
    }

    // 私有频道链接必须先于公开链接匹配（`c` 本身也是合法用户名）
    if let Some(caps) = private_link()?.captures(link) {
        let full = format!("{}{}", CHANNEL_ID_PREFIX, &caps[1]);
        return full.parse::<i64>().ok().map(ChatRef::Id);
    }

    if let Some(caps) = public_link()?.captures(link) {
        return Some(ChatRef::Username(caps[1].to_string()));
    }

    None
}

/// 规范化会话引用，无法解析时原样返回（交给协议客户端处理）
pub fn normalize_reference(raw: &str) -> String {
    match parse_chat_ref(raw) {
        Some(chat_ref) => chat_ref.to_string(),
        None => {
            tracing::debug!("无法解析会话引用，原样传递: {}", raw);
            raw.trim().to_string()
        }
    }
}

/// 同一频道 ID 的常见写法（带 / 不带 -100 前缀）
pub fn channel_id_variants(id: &str) -> Vec<String> {
    let mut variants = vec![id.to_string()];
    if let Some(bare) = id.strip_prefix(CHANNEL_ID_PREFIX) {
        variants.push(bare.to_string());
    } else if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) {
        variants.push(format!("{}{}", CHANNEL_ID_PREFIX, id));
    }
    variants
}
