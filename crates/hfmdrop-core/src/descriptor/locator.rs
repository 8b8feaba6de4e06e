//! 可分享的定位串
//!
//! 格式: `magnet:?xt=urn:btmh:1220<内容 ID>&dn=<文件名>`
//! - `1220` 是 SHA-256 multihash 前缀
//! - `dn` 使用百分号编码，可选

const SCHEME: &str = "magnet:?";
const XT_PREFIX: &str = "urn:btmh:1220";

/// 内容 ID 的十六进制长度 (SHA-256)
pub const CONTENT_ID_HEX_LEN: usize = 64;

/// 解析后的定位串
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locator {
    pub content_id: String,
    pub display_name: Option<String>,
}

/// 生成定位串
pub fn format_locator(content_id: &str, display_name: &str) -> String {
    format!(
        "{SCHEME}xt={XT_PREFIX}{}&dn={}",
        content_id.to_ascii_lowercase(),
        percent_encode(display_name)
    )
}

/// 解析定位串，`xt` 可以出现在任意位置
pub fn parse_locator(text: &str) -> Option<Locator> {
    let query = text.strip_prefix(SCHEME)?;

    let mut content_id = None;
    let mut display_name = None;
    for pair in query.split('&') {
        let (key, value) = pair.split_once('=')?;
        match key {
            "xt" => {
                let hex = value.strip_prefix(XT_PREFIX)?;
                if hex.len() != CONTENT_ID_HEX_LEN || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
                    return None;
                }
                content_id = Some(hex.to_ascii_lowercase());
            }
            "dn" => display_name = percent_decode(value),
            _ => {}
        }
    }

    Some(Locator {
        content_id: content_id?,
        display_name,
    })
}

fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

fn percent_decode(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = s.get(i + 1..i + 3)?;
                out.push(u8::from_str_radix(hex, 16).ok()?);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).ok()
}
