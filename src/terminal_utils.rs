//! 终端文本处理工具模块 - 清洗助手消息、生成摘要/HTML、从屏幕导出中提取预览

use regex::Regex;
use std::sync::OnceLock;

/// 完整消息长度上限
pub const MESSAGE_MAX_CHARS: usize = 12_000;
/// 摘要长度上限
pub const GIST_MAX_CHARS: usize = 420;
/// 屏幕预览最多保留的行数
const PREVIEW_MAX_LINES: usize = 220;

fn ansi_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1B\[[0-?]*[ -/]*[@-~]").expect("valid ansi regex"))
}

fn blank_lines_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n{3,}").expect("valid blank line regex"))
}

fn rule_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[-─═_\s>]+$").expect("valid rule regex"))
}

fn is_private_use(c: char) -> bool {
    matches!(c as u32, 0xE000..=0xF8FF | 0xF0000..=0xFFFFD | 0x100000..=0x10FFFD)
}

/// 清洗消息文本：去掉 ANSI 转义、私有区图标字符与控制字符，右侧去空白，折叠多余空行
pub fn clean_message_text(text: &str) -> String {
    let stripped = ansi_regex().replace_all(text, "");
    let filtered: String = stripped
        .chars()
        .filter(|c| !is_private_use(*c))
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();

    let joined = filtered
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n");
    blank_lines_regex()
        .replace_all(joined.trim(), "\n\n")
        .to_string()
}

/// 去掉工具调用回显等噪声行
pub fn strip_noise_lines(text: &str) -> String {
    const TOOL_PREFIXES: [&str; 7] = ["edit ", "write ", "read ", "bash ", "rg ", "find ", "python3 "];

    let kept: Vec<&str> = text
        .lines()
        .filter(|line| {
            let low = line.trim().to_lowercase();
            if low.is_empty() {
                return true;
            }
            if low.contains("/var/folders/") && low.contains("screenshot") {
                return false;
            }
            if TOOL_PREFIXES.iter().any(|p| low.starts_with(p)) {
                return false;
            }
            !low.contains("visual latest")
        })
        .collect();

    blank_lines_regex()
        .replace_all(kept.join("\n").trim(), "\n\n")
        .to_string()
}

/// 合并流式消息分片：去重，并将累积式分片折叠为最新版本
pub fn merge_message_chunks<S: AsRef<str>>(chunks: &[S]) -> String {
    let mut merged: Vec<String> = Vec::new();
    for chunk in chunks {
        let c = chunk.as_ref().trim();
        if c.is_empty() {
            continue;
        }
        if let Some(last) = merged.last_mut() {
            if last == c {
                continue;
            }
            if c.len() > last.len() && c.starts_with(last.as_str()) {
                *last = c.to_string();
                continue;
            }
        }
        merged.push(c.to_string());
    }
    strip_noise_lines(merged.join("\n").trim())
}

/// 截断到 max 个字符，超出时以 `...` 结尾
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let head: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", head)
}

/// 单行摘要：折叠空白，超长时保留末尾并加 `...` 前缀
pub fn message_gist(text: &str) -> Option<String> {
    let compact = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if compact.is_empty() {
        return None;
    }
    let count = compact.chars().count();
    if count <= GIST_MAX_CHARS {
        return Some(compact);
    }
    let tail: String = compact.chars().skip(count - (GIST_MAX_CHARS - 3)).collect();
    Some(format!("...{}", tail))
}

/// HTML 转义
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

/// 消息的 HTML 渲染
pub fn message_html(text: &str) -> Option<String> {
    if text.is_empty() {
        return None;
    }
    Some(format!(
        "<div class=\"pi-last-assistant\"><pre>{}</pre></div>",
        escape_html(text)
    ))
}

fn unescape_html(text: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"&(#x[0-9a-fA-F]+|#[0-9]+|[a-zA-Z]+);").expect("valid entity regex"));

    re.replace_all(text, |caps: &regex::Captures| {
        let entity = &caps[1];
        let decoded = if let Some(hex) = entity.strip_prefix("#x").or_else(|| entity.strip_prefix("#X")) {
            u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
        } else if let Some(dec) = entity.strip_prefix('#') {
            dec.parse::<u32>().ok().and_then(char::from_u32)
        } else {
            match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "nbsp" => Some(' '),
                _ => None,
            }
        };
        decoded
            .map(|c| c.to_string())
            .unwrap_or_else(|| caps[0].to_string())
    })
    .to_string()
}

/// 将 telemetry 提供的 HTML 还原为纯文本
pub fn html_to_text(html: &str) -> Option<String> {
    static BREAK_RE: OnceLock<Regex> = OnceLock::new();
    static BLOCK_RE: OnceLock<Regex> = OnceLock::new();
    static TAG_RE: OnceLock<Regex> = OnceLock::new();

    let raw = html.trim();
    if raw.is_empty() {
        return None;
    }
    let text = BREAK_RE
        .get_or_init(|| Regex::new(r"(?i)<br\s*/?>").expect("valid br regex"))
        .replace_all(raw, "\n");
    let text = BLOCK_RE
        .get_or_init(|| Regex::new(r"(?i)</(p|div|li|h[1-6]|tr)>").expect("valid block regex"))
        .replace_all(&text, "\n");
    let text = TAG_RE
        .get_or_init(|| Regex::new(r"<[^>]+>").expect("valid tag regex"))
        .replace_all(&text, "");

    let cleaned = clean_message_text(&unescape_html(&text));
    (!cleaned.is_empty()).then_some(cleaned)
}

/// 从屏幕导出中提取最近的有效输出行（跳过提示符与分隔线）
pub fn preview_from_terminal_dump(content: &str) -> Option<String> {
    let lines: Vec<String> = content
        .lines()
        .map(clean_message_text)
        .filter(|l| !l.is_empty())
        .collect();

    let mut selected: Vec<&str> = Vec::new();
    for line in lines.iter().rev() {
        let low = line.to_lowercase();
        if ["$", "%", "❯", "➜", "~", "pi>"].iter().any(|p| low.starts_with(p)) {
            continue;
        }
        if rule_line_regex().is_match(line) {
            continue;
        }
        if low.contains("statusd") && low.contains("blocked") {
            continue;
        }
        selected.push(line);
        if selected.len() >= PREVIEW_MAX_LINES {
            break;
        }
    }

    if selected.is_empty() {
        return None;
    }
    selected.reverse();
    let text = selected.join("\n").trim().to_string();
    Some(truncate_chars(&text, MESSAGE_MAX_CHARS))
}
