//! 会话日志解析 - 读取 JSONL 尾部窗口，提取最近一条助手消息

use anyhow::Result;
use chrono::DateTime;
use serde_json::Value;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::trace;

use crate::terminal_utils::{
    clean_message_text, merge_message_chunks, strip_noise_lines, truncate_chars, MESSAGE_MAX_CHARS,
};

/// 提取助手消息时读取的尾部窗口
pub const MESSAGE_TAIL_BYTES: u64 = 512 * 1024;
/// 仅有思考/状态文本时的长度上限
const FALLBACK_MAX_CHARS: usize = 8_000;

const SKIPPED_PART_TYPES: [&str; 12] = [
    "reasoning",
    "thinking",
    "analysis",
    "input_text",
    "input",
    "user",
    "toolcall",
    "tool_call",
    "toolresult",
    "tool_result",
    "summary",
    "summary_text",
];

/// 读取文件末尾 `max_bytes` 字节；从中间开始读时丢弃第一行残片
pub fn read_tail(path: &Path, max_bytes: u64) -> Result<String> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let start = len.saturating_sub(max_bytes);
    file.seek(SeekFrom::Start(start))?;

    let mut buf = Vec::with_capacity((len - start) as usize);
    file.read_to_end(&mut buf)?;
    let text = String::from_utf8_lossy(&buf).to_string();

    if start > 0 {
        Ok(text.split_once('\n').map(|(_, rest)| rest.to_string()).unwrap_or_default())
    } else {
        Ok(text)
    }
}

/// 时间戳归一化为毫秒：毫秒/秒数值或 ISO-8601 字符串
pub fn timestamp_ms_from_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => {
            let n = n.as_f64()? as i64;
            if n > 1_000_000_000_000 {
                Some(n)
            } else if n > 1_000_000_000 {
                Some(n * 1000)
            } else {
                None
            }
        }
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|dt| dt.timestamp_millis()),
        _ => None,
    }
}

/// `{"type":"message","message":{...}}` 包装时取内层
fn message_payload(obj: &Value) -> &Value {
    let is_wrapper = obj
        .get("type")
        .and_then(Value::as_str)
        .map(|t| t.eq_ignore_ascii_case("message"))
        .unwrap_or(false);
    match obj.get("message") {
        Some(inner) if is_wrapper && inner.is_object() => inner,
        _ => obj,
    }
}

fn lower_field(obj: &Value, key: &str) -> String {
    obj.get(key)
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_lowercase()
}

fn is_user_message(obj: &Value) -> bool {
    lower_field(message_payload(obj), "role") == "user"
}

fn is_assistant_message(obj: &Value) -> bool {
    matches!(
        lower_field(message_payload(obj), "role").as_str(),
        "assistant" | "agent" | "model"
    )
}

fn message_timestamp_ms(obj: &Value) -> Option<i64> {
    const KEYS: [&str; 5] = ["timestamp", "ts", "createdAt", "updatedAt", "lastAssistantUpdatedAt"];
    [obj, message_payload(obj)].iter().find_map(|candidate| {
        KEYS.iter()
            .find_map(|key| candidate.get(*key).and_then(timestamp_ms_from_value))
    })
}

/// 递归提取可见文本，跳过推理与工具调用部分
pub fn extract_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Array(items) => join_parts(items.iter().filter_map(extract_text)),
        Value::Object(_) => {
            let payload = message_payload(value);
            let kind = lower_field(payload, "type");
            let role = lower_field(payload, "role");
            if matches!(
                kind.as_str(),
                "reasoning" | "thinking" | "analysis" | "toolcall" | "tool_call" | "toolresult" | "tool_result"
            ) || matches!(
                role.as_str(),
                "reasoning" | "thinking" | "tool" | "toolresult" | "tool_result"
            ) {
                return None;
            }

            if let Some(Value::Array(parts)) = payload.get("content") {
                let joined = join_parts(parts.iter().filter_map(content_part_text));
                if joined.is_some() {
                    return joined;
                }
            } else if let Some(Value::String(content)) = payload.get("content") {
                let content = content.trim();
                if !content.is_empty() {
                    return Some(content.to_string());
                }
            }

            ["text", "output"]
                .iter()
                .find_map(|key| payload.get(*key).and_then(extract_text))
        }
        _ => None,
    }
}

fn content_part_text(part: &Value) -> Option<String> {
    if !part.is_object() {
        return extract_text(part);
    }
    let kind = lower_field(part, "type");
    if SKIPPED_PART_TYPES.contains(&kind.as_str()) {
        return None;
    }
    if kind == "text" || kind == "output_text" {
        return part.get("text").and_then(extract_text);
    }
    ["content", "text", "output"]
        .iter()
        .find_map(|key| part.get(*key).filter(|v| !v.is_null()))
        .and_then(extract_text)
}

fn join_parts(parts: impl Iterator<Item = String>) -> Option<String> {
    let parts: Vec<String> = parts.collect();
    (!parts.is_empty()).then(|| parts.join("\n"))
}

fn looks_like_tool_trace(text: &str) -> bool {
    const MARKERS: [&str; 14] = [
        "edit ",
        "write ",
        "read ",
        "bash ",
        "rg ",
        "find ",
        "python3 ",
        "swift build",
        "processes:",
        "stderr:",
        "stdout:",
        "recipient_name",
        "tool_uses",
        "command exited with code",
    ];
    let low = text.trim().to_lowercase();
    if MARKERS.iter().any(|m| low.contains(m)) {
        return true;
    }
    (low.starts_with('{') || low.starts_with('[')) && low.contains("parameters")
}

fn looks_like_thinking_or_status(text: &str) -> bool {
    let low = text.to_lowercase();
    low.contains("thinking")
        || low.contains("reasoning")
        || low.contains("working...")
        || low.contains("visual latest")
        || (low.contains("gpt-5") && low.contains("think:"))
}

/// 最近一条助手消息
#[derive(Debug, Clone, PartialEq)]
pub struct AssistantMessage {
    pub text: String,
    pub at_ms: Option<i64>,
}

/// 从 JSONL 文本中提取最近一段连续的助手消息
pub fn latest_assistant_message(content: &str) -> Option<AssistantMessage> {
    let mut chunks: Vec<String> = Vec::new();
    let mut latest_ts: Option<i64> = None;
    let mut started = false;
    let mut fallback: Option<AssistantMessage> = None;

    for line in content.lines().rev() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(obj) = serde_json::from_str::<Value>(line) else {
            if started {
                break;
            }
            continue;
        };

        if !is_assistant_message(&obj) {
            if started && is_user_message(&obj) {
                break;
            }
            continue;
        }

        let Some(text) = extract_text(&obj).map(|t| clean_message_text(&t)) else {
            continue;
        };
        if text.is_empty() {
            continue;
        }

        let ts = message_timestamp_ms(&obj);
        if latest_ts.is_none() {
            latest_ts = ts;
        }
        if looks_like_tool_trace(&text) {
            continue;
        }
        if looks_like_thinking_or_status(&text) {
            if fallback.is_none() {
                fallback = Some(AssistantMessage { text, at_ms: ts });
            }
            continue;
        }

        started = true;
        chunks.push(text);
    }

    if !chunks.is_empty() {
        chunks.reverse();
        let merged = merge_message_chunks(&chunks);
        return Some(AssistantMessage {
            text: truncate_chars(&merged, MESSAGE_MAX_CHARS),
            at_ms: latest_ts,
        });
    }

    fallback.map(|f| AssistantMessage {
        text: truncate_chars(&strip_noise_lines(&f.text), FALLBACK_MAX_CHARS),
        at_ms: f.at_ms,
    })
}

#[derive(Debug, Clone)]
struct CacheEntry {
    modified: Option<SystemTime>,
    size: u64,
    message: Option<AssistantMessage>,
}

/// 带缓存的会话日志消息读取器，按 (路径, 修改时间, 大小) 失效
#[derive(Debug, Default)]
pub struct TranscriptReader {
    cache: HashMap<PathBuf, CacheEntry>,
}

impl TranscriptReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest_message(&mut self, path: &Path) -> Option<AssistantMessage> {
        let meta = std::fs::metadata(path).ok().filter(|m| m.is_file())?;
        let modified = meta.modified().ok();
        let size = meta.len();

        if let Some(entry) = self.cache.get(path) {
            if entry.modified == modified && entry.size == size {
                return entry.message.clone();
            }
        }

        let content = match read_tail(path, MESSAGE_TAIL_BYTES) {
            Ok(c) => c,
            Err(e) => {
                trace!(path = %path.display(), error = %e, "Transcript not readable");
                return None;
            }
        };
        let message = latest_assistant_message(&content);
        self.cache.insert(
            path.to_path_buf(),
            CacheEntry {
                modified,
                size,
                message: message.clone(),
            },
        );
        message
    }
}
