//! 会话日志定位模块 - 根据工作目录找到最新的会话日志，并从标题事件推断活动状态
//!
//! 会话日志按工作目录分组存放：`<root>/--<cwd 编码>--/*.jsonl`，修改时间最新的文件
//! 为当前会话。目录扫描结果按刷新间隔缓存。

use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, trace};

use crate::activity::ActivityState;
use crate::transcript::read_tail;

/// 工作目录到会话日志目录名的编码
pub fn encode_cwd(cwd: &str) -> String {
    let trimmed = cwd.trim_start_matches(['/', '\\']);
    format!("--{}--", trimmed.replace(['/', '\\', ':'], "-"))
}

#[derive(Debug, Clone)]
struct CachedLookup {
    path: Option<PathBuf>,
    checked_at: Instant,
}

/// 会话日志定位器
#[derive(Debug)]
pub struct SessionLogLocator {
    root: PathBuf,
    refresh: Duration,
    cache: HashMap<String, CachedLookup>,
}

impl SessionLogLocator {
    pub fn new(root: impl Into<PathBuf>, refresh: Duration) -> Self {
        Self {
            root: root.into(),
            refresh,
            cache: HashMap::new(),
        }
    }

    /// 工作目录对应的会话日志目录
    pub fn transcript_dir(&self, cwd: &str) -> PathBuf {
        self.root.join(encode_cwd(cwd))
    }

    /// 返回工作目录下最近修改的会话日志；在刷新间隔内复用上次结果
    pub fn locate(&mut self, cwd: &str) -> Option<PathBuf> {
        if let Some(cached) = self.cache.get(cwd) {
            if cached.checked_at.elapsed() < self.refresh {
                return cached.path.clone();
            }
        }

        let path = newest_jsonl(&self.transcript_dir(cwd));
        trace!(cwd = %cwd, found = path.is_some(), "Session log lookup");
        self.cache.insert(
            cwd.to_string(),
            CachedLookup {
                path: path.clone(),
                checked_at: Instant::now(),
            },
        );
        path
    }

    /// 清除缓存（测试与强制刷新用）
    pub fn invalidate(&mut self) {
        self.cache.clear();
    }
}

fn newest_jsonl(dir: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(dir).ok()?;
    entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("jsonl"))
        .filter_map(|p| {
            let modified = fs::metadata(&p).and_then(|m| m.modified()).ok()?;
            Some((modified, p))
        })
        .max_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)))
        .map(|(_, p): (SystemTime, PathBuf)| p)
}

/// 会话日志中与活动推断相关的事件
#[derive(Debug, Clone, PartialEq)]
enum TranscriptEvent {
    Title(String),
    SessionStart,
}

fn classify_line(obj: &Value) -> Option<TranscriptEvent> {
    let kind = obj.get("type").and_then(Value::as_str)?;
    match kind {
        "session" => Some(TranscriptEvent::SessionStart),
        "title" | "terminal_title" => ["title", "text"]
            .iter()
            .find_map(|key| obj.get(*key).and_then(Value::as_str))
            .map(|t| TranscriptEvent::Title(t.to_string())),
        "custom" if obj.get("customType").and_then(Value::as_str) == Some("terminal_title") => obj
            .get("data")
            .and_then(|d| d.get("title"))
            .and_then(Value::as_str)
            .map(|t| TranscriptEvent::Title(t.to_string())),
        _ => None,
    }
}

/// 标题末尾带括号状态（如 `pi - app (thinking)`）表示仍在运行
pub fn title_activity(title: &str) -> ActivityState {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\([^()]*\)\s*$").expect("valid title suffix regex"));
    if re.is_match(title.trim()) {
        ActivityState::Running
    } else {
        ActivityState::WaitingInput
    }
}

/// 从会话日志内容推断活动状态
///
/// 从新到旧遍历：最先遇到的标题决定状态；先遇到会话开始事件或窗口开头仍无标题时
/// 视为运行中。
pub fn infer_activity_from_content(content: &str) -> ActivityState {
    for line in content.lines().rev() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(obj) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        match classify_line(&obj) {
            Some(TranscriptEvent::Title(title)) => return title_activity(&title),
            Some(TranscriptEvent::SessionStart) => return ActivityState::Running,
            None => {}
        }
    }
    ActivityState::Running
}

/// 读取会话日志尾部并推断活动状态；文件不可读时返回 None
pub fn infer_activity(path: &Path, tail_bytes: u64) -> Option<ActivityState> {
    match read_tail(path, tail_bytes) {
        Ok(content) => Some(infer_activity_from_content(&content)),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Session log unreadable, no inference");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lines(values: &[Value]) -> String {
        values.iter().map(|v| v.to_string()).collect::<Vec<_>>().join("\n")
    }

    #[test]
    fn test_encode_cwd() {
        assert_eq!(encode_cwd("/Users/me/work/app"), "--Users-me-work-app--");
        assert_eq!(encode_cwd("C:\\src\\app"), "--C--src-app--");
    }

    #[test]
    fn test_title_suffix_means_running() {
        assert_eq!(title_activity("pi - app (thinking)"), ActivityState::Running);
        assert_eq!(title_activity("pi - app"), ActivityState::WaitingInput);
        assert_eq!(title_activity("pi (v2) - app"), ActivityState::WaitingInput);
    }

    #[test]
    fn test_newest_title_wins() {
        let content = lines(&[
            json!({"type": "session"}),
            json!({"type": "title", "title": "pi - app (working)"}),
            json!({"type": "message", "role": "assistant"}),
            json!({"type": "custom", "customType": "terminal_title", "data": {"title": "pi - app"}}),
        ]);
        assert_eq!(infer_activity_from_content(&content), ActivityState::WaitingInput);
    }

    #[test]
    fn test_session_start_before_title_means_running() {
        let content = lines(&[
            json!({"type": "terminal_title", "text": "pi - old"}),
            json!({"type": "session"}),
            json!({"type": "message", "role": "user"}),
        ]);
        assert_eq!(infer_activity_from_content(&content), ActivityState::Running);
    }

    #[test]
    fn test_no_title_defaults_to_running() {
        assert_eq!(infer_activity_from_content(""), ActivityState::Running);
        assert_eq!(
            infer_activity_from_content("not json\n{\"type\":\"message\"}"),
            ActivityState::Running
        );
    }

    #[test]
    fn test_unreadable_file_has_no_inference() {
        assert_eq!(infer_activity(Path::new("/nonexistent/log.jsonl"), 1024), None);
    }

    #[test]
    fn test_locate_newest_and_cache() {
        let root = tempfile::tempdir().unwrap();
        let mut locator = SessionLogLocator::new(root.path(), Duration::from_secs(60));
        let dir = locator.transcript_dir("/work/app");
        assert_eq!(locator.locate("/work/app"), None);

        fs::create_dir_all(&dir).unwrap();
        let older = dir.join("a.jsonl");
        let newer = dir.join("b.jsonl");
        fs::write(&older, "{}").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        fs::write(&newer, "{}").unwrap();
        fs::write(dir.join("notes.txt"), "x").unwrap();

        // 刷新间隔内仍返回缓存结果
        assert_eq!(locator.locate("/work/app"), None);

        locator.invalidate();
        assert_eq!(locator.locate("/work/app"), Some(newer));
    }
}
