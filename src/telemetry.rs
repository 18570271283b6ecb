//! Telemetry 读取模块 - 解析代理写出的实例状态文件
//!
//! 每个实例一个 JSON 文件。只有 pid 有效、`updatedAt` 为数值、进程仍在进程表中、
//! 且未过期的记录才会被采用；损坏或字段类型不对的文件直接跳过。

use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, trace};

use crate::activity::ActivityState;
use crate::mux::Mux;
use crate::process::ProcessTable;
use crate::transcript::timestamp_ms_from_value;

/// 默认来源标识
pub const DEFAULT_TELEMETRY_SOURCE: &str = "pi-telemetry";

/// 一条可信的 telemetry 记录
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TelemetryRecord {
    pub pid: u32,
    pub ppid: Option<u32>,
    pub updated_at_ms: i64,
    pub source: String,
    pub activity: ActivityState,
    pub cwd: Option<String>,
    pub model_provider: Option<String>,
    pub model_id: Option<String>,
    pub model_name: Option<String>,
    pub session_id: Option<String>,
    pub session_name: Option<String>,
    pub session_file: Option<String>,
    pub context_percent: Option<f64>,
    pub context_pressure: Option<String>,
    pub context_close_to_limit: Option<bool>,
    pub context_near_limit: Option<bool>,
    pub context_tokens: Option<u64>,
    pub context_window: Option<u64>,
    pub context_remaining_tokens: Option<u64>,
    pub last_assistant_text: Option<String>,
    pub last_assistant_html: Option<String>,
    pub last_assistant_at_ms: Option<i64>,
    pub routing_mux: Option<Mux>,
    pub routing_mux_session: Option<String>,
    pub tmux_pane_target: Option<String>,
    pub bridge_active: Option<bool>,
}

impl TelemetryRecord {
    /// 从 JSON 解析；pid 或 updatedAt 无效时返回 None
    pub fn from_json(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let process = obj.get("process")?.as_object()?;

        let pid = process.get("pid")?.as_u64().filter(|p| *p > 0)?;
        let pid = u32::try_from(pid).ok()?;
        let updated_at_ms = process.get("updatedAt")?.as_f64()? as i64;

        let state = obj.get("state").unwrap_or(&Value::Null);
        let workspace = section(obj.get("workspace"));
        let model = section(obj.get("model"));
        let session = section(obj.get("session"));
        let context = section(obj.get("context"));
        let messages = section(obj.get("messages"));
        let routing = section(obj.get("routing"));

        let bridge_active = obj
            .get("extensions")
            .and_then(|e| e.get("bridge"))
            .and_then(|b| b.get("active"))
            .and_then(Value::as_bool);

        Some(Self {
            pid,
            ppid: process
                .get("ppid")
                .and_then(Value::as_u64)
                .and_then(|p| u32::try_from(p).ok()),
            updated_at_ms,
            source: str_field(obj.get("source")).unwrap_or_else(|| DEFAULT_TELEMETRY_SOURCE.to_string()),
            activity: map_activity(state),
            cwd: str_field(workspace.get("cwd")),
            model_provider: str_field(model.get("provider")),
            model_id: str_field(model.get("id")),
            model_name: str_field(model.get("name")),
            session_id: str_field(session.get("id")),
            session_name: str_field(session.get("name")),
            session_file: str_field(session.get("file")),
            context_percent: context.get("percent").and_then(Value::as_f64),
            context_pressure: str_field(context.get("pressure")),
            context_close_to_limit: context.get("closeToLimit").and_then(Value::as_bool),
            context_near_limit: context.get("nearLimit").and_then(Value::as_bool),
            context_tokens: count_field(context.get("tokens")),
            context_window: count_field(context.get("contextWindow")),
            context_remaining_tokens: count_field(context.get("remainingTokens")),
            last_assistant_text: str_field(messages.get("lastAssistantText")),
            last_assistant_html: str_field(messages.get("lastAssistantHtml")),
            last_assistant_at_ms: messages
                .get("lastAssistantUpdatedAt")
                .and_then(timestamp_ms_from_value),
            routing_mux: routing.get("mux").and_then(Value::as_str).and_then(Mux::parse),
            routing_mux_session: str_field(routing.get("muxSession")),
            tmux_pane_target: routing
                .get("tmux")
                .and_then(|t| t.get("paneTarget"))
                .and_then(|v| str_field(Some(v))),
            bridge_active,
        })
    }
}

static EMPTY: std::sync::OnceLock<serde_json::Map<String, Value>> = std::sync::OnceLock::new();

fn section(value: Option<&Value>) -> &serde_json::Map<String, Value> {
    value
        .and_then(Value::as_object)
        .unwrap_or_else(|| EMPTY.get_or_init(serde_json::Map::new))
}

/// 字符串字段（数字也按字符串接受），空白视为缺失
fn str_field(value: Option<&Value>) -> Option<String> {
    let text = match value? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

fn count_field(value: Option<&Value>) -> Option<u64> {
    value?.as_f64().filter(|n| *n >= 0.0).map(|n| n as u64)
}

/// 将 telemetry 的 state 映射为活动状态
pub fn map_activity(state: &Value) -> ActivityState {
    if let Some(s) = state.as_str() {
        return ActivityState::from_label(s);
    }
    let Some(obj) = state.as_object() else {
        return ActivityState::Unknown;
    };

    if let Some(label) = obj.get("activity").and_then(Value::as_str) {
        let mapped = ActivityState::from_label(label);
        if mapped != ActivityState::Unknown {
            return mapped;
        }
    }
    if obj.get("waitingForInput").and_then(Value::as_bool) == Some(true) {
        return ActivityState::WaitingInput;
    }
    if obj.get("busy").and_then(Value::as_bool) == Some(true)
        || obj.get("isIdle").and_then(Value::as_bool) == Some(false)
    {
        return ActivityState::Running;
    }
    ActivityState::Unknown
}

/// Telemetry 目录读取器
#[derive(Debug, Clone)]
pub struct TelemetryReader {
    dir: PathBuf,
    stale: Duration,
}

impl TelemetryReader {
    pub fn new(dir: impl Into<PathBuf>, stale: Duration) -> Self {
        Self {
            dir: dir.into(),
            stale,
        }
    }

    /// 读取所有可信记录；同一 pid 有多个文件时取最新的
    pub fn read(&self, table: &ProcessTable, now_ms: i64) -> HashMap<u32, TelemetryRecord> {
        let mut records: HashMap<u32, TelemetryRecord> = HashMap::new();

        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                trace!(dir = %self.dir.display(), error = %e, "Telemetry directory not readable");
                return records;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(record) = self.read_file(&path) else {
                continue;
            };
            if !self.is_trusted(&record, table, now_ms) {
                continue;
            }
            match records.get(&record.pid) {
                Some(existing) if existing.updated_at_ms >= record.updated_at_ms => {}
                _ => {
                    records.insert(record.pid, record);
                }
            }
        }

        debug!(records = records.len(), "Telemetry read complete");
        records
    }

    fn read_file(&self, path: &Path) -> Option<TelemetryRecord> {
        let content = fs::read_to_string(path).ok()?;
        let value: Value = match serde_json::from_str(&content) {
            Ok(v) => v,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Skipping malformed telemetry file");
                return None;
            }
        };
        TelemetryRecord::from_json(&value)
    }

    /// 进程存活且未过期
    pub fn is_trusted(&self, record: &TelemetryRecord, table: &ProcessTable, now_ms: i64) -> bool {
        if !table.contains(record.pid) {
            trace!(pid = record.pid, "Dropping telemetry for vanished process");
            return false;
        }
        let age = now_ms.saturating_sub(record.updated_at_ms);
        if age > self.stale.as_millis() as i64 {
            trace!(pid = record.pid, age_ms = age, "Dropping stale telemetry");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::tests::row;
    use serde_json::json;

    fn table(pids: &[u32]) -> ProcessTable {
        ProcessTable::new(pids.iter().map(|p| row(*p, 1, "pi", "pi", "ttys001")).collect())
    }

    #[test]
    fn test_map_activity() {
        assert_eq!(map_activity(&json!({"activity": "working"})), ActivityState::Running);
        assert_eq!(
            map_activity(&json!({"activity": "waiting_input"})),
            ActivityState::WaitingInput
        );
        assert_eq!(map_activity(&json!({"waitingForInput": true})), ActivityState::WaitingInput);
        assert_eq!(map_activity(&json!({"busy": true})), ActivityState::Running);
        assert_eq!(map_activity(&json!({"isIdle": false})), ActivityState::Running);
        assert_eq!(map_activity(&json!({})), ActivityState::Unknown);
        assert_eq!(map_activity(&json!("waiting_input")), ActivityState::WaitingInput);
    }

    #[test]
    fn test_record_parsing() {
        let value = json!({
            "process": {"pid": 42, "ppid": 7, "updatedAt": 1000.5},
            "state": {"activity": "working"},
            "model": {"provider": "anthropic", "id": "m-1"},
            "context": {"percent": 41.5, "pressure": "normal", "tokens": 1000, "contextWindow": 200000},
            "messages": {"lastAssistantText": "hi", "lastAssistantUpdatedAt": 1700000000},
            "routing": {"mux": "tmux", "muxSession": "dev", "tmux": {"paneTarget": "dev:1.0"}},
            "extensions": {"bridge": {"active": true}}
        });
        let record = TelemetryRecord::from_json(&value).unwrap();
        assert_eq!(record.pid, 42);
        assert_eq!(record.ppid, Some(7));
        assert_eq!(record.updated_at_ms, 1000);
        assert_eq!(record.source, DEFAULT_TELEMETRY_SOURCE);
        assert_eq!(record.activity, ActivityState::Running);
        assert_eq!(record.context_tokens, Some(1000));
        assert_eq!(record.last_assistant_at_ms, Some(1_700_000_000_000));
        assert_eq!(record.routing_mux, Some(Mux::Tmux));
        assert_eq!(record.tmux_pane_target.as_deref(), Some("dev:1.0"));
        assert_eq!(record.bridge_active, Some(true));
    }

    #[test]
    fn test_invalid_records_rejected() {
        assert!(TelemetryRecord::from_json(&json!([1, 2])).is_none());
        assert!(TelemetryRecord::from_json(&json!({"process": {"pid": 0, "updatedAt": 1}})).is_none());
        assert!(TelemetryRecord::from_json(&json!({"process": {"pid": 5, "updatedAt": "soon"}})).is_none());
        assert!(TelemetryRecord::from_json(&json!({"process": {"pid": "5", "updatedAt": 1}})).is_none());
    }

    #[test]
    fn test_read_skips_stale_dead_and_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let now = 1_000_000;
        let write = |name: &str, body: String| fs::write(dir.path().join(name), body).unwrap();

        write("fresh.json", json!({"process": {"pid": 10, "updatedAt": now - 500}}).to_string());
        write("stale.json", json!({"process": {"pid": 11, "updatedAt": now - 60_000}}).to_string());
        write("dead.json", json!({"process": {"pid": 999, "updatedAt": now}}).to_string());
        write("broken.json", "{oops".to_string());
        write("notes.txt", "ignored".to_string());

        let reader = TelemetryReader::new(dir.path(), Duration::from_millis(10_000));
        let records = reader.read(&table(&[10, 11]), now);

        assert_eq!(records.len(), 1);
        assert!(records.contains_key(&10));
    }

    #[test]
    fn test_read_keeps_newest_record_per_pid() {
        let dir = tempfile::tempdir().unwrap();
        let now = 50_000;
        fs::write(
            dir.path().join("a.json"),
            json!({"process": {"pid": 10, "updatedAt": now - 100}, "state": {"activity": "working"}}).to_string(),
        )
        .unwrap();
        fs::write(
            dir.path().join("b.json"),
            json!({"process": {"pid": 10, "updatedAt": now - 10}, "state": {"activity": "waiting_input"}}).to_string(),
        )
        .unwrap();

        let reader = TelemetryReader::new(dir.path(), Duration::from_millis(10_000));
        let records = reader.read(&table(&[10]), now);
        assert_eq!(records[&10].activity, ActivityState::WaitingInput);
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let reader = TelemetryReader::new("/nonexistent/telemetry", Duration::from_secs(10));
        assert!(reader.read(&table(&[1]), 0).is_empty());
    }
}
