//! 状态快照 - 代理行、汇总颜色、内容指纹与快照差异
//!
//! 指纹只覆盖对外可见且有意义的字段（活动状态、消息标识/时间、上下文压力），
//! 扫描时间等无关字段不会影响指纹。

use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::activity::{ActivityState, Confidence};
use crate::mux::Mux;
use crate::process::TerminalApp;

/// 协议版本号
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 一个代理的状态行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRow {
    pub pid: u32,
    pub ppid: u32,
    pub state: String,
    pub tty: String,
    pub cpu: f32,
    pub cwd: Option<String>,
    pub activity: ActivityState,
    pub confidence: Confidence,
    pub mux: Option<Mux>,
    pub mux_session: Option<String>,
    pub client_pid: Option<u32>,
    pub attached_window: bool,
    pub terminal_app: Option<TerminalApp>,
    pub telemetry_source: Option<String>,
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
    pub latest_message: Option<String>,
    pub latest_message_full: Option<String>,
    pub latest_message_html: Option<String>,
    pub latest_message_at: Option<i64>,
    pub latest_message_id: Option<String>,
    pub bridge_available: bool,
}

impl AgentRow {
    /// 最小行（其余字段为空），供聚合器与测试填充
    pub fn new(pid: u32, activity: ActivityState) -> Self {
        Self {
            pid,
            ppid: 0,
            state: String::new(),
            tty: crate::process::NO_TTY.to_string(),
            cpu: 0.0,
            cwd: None,
            activity,
            confidence: Confidence::Low,
            mux: None,
            mux_session: None,
            client_pid: None,
            attached_window: false,
            terminal_app: None,
            telemetry_source: None,
            model_provider: None,
            model_id: None,
            model_name: None,
            session_id: None,
            session_name: None,
            session_file: None,
            context_percent: None,
            context_pressure: None,
            context_close_to_limit: None,
            context_near_limit: None,
            context_tokens: None,
            context_window: None,
            context_remaining_tokens: None,
            latest_message: None,
            latest_message_full: None,
            latest_message_html: None,
            latest_message_at: None,
            latest_message_id: None,
            bridge_available: false,
        }
    }

    /// 参与指纹计算的可见字段
    fn visible_fields(&self) -> serde_json::Value {
        json!({
            "pid": self.pid,
            "activity": self.activity,
            "latest_message_id": self.latest_message_id,
            "latest_message_at": self.latest_message_at,
            "context_pressure": self.context_pressure,
        })
    }

    fn message_key(&self) -> (Option<&str>, Option<i64>) {
        (self.latest_message_id.as_deref(), self.latest_message_at)
    }
}

/// 消息标识：`pid|时间|全文` 的 SHA-256 前 16 位十六进制
pub fn message_id(pid: u32, at_ms: Option<i64>, text: Option<&str>) -> Option<String> {
    if at_ms.is_none() && text.map_or(true, str::is_empty) {
        return None;
    }
    let at = at_ms.map(|t| t.to_string()).unwrap_or_default();
    let digest = sha256_hex(format!("{}|{}|{}", pid, at, text.unwrap_or("")).as_bytes());
    Some(digest[..16].to_string())
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// 汇总颜色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryColor {
    Green,
    Red,
    Yellow,
    Gray,
}

/// 数据来源标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SnapshotSource {
    Telemetry,
    ProcessFallback,
    Offline,
}

/// 汇总
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub color: SummaryColor,
    pub label: String,
    pub total: usize,
    pub running: usize,
    pub waiting_input: usize,
    pub unknown: usize,
}

/// 根据活动状态计数得出颜色与标签
pub fn summarize(rows: &[AgentRow]) -> Summary {
    let total = rows.len();
    let running = rows.iter().filter(|r| r.activity == ActivityState::Running).count();
    let waiting = rows
        .iter()
        .filter(|r| r.activity == ActivityState::WaitingInput)
        .count();
    let unknown = total - running - waiting;

    let (color, label) = if total == 0 {
        (SummaryColor::Gray, "No Pi agents")
    } else if running == total {
        (SummaryColor::Red, "All agents running")
    } else if waiting == total {
        (SummaryColor::Green, "All agents waiting for input")
    } else if waiting > 0 {
        (SummaryColor::Yellow, "Some agents waiting for input")
    } else {
        (SummaryColor::Yellow, "Some agents in unknown state")
    };

    Summary {
        color,
        label: label.to_string(),
        total,
        running,
        waiting_input: waiting,
        unknown,
    }
}

/// 行排序：等待输入在前，其次运行中、未知；同类按 pid 升序
pub fn order_rows(rows: &mut [AgentRow]) {
    rows.sort_by_key(|r| (r.activity.sort_rank(), r.pid));
}

/// 快照指纹
pub fn fingerprint(rows: &[AgentRow]) -> String {
    let mut sorted: Vec<&AgentRow> = rows.iter().collect();
    sorted.sort_by_key(|r| r.pid);
    let canonical: Vec<serde_json::Value> = sorted.iter().map(|r| r.visible_fields()).collect();
    sha256_hex(serde_json::Value::Array(canonical).to_string().as_bytes())
}

/// 单个代理的指纹
pub fn agent_fingerprint(row: &AgentRow) -> String {
    sha256_hex(row.visible_fields().to_string().as_bytes())
}

/// 完整状态快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub ok: bool,
    /// Unix 秒
    pub timestamp: i64,
    pub version: String,
    pub source: SnapshotSource,
    pub summary: Summary,
    pub fingerprint: String,
    pub agents: Vec<AgentRow>,
}

impl StatusSnapshot {
    pub fn build(mut rows: Vec<AgentRow>, source: SnapshotSource, timestamp: i64) -> Self {
        order_rows(&mut rows);
        Self {
            ok: true,
            timestamp,
            version: VERSION.to_string(),
            source,
            summary: summarize(&rows),
            fingerprint: fingerprint(&rows),
            agents: rows,
        }
    }

    /// 空快照（启动时或扫描失败时）
    pub fn empty(source: SnapshotSource, timestamp: i64) -> Self {
        Self::build(Vec::new(), source, timestamp)
    }

    pub fn agent(&self, pid: u32) -> Option<&AgentRow> {
        self.agents.iter().find(|a| a.pid == pid)
    }
}

/// 快照变更事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChangeEvent {
    ActivityChanged {
        pid: u32,
        activity: ActivityState,
    },
    MessageUpdated {
        pid: u32,
        latest_message_id: Option<String>,
        latest_message_at: Option<i64>,
        latest_message: Option<String>,
    },
    AgentUpdated {
        pid: u32,
        context_pressure: Option<String>,
    },
    AgentGone {
        pid: u32,
    },
}

impl ChangeEvent {
    pub fn pid(&self) -> u32 {
        match self {
            ChangeEvent::ActivityChanged { pid, .. }
            | ChangeEvent::MessageUpdated { pid, .. }
            | ChangeEvent::AgentUpdated { pid, .. }
            | ChangeEvent::AgentGone { pid } => *pid,
        }
    }

    /// 事件名（SSE `event:` 字段）
    pub fn name(&self) -> &'static str {
        match self {
            ChangeEvent::ActivityChanged { .. } => "activity_changed",
            ChangeEvent::MessageUpdated { .. } => "message_updated",
            ChangeEvent::AgentUpdated { .. } => "agent_updated",
            ChangeEvent::AgentGone { .. } => "agent_gone",
        }
    }

    fn activity(row: &AgentRow) -> Self {
        ChangeEvent::ActivityChanged {
            pid: row.pid,
            activity: row.activity,
        }
    }

    fn message(row: &AgentRow) -> Self {
        ChangeEvent::MessageUpdated {
            pid: row.pid,
            latest_message_id: row.latest_message_id.clone(),
            latest_message_at: row.latest_message_at,
            latest_message: row.latest_message.clone(),
        }
    }

    fn updated(row: &AgentRow) -> Self {
        ChangeEvent::AgentUpdated {
            pid: row.pid,
            context_pressure: row.context_pressure.clone(),
        }
    }
}

/// 两个快照之间的变更列表，按 pid 排序
pub fn diff(prev: &StatusSnapshot, next: &StatusSnapshot) -> Vec<ChangeEvent> {
    let before: BTreeMap<u32, &AgentRow> = prev.agents.iter().map(|a| (a.pid, a)).collect();
    let after: BTreeMap<u32, &AgentRow> = next.agents.iter().map(|a| (a.pid, a)).collect();

    let mut pids: Vec<u32> = before.keys().chain(after.keys()).copied().collect();
    pids.sort_unstable();
    pids.dedup();

    let mut events = Vec::new();
    for pid in pids {
        match (before.get(&pid), after.get(&pid)) {
            (Some(_), None) => events.push(ChangeEvent::AgentGone { pid }),
            (None, Some(row)) => {
                events.push(ChangeEvent::activity(row));
                if row.latest_message_id.is_some() || row.latest_message_at.is_some() {
                    events.push(ChangeEvent::message(row));
                }
            }
            (Some(old), Some(new)) => {
                if old.activity != new.activity {
                    events.push(ChangeEvent::activity(new));
                }
                if old.message_key() != new.message_key() {
                    events.push(ChangeEvent::message(new));
                }
                if old.context_pressure != new.context_pressure {
                    events.push(ChangeEvent::updated(new));
                }
            }
            (None, None) => {}
        }
    }
    events
}

/// 单个代理的变更分类：活动 > 消息 > 其他
pub fn classify_agent_change(prev: &AgentRow, next: &AgentRow) -> ChangeEvent {
    if prev.activity != next.activity {
        ChangeEvent::activity(next)
    } else if prev.message_key() != next.message_key() {
        ChangeEvent::message(next)
    } else {
        ChangeEvent::updated(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pid: u32, activity: ActivityState) -> AgentRow {
        AgentRow::new(pid, activity)
    }

    #[test]
    fn test_summary_colors() {
        use ActivityState::*;
        assert_eq!(summarize(&[]).color, SummaryColor::Gray);
        assert_eq!(summarize(&[row(1, WaitingInput), row(2, WaitingInput)]).color, SummaryColor::Green);
        assert_eq!(summarize(&[row(1, Running)]).color, SummaryColor::Red);
        assert_eq!(summarize(&[row(1, Running), row(2, WaitingInput)]).color, SummaryColor::Yellow);
        assert_eq!(summarize(&[row(1, Running), row(2, Unknown)]).color, SummaryColor::Yellow);
        assert_eq!(summarize(&[row(1, Unknown)]).color, SummaryColor::Yellow);

        let summary = summarize(&[row(1, Running), row(2, WaitingInput), row(3, Unknown)]);
        assert_eq!((summary.running, summary.waiting_input, summary.unknown), (1, 1, 1));
    }

    #[test]
    fn test_row_ordering() {
        use ActivityState::*;
        let snapshot = StatusSnapshot::build(
            vec![row(30, Running), row(5, Unknown), row(20, WaitingInput), row(10, Running), row(40, WaitingInput)],
            SnapshotSource::Telemetry,
            0,
        );
        let pids: Vec<u32> = snapshot.agents.iter().map(|a| a.pid).collect();
        assert_eq!(pids, vec![20, 40, 10, 30, 5]);
    }

    #[test]
    fn test_fingerprint_ignores_invisible_fields() {
        let mut a = row(1, ActivityState::Running);
        let mut b = a.clone();
        b.cpu = 93.0;
        b.tty = "ttys004".to_string();
        assert_eq!(fingerprint(&[a.clone()]), fingerprint(&[b]));

        a.context_pressure = Some("near".to_string());
        assert_ne!(fingerprint(&[a]), fingerprint(&[row(1, ActivityState::Running)]));
    }

    #[test]
    fn test_fingerprint_independent_of_row_order() {
        let rows = vec![row(2, ActivityState::Running), row(1, ActivityState::WaitingInput)];
        let reversed: Vec<AgentRow> = rows.iter().rev().cloned().collect();
        assert_eq!(fingerprint(&rows), fingerprint(&reversed));
        assert_eq!(fingerprint(&rows).len(), 64);
    }

    #[test]
    fn test_message_id() {
        assert_eq!(message_id(1, None, None), None);
        assert_eq!(message_id(1, None, Some("")), None);
        let id = message_id(1, Some(5), Some("hi")).unwrap();
        assert_eq!(id.len(), 16);
        assert_ne!(Some(id), message_id(2, Some(5), Some("hi")));
    }

    #[test]
    fn test_diff_events() {
        use ActivityState::*;
        let mut kept_before = row(1, Running);
        kept_before.context_pressure = Some("normal".to_string());
        let prev = StatusSnapshot::build(vec![kept_before.clone(), row(2, Running)], SnapshotSource::Telemetry, 0);

        let mut kept_after = kept_before.clone();
        kept_after.activity = WaitingInput;
        kept_after.latest_message_id = Some("abc".to_string());
        kept_after.context_pressure = Some("close".to_string());
        let mut fresh = row(3, Running);
        fresh.latest_message_at = Some(10);
        let next = StatusSnapshot::build(vec![kept_after, fresh], SnapshotSource::Telemetry, 1);

        let names: Vec<(u32, &str)> = diff(&prev, &next).iter().map(|e| (e.pid(), e.name())).collect();
        assert_eq!(
            names,
            vec![
                (1, "activity_changed"),
                (1, "message_updated"),
                (1, "agent_updated"),
                (2, "agent_gone"),
                (3, "activity_changed"),
                (3, "message_updated"),
            ]
        );
        assert!(diff(&next, &next).is_empty());
    }

    #[test]
    fn test_classify_agent_change_priority() {
        let before = row(1, ActivityState::Running);
        let mut after = before.clone();
        after.latest_message_id = Some("x".to_string());
        after.context_pressure = Some("near".to_string());
        assert_eq!(classify_agent_change(&before, &after).name(), "message_updated");

        after.activity = ActivityState::WaitingInput;
        assert_eq!(classify_agent_change(&before, &after).name(), "activity_changed");
    }

    #[test]
    fn test_event_json_shape() {
        let event = ChangeEvent::AgentGone { pid: 7 };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            serde_json::json!({"event": "agent_gone", "pid": 7})
        );
        assert_eq!(
            serde_json::to_value(SnapshotSource::ProcessFallback).unwrap(),
            serde_json::json!("process-fallback")
        );
    }
}
