//! 状态聚合 - 进程扫描、telemetry 与会话日志合并为一份快照

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::activity;
use crate::bridge::BridgeClient;
use crate::config::DaemonConfig;
use crate::process::{AgentProcess, ProcessSource, ProcessTable};
use crate::session::{infer_activity, SessionLogLocator};
use crate::snapshot::{message_id, AgentRow, SnapshotSource, StatusSnapshot};
use crate::telemetry::{TelemetryReader, TelemetryRecord};
use crate::terminal_utils::{clean_message_text, html_to_text, message_gist, message_html, truncate_chars, MESSAGE_MAX_CHARS};
use crate::transcript::TranscriptReader;

/// 一次扫描的完整结果：快照加上生成它的不可变输入
#[derive(Debug, Clone)]
pub struct ScanView {
    pub snapshot: StatusSnapshot,
    pub table: Arc<ProcessTable>,
    pub telemetry: Arc<HashMap<u32, TelemetryRecord>>,
}

impl ScanView {
    pub fn empty(source: SnapshotSource, timestamp: i64) -> Self {
        Self {
            snapshot: StatusSnapshot::empty(source, timestamp),
            table: Arc::new(ProcessTable::default()),
            telemetry: Arc::new(HashMap::new()),
        }
    }
}

/// 消息文本三种形式
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageForms {
    pub gist: Option<String>,
    pub full: Option<String>,
    pub html: Option<String>,
    pub at_ms: Option<i64>,
}

impl MessageForms {
    /// 从原始文本构建；清理后为空则返回 None
    pub fn from_text(text: &str, html: Option<&str>, at_ms: Option<i64>) -> Option<Self> {
        let full = truncate_chars(&clean_message_text(text), MESSAGE_MAX_CHARS);
        if full.trim().is_empty() {
            return None;
        }
        Some(Self {
            gist: message_gist(&full),
            html: html
                .filter(|h| !h.trim().is_empty())
                .map(str::to_string)
                .or_else(|| message_html(&full)),
            full: Some(full),
            at_ms,
        })
    }
}

/// 状态聚合器
pub struct StateAggregator {
    source: Box<dyn ProcessSource>,
    telemetry: TelemetryReader,
    locator: SessionLogLocator,
    transcripts: TranscriptReader,
    bridge: BridgeClient,
    process_name: String,
    tail_bytes: u64,
}

impl StateAggregator {
    pub fn new(config: &DaemonConfig, source: Box<dyn ProcessSource>) -> Self {
        Self {
            source,
            telemetry: TelemetryReader::new(&config.telemetry_dir, config.telemetry_stale),
            locator: SessionLogLocator::new(&config.sessions_dir, config.session_refresh),
            transcripts: TranscriptReader::new(),
            bridge: BridgeClient::new(&config.bridge_dir),
            process_name: config.process_name.clone(),
            tail_bytes: config.transcript_tail_bytes,
        }
    }

    /// 扫描一次并构建快照；进程扫描失败时返回 offline 空快照
    pub fn scan(&mut self, now_ms: i64) -> ScanView {
        let timestamp = now_ms / 1000;
        let table = match self.source.scan() {
            Ok(table) => table,
            Err(e) => {
                warn!(error = %e, "Process scan failed");
                return ScanView::empty(SnapshotSource::Offline, timestamp);
            }
        };

        let telemetry = self.telemetry.read(&table, now_ms);

        // 进程名匹配的代理与带可信 telemetry 的 pid 取并集
        let mut agents: HashMap<u32, AgentProcess> = table
            .agent_processes(&self.process_name)
            .into_iter()
            .map(|a| (a.pid, a))
            .collect();
        for pid in telemetry.keys() {
            if !agents.contains_key(pid) {
                if let Some(agent) = table.agent_process(*pid) {
                    agents.insert(*pid, agent);
                }
            }
        }

        let pids: BTreeSet<u32> = agents.keys().copied().collect();
        let mut rows = Vec::with_capacity(pids.len());
        let mut any_telemetry = false;
        for pid in pids {
            let Some(agent) = agents.remove(&pid) else {
                continue;
            };
            let record = telemetry.get(&pid);
            any_telemetry |= record.is_some();
            rows.push(self.build_row(agent, record, now_ms));
        }

        let source = if any_telemetry {
            SnapshotSource::Telemetry
        } else {
            SnapshotSource::ProcessFallback
        };
        let snapshot = StatusSnapshot::build(rows, source, timestamp);
        debug!(
            agents = snapshot.agents.len(),
            source = ?snapshot.source,
            fingerprint = %snapshot.fingerprint,
            "Scan complete"
        );

        ScanView {
            snapshot,
            table: Arc::new(table),
            telemetry: Arc::new(telemetry),
        }
    }

    /// 会话日志路径：telemetry 给出的文件优先，否则按 cwd 定位
    pub fn transcript_path(&mut self, session_file: Option<&str>, cwd: Option<&str>) -> Option<PathBuf> {
        if let Some(file) = session_file.map(Path::new).filter(|p| p.is_file()) {
            return Some(file.to_path_buf());
        }
        cwd.and_then(|c| self.locator.locate(c))
    }

    /// 代理的最新消息：telemetry 文本、telemetry HTML、会话日志
    pub fn latest_message(
        &mut self,
        pid: u32,
        record: Option<&TelemetryRecord>,
        cwd: Option<&str>,
    ) -> (Option<PathBuf>, Option<MessageForms>) {
        if let Some(record) = record {
            let html = record.last_assistant_html.as_deref();
            let text = record
                .last_assistant_text
                .clone()
                .filter(|t| !t.trim().is_empty())
                .or_else(|| html.and_then(html_to_text));
            if let Some(forms) = text.and_then(|t| MessageForms::from_text(&t, html, record.last_assistant_at_ms)) {
                let session_file = record.session_file.as_ref().map(PathBuf::from);
                return (session_file, Some(forms));
            }
        }

        let path = self.transcript_path(record.and_then(|r| r.session_file.as_deref()), cwd);
        let forms = path
            .as_deref()
            .and_then(|p| self.transcripts.latest_message(p))
            .and_then(|m| MessageForms::from_text(&m.text, None, m.at_ms));
        if forms.is_none() {
            debug!(pid = pid, "No assistant message available");
        }
        (path, forms)
    }

    fn build_row(&mut self, agent: AgentProcess, record: Option<&TelemetryRecord>, now_ms: i64) -> AgentRow {
        let cwd = agent
            .cwd
            .clone()
            .or_else(|| record.and_then(|r| r.cwd.clone()));

        // 没有 telemetry 时才读会话日志推断活动状态
        let transcript_activity = if record.is_none() {
            cwd.as_deref()
                .and_then(|c| self.locator.locate(c))
                .and_then(|path| infer_activity(&path, self.tail_bytes))
        } else {
            None
        };
        let resolution = activity::resolve(record, transcript_activity);

        let mut row = AgentRow::new(agent.pid, resolution.activity);
        row.confidence = resolution.confidence;
        row.ppid = agent.ppid;
        row.state = agent.state;
        row.tty = agent.tty;
        row.cpu = agent.cpu;
        row.client_pid = agent.client_pid;
        row.attached_window = agent.attached_window;
        row.terminal_app = agent.terminal_app;
        row.mux = agent.mux.or_else(|| record.and_then(|r| r.routing_mux));
        row.mux_session = agent
            .mux_session
            .or_else(|| record.and_then(|r| r.routing_mux_session.clone()));

        if let Some(r) = record {
            row.telemetry_source = Some(r.source.clone());
            row.model_provider = r.model_provider.clone();
            row.model_id = r.model_id.clone();
            row.model_name = r.model_name.clone();
            row.session_id = r.session_id.clone();
            row.session_name = r.session_name.clone();
            row.session_file = r.session_file.clone();
            row.context_percent = r.context_percent;
            row.context_pressure = r.context_pressure.clone();
            row.context_close_to_limit = r.context_close_to_limit;
            row.context_near_limit = r.context_near_limit;
            row.context_tokens = r.context_tokens;
            row.context_window = r.context_window;
            row.context_remaining_tokens = r.context_remaining_tokens;
        }

        let (path, forms) = self.latest_message(agent.pid, record, cwd.as_deref());
        if row.session_file.is_none() {
            row.session_file = path.map(|p| p.to_string_lossy().to_string());
        }
        if let Some(forms) = forms {
            row.latest_message_id = message_id(agent.pid, forms.at_ms, forms.full.as_deref());
            row.latest_message = forms.gist;
            row.latest_message_full = forms.full;
            row.latest_message_html = forms.html;
            row.latest_message_at = forms.at_ms;
        }

        row.bridge_available = record.and_then(|r| r.bridge_active).unwrap_or(false)
            || self.bridge.is_registered(agent.pid, now_ms);
        row.cwd = cwd;
        row
    }
}
