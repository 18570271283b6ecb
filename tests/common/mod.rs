//! 集成测试共用的进程来源、聚焦后端与临时目录
#![allow(dead_code)]

use anyhow::Result;
use pi_statusd::jump::{Focused, LaunchSpec};
use pi_statusd::session::encode_cwd;
use pi_statusd::{DaemonConfig, FocusBackend, Monitor, ProcessRow, ProcessSource, ProcessTable, TerminalApp};
use serde_json::{json, Value};
use std::fs;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// 可在测试中替换的进程表
#[derive(Clone, Default)]
pub struct SharedSource(pub Arc<Mutex<ProcessTable>>);

impl SharedSource {
    pub fn replace(&self, rows: Vec<ProcessRow>) {
        *self.0.lock().unwrap() = ProcessTable::new(rows);
    }
}

impl ProcessSource for SharedSource {
    fn scan(&mut self) -> Result<ProcessTable> {
        Ok(self.0.lock().unwrap().clone())
    }
}

pub fn row(pid: u32, ppid: u32, name: &str, args: &str, tty: &str) -> ProcessRow {
    ProcessRow {
        pid,
        ppid,
        name: name.to_string(),
        args: args.to_string(),
        state: "Sleep".to_string(),
        tty: tty.to_string(),
        cpu: 0.0,
        cwd: Some(format!("/work/p{}", pid)),
    }
}

pub fn with_cwd(mut row: ProcessRow, cwd: &str) -> ProcessRow {
    row.cwd = Some(cwd.to_string());
    row
}

/// 记录调用的聚焦后端；`focus_app` 与写入会话总是成功
#[derive(Default)]
pub struct ScriptedBackend {
    calls: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl FocusBackend for ScriptedBackend {
    fn focus_app(&self, app: TerminalApp, app_pid: u32, _hints: &[String]) -> bool {
        self.record(format!("focus_app {} {}", app, app_pid));
        true
    }

    fn focus_window_by_hints(&self, hints: &[String]) -> Option<Focused> {
        self.record(format!("hints {}", hints.join(",")));
        None
    }

    fn focus_by_tty(&self, tty: &str) -> Option<Focused> {
        self.record(format!("tty {}", tty));
        None
    }

    fn focus_by_title(&self, needle: &str) -> Option<Focused> {
        self.record(format!("title {}", needle));
        None
    }

    fn activate_existing(&self, app: TerminalApp) -> bool {
        self.record(format!("activate {}", app));
        false
    }

    fn open_terminal(&self, launch: &LaunchSpec) -> Result<TerminalApp> {
        self.record(format!("open {}", launch.command.as_deref().unwrap_or("shell")));
        Ok(TerminalApp::Terminal)
    }

    fn write_to_session(&self, tty: &str, text: &str, _app: Option<TerminalApp>) -> bool {
        self.record(format!("write {} {}", tty, text));
        true
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub config: DaemonConfig,
    pub source: SharedSource,
    pub backend: Arc<ScriptedBackend>,
    pub monitor: Arc<Monitor>,
}

pub fn harness(rows: Vec<ProcessRow>) -> Harness {
    let dir = TempDir::new().unwrap();
    let mut config = DaemonConfig::with_home(dir.path().to_path_buf());
    config.sessions_dir = dir.path().join("sessions");
    let source = SharedSource(Arc::new(Mutex::new(ProcessTable::new(rows))));
    let backend = Arc::new(ScriptedBackend::default());
    let monitor = Arc::new(Monitor::new(&config, Box::new(source.clone()), backend.clone()));
    Harness {
        dir,
        config,
        source,
        backend,
        monitor,
    }
}

/// 写入一条当前时间的 telemetry 记录
pub fn write_telemetry(config: &DaemonConfig, pid: u32, activity: &str) {
    let now = pi_statusd::monitor::now_ms();
    fs::create_dir_all(&config.telemetry_dir).unwrap();
    let value = json!({
        "source": "pi-telemetry",
        "process": {"pid": pid, "ppid": 1, "updatedAt": now},
        "state": {"activity": activity},
    });
    fs::write(config.telemetry_dir.join(format!("{}.json", pid)), value.to_string()).unwrap();
}

pub fn write_transcript(config: &DaemonConfig, cwd: &str, lines: &[Value]) {
    let dir = config.sessions_dir.join(encode_cwd(cwd));
    fs::create_dir_all(&dir).unwrap();
    let body: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
    fs::write(dir.join("session.jsonl"), body.join("\n")).unwrap();
}
