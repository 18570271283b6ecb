//! 进程扫描模块 - 枚举当前用户的代理进程，解析 cwd、tty、复用器与终端归属
//!
//! 每次扫描产生一个新的不可变 [`ProcessTable`]，代理行、复用器推断、客户端查找
//! 都是表上的纯函数，便于用构造的进程表做测试。

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tracing::debug;

use crate::mux::{self, Mux};

/// 没有控制终端时的 tty 占位
pub const NO_TTY: &str = "??";

/// 祖先链最大跳数
const MAX_ANCESTRY_HOPS: usize = 20;

/// 已知的终端应用
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TerminalApp {
    #[serde(rename = "Ghostty")]
    Ghostty,
    #[serde(rename = "iTerm2")]
    ITerm2,
    #[serde(rename = "Terminal")]
    Terminal,
    #[serde(rename = "kitty")]
    Kitty,
    #[serde(rename = "Alacritty")]
    Alacritty,
    #[serde(rename = "WezTerm")]
    WezTerm,
    #[serde(rename = "gnome-terminal")]
    GnomeTerminal,
    #[serde(rename = "Konsole")]
    Konsole,
    #[serde(rename = "xterm")]
    Xterm,
}

impl std::fmt::Display for TerminalApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TerminalApp::Ghostty => "Ghostty",
            TerminalApp::ITerm2 => "iTerm2",
            TerminalApp::Terminal => "Terminal",
            TerminalApp::Kitty => "kitty",
            TerminalApp::Alacritty => "Alacritty",
            TerminalApp::WezTerm => "WezTerm",
            TerminalApp::GnomeTerminal => "gnome-terminal",
            TerminalApp::Konsole => "Konsole",
            TerminalApp::Xterm => "xterm",
        };
        write!(f, "{}", name)
    }
}

impl TerminalApp {
    /// 解析配置文件中的终端名（已小写）
    pub fn from_config_name(name: &str) -> Option<Self> {
        match name {
            "ghostty" | "ghostty.app" => Some(TerminalApp::Ghostty),
            "iterm2" | "iterm" | "iterm.app" => Some(TerminalApp::ITerm2),
            "terminal" | "terminal.app" | "apple_terminal" => Some(TerminalApp::Terminal),
            "kitty" => Some(TerminalApp::Kitty),
            "alacritty" => Some(TerminalApp::Alacritty),
            "wezterm" => Some(TerminalApp::WezTerm),
            "gnome-terminal" => Some(TerminalApp::GnomeTerminal),
            "konsole" => Some(TerminalApp::Konsole),
            "xterm" => Some(TerminalApp::Xterm),
            _ => None,
        }
    }

    /// 根据进程名和命令行识别终端应用
    pub fn detect(name: &str, args: &str) -> Option<Self> {
        let name = name.to_lowercase();
        let args = args.to_lowercase();

        if name.contains("ghostty") || args.contains("ghostty") {
            Some(TerminalApp::Ghostty)
        } else if name.contains("iterm") || args.contains("iterm") {
            Some(TerminalApp::ITerm2)
        } else if name.contains("gnome-terminal") {
            Some(TerminalApp::GnomeTerminal)
        } else if name == "terminal" || args.contains("terminal.app/contents/macos/terminal") {
            Some(TerminalApp::Terminal)
        } else if name == "kitty" {
            Some(TerminalApp::Kitty)
        } else if name == "alacritty" {
            Some(TerminalApp::Alacritty)
        } else if name.starts_with("wezterm") {
            Some(TerminalApp::WezTerm)
        } else if name == "konsole" {
            Some(TerminalApp::Konsole)
        } else if name == "xterm" {
            Some(TerminalApp::Xterm)
        } else {
            None
        }
    }

    /// macOS 应用包名
    pub fn bundle_name(&self) -> String {
        match self {
            TerminalApp::ITerm2 => "iTerm.app".to_string(),
            other => format!("{}.app", other),
        }
    }

    /// Linux 可执行文件名
    pub fn binary_name(&self) -> &'static str {
        match self {
            TerminalApp::Ghostty => "ghostty",
            TerminalApp::ITerm2 => "iterm2",
            TerminalApp::Terminal => "x-terminal-emulator",
            TerminalApp::Kitty => "kitty",
            TerminalApp::Alacritty => "alacritty",
            TerminalApp::WezTerm => "wezterm",
            TerminalApp::GnomeTerminal => "gnome-terminal",
            TerminalApp::Konsole => "konsole",
            TerminalApp::Xterm => "xterm",
        }
    }
}

/// 进程表中的一行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRow {
    pub pid: u32,
    pub ppid: u32,
    /// 可执行文件名
    pub name: String,
    /// 完整命令行
    pub args: String,
    pub state: String,
    pub tty: String,
    pub cpu: f32,
    pub cwd: Option<String>,
}

impl ProcessRow {
    pub fn has_tty(&self) -> bool {
        !self.tty.is_empty() && self.tty != NO_TTY
    }
}

/// 一次扫描得到的代理进程
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProcess {
    pub pid: u32,
    pub ppid: u32,
    pub state: String,
    pub tty: String,
    pub cpu: f32,
    pub cwd: Option<String>,
    pub mux: Option<Mux>,
    pub mux_session: Option<String>,
    /// 复用器客户端进程
    pub client_pid: Option<u32>,
    pub terminal_app: Option<TerminalApp>,
    /// 终端应用所在进程
    pub terminal_pid: Option<u32>,
    pub attached_window: bool,
}

/// 不可变进程表
#[derive(Debug, Clone, Default)]
pub struct ProcessTable {
    rows: Vec<ProcessRow>,
    by_pid: HashMap<u32, usize>,
}

impl ProcessTable {
    pub fn new(rows: Vec<ProcessRow>) -> Self {
        let by_pid = rows
            .iter()
            .enumerate()
            .map(|(idx, row)| (row.pid, idx))
            .collect();
        Self { rows, by_pid }
    }

    pub fn get(&self, pid: u32) -> Option<&ProcessRow> {
        self.by_pid.get(&pid).map(|idx| &self.rows[*idx])
    }

    /// 进程是否仍然存在
    pub fn contains(&self, pid: u32) -> bool {
        self.by_pid.contains_key(&pid)
    }

    /// 列出所有代理进程（嵌套启动的代理各占一行），按 pid 升序
    pub fn agent_processes(&self, process_name: &str) -> Vec<AgentProcess> {
        let mut agents: Vec<AgentProcess> = self
            .rows
            .iter()
            .filter(|row| is_agent_row(row, process_name))
            .filter_map(|row| self.agent_process(row.pid))
            .collect();

        agents.sort_by_key(|a| a.pid);
        agents
    }

    /// 将表中任意 pid 解析为代理进程（telemetry 记录的 pid 可能不叫 `pi`）
    pub fn agent_process(&self, pid: u32) -> Option<AgentProcess> {
        let row = self.get(pid)?;
        let (mux, mux_session) = self.infer_mux(row);
        let client_pid = mux.and_then(|m| self.find_mux_client_pid(m, mux_session.as_deref(), &row.tty));
        let (terminal_app, terminal_pid) = match self.detect_terminal(client_pid.unwrap_or(pid)) {
            Some((app, app_pid)) => (Some(app), Some(app_pid)),
            None => (None, None),
        };
        let attached_window = client_pid.is_some() || (terminal_app.is_some() && row.has_tty());

        Some(AgentProcess {
            pid,
            ppid: row.ppid,
            state: row.state.clone(),
            tty: row.tty.clone(),
            cpu: row.cpu,
            cwd: row.cwd.clone(),
            mux,
            mux_session,
            client_pid,
            terminal_app,
            terminal_pid,
            attached_window,
        })
    }

    /// 沿祖先链推断复用器与会话名
    pub fn infer_mux(&self, row: &ProcessRow) -> (Option<Mux>, Option<String>) {
        for ancestor in self.ancestors(row.ppid) {
            let lower = ancestor.args.to_lowercase();
            if lower.contains("zellij") {
                return (Some(Mux::Zellij), mux::zellij_session_from_args(&ancestor.args));
            }
            if lower.contains("tmux") {
                return (Some(Mux::Tmux), mux::tmux_session_from_args(&ancestor.args));
            }
            if lower.contains("screen") {
                return (Some(Mux::Screen), mux::screen_session_from_args(&ancestor.args));
            }
        }
        (None, None)
    }

    /// 查找复用器客户端进程：优先命令行带会话名的客户端，其次同 tty 的客户端
    pub fn find_mux_client_pid(&self, mux: Mux, session: Option<&str>, tty: &str) -> Option<u32> {
        let is_client = |row: &ProcessRow| -> bool {
            let args = &row.args;
            match mux {
                Mux::Zellij => args.contains("zellij") && !args.contains("--server"),
                Mux::Tmux => args.contains("tmux"),
                Mux::Screen => args.contains("screen"),
            }
        };

        if let Some(session) = session.filter(|s| !s.is_empty()) {
            if let Some(row) = self
                .rows
                .iter()
                .find(|row| is_client(row) && row.args.contains(session))
            {
                return Some(row.pid);
            }
        }

        if !tty.is_empty() && tty != NO_TTY {
            if let Some(row) = self.rows.iter().find(|row| row.tty == tty && is_client(row)) {
                return Some(row.pid);
            }
        }

        None
    }

    /// 从 pid 开始沿祖先链寻找终端应用
    pub fn detect_terminal(&self, pid: u32) -> Option<(TerminalApp, u32)> {
        let start = self.get(pid)?;
        std::iter::once(start)
            .chain(self.ancestors(start.ppid))
            .find_map(|row| TerminalApp::detect(&row.name, &row.args).map(|app| (app, row.pid)))
    }

    /// 从 `start` 开始的祖先进程（含 start 自身），有环保护和跳数上限
    pub fn ancestors(&self, start: u32) -> Vec<&ProcessRow> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut current = start;

        while current != 0 && out.len() < MAX_ANCESTRY_HOPS && seen.insert(current) {
            let Some(row) = self.get(current) else {
                break;
            };
            out.push(row);
            current = row.ppid;
        }
        out
    }
}

/// 判断是否为代理进程：进程名匹配，或 argv[0]（node/bun 启动时为 argv[1]）的 basename 匹配
fn is_agent_row(row: &ProcessRow, process_name: &str) -> bool {
    if row.name.eq_ignore_ascii_case(process_name) {
        return true;
    }

    let mut parts = row.args.split_whitespace();
    let Some(first) = parts.next() else {
        return false;
    };
    let first_base = basename(first);
    if first_base.eq_ignore_ascii_case(process_name) {
        return true;
    }
    if matches!(first_base, "node" | "bun" | "deno") {
        if let Some(script) = parts.next() {
            return basename(script).eq_ignore_ascii_case(process_name);
        }
    }
    false
}

fn basename(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path)
}

/// 进程表来源（系统扫描或测试注入）
pub trait ProcessSource: Send {
    fn scan(&mut self) -> Result<ProcessTable>;
}

/// 基于 sysinfo 的进程扫描器
pub struct ProcessScanner {
    system: System,
}

impl ProcessScanner {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    fn refresh_kind() -> ProcessRefreshKind {
        ProcessRefreshKind::new()
            .with_cmd(UpdateKind::Always)
            .with_cwd(UpdateKind::Always)
            .with_user(UpdateKind::OnlyIfNotSet)
            .with_cpu()
    }
}

impl Default for ProcessScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSource for ProcessScanner {
    fn scan(&mut self) -> Result<ProcessTable> {
        self.system
            .refresh_processes_specifics(ProcessesToUpdate::All, Self::refresh_kind());

        let own_uid = sysinfo::get_current_pid()
            .ok()
            .and_then(|pid| self.system.process(pid))
            .and_then(|p| p.user_id().cloned());
        let tty_map = tty_map_from_ps();

        let mut rows = Vec::with_capacity(self.system.processes().len());
        for (pid, process) in self.system.processes() {
            // 只保留当前用户的进程
            if let (Some(own), Some(uid)) = (own_uid.as_ref(), process.user_id()) {
                if own != uid {
                    continue;
                }
            }

            let args: Vec<String> = process
                .cmd()
                .iter()
                .map(|s| s.to_string_lossy().to_string())
                .collect();
            let pid_u32 = pid.as_u32();
            let tty = tty_for_pid(pid_u32, tty_map.as_ref());

            rows.push(ProcessRow {
                pid: pid_u32,
                ppid: process.parent().map(Pid::as_u32).unwrap_or(0),
                name: process.name().to_string_lossy().to_string(),
                args: args.join(" "),
                state: format!("{:?}", process.status()),
                tty,
                cpu: process.cpu_usage(),
                cwd: process.cwd().map(|p| p.to_string_lossy().to_string()),
            });
        }

        debug!(processes = rows.len(), "Process scan complete");
        Ok(ProcessTable::new(rows))
    }
}

/// Linux 直接读 /proc 下的 fd/0 链接
#[cfg(target_os = "linux")]
fn tty_for_pid(pid: u32, _map: Option<&HashMap<u32, String>>) -> String {
    std::fs::read_link(format!("/proc/{}/fd/0", pid))
        .ok()
        .and_then(|target| {
            let target = target.to_string_lossy().to_string();
            target
                .strip_prefix("/dev/")
                .filter(|t| t.starts_with("pts/") || t.starts_with("tty"))
                .map(|t| t.to_string())
        })
        .unwrap_or_else(|| NO_TTY.to_string())
}

#[cfg(not(target_os = "linux"))]
fn tty_for_pid(pid: u32, map: Option<&HashMap<u32, String>>) -> String {
    map.and_then(|m| m.get(&pid).cloned())
        .unwrap_or_else(|| NO_TTY.to_string())
}

#[cfg(target_os = "linux")]
fn tty_map_from_ps() -> Option<HashMap<u32, String>> {
    None
}

/// 非 Linux 平台每次扫描只调用一次 ps
#[cfg(not(target_os = "linux"))]
fn tty_map_from_ps() -> Option<HashMap<u32, String>> {
    let output = std::process::Command::new("ps")
        .args(["-axo", "pid=,tty="])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(parse_ps_tty_output(&String::from_utf8_lossy(&output.stdout)))
}

/// 解析 `ps -axo pid=,tty=` 输出
pub fn parse_ps_tty_output(stdout: &str) -> HashMap<u32, String> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let pid = parts.next()?.parse::<u32>().ok()?;
            let tty = parts.next().unwrap_or(NO_TTY).to_string();
            Some((pid, tty))
        })
        .collect()
}
