//! 跳转模块 - 把代理所在的终端窗口带到前台，找不到时打开新终端
//!
//! 解析过程是一条有序的策略链，每个策略返回成功、不适用或失败；失败只会
//! 推进到下一个策略。窗口操作通过 [`FocusBackend`] 完成，macOS 使用
//! AppleScript，Linux 使用 wmctrl。任何一步都不会调用文件管理器。

pub mod linux;
pub mod macos;
pub mod strategy;

use anyhow::Result;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::TerminalPreference;
use crate::mux::{shell_quote, Mux};
use crate::process::{ProcessTable, TerminalApp, NO_TTY};

pub use strategy::{default_chain, JumpStrategy, StepOutcome};

/// 一次成功聚焦的窗口信息
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Focused {
    pub app: Option<TerminalApp>,
    pub pid: Option<u32>,
}

impl Focused {
    pub fn app(app: TerminalApp) -> Self {
        Self {
            app: Some(app),
            pid: None,
        }
    }
}

/// 窗口聚焦与终端启动能力
pub trait FocusBackend: Send + Sync {
    /// 聚焦指定终端应用进程的窗口（Ghostty 必须命中提示词才算成功）
    fn focus_app(&self, app: TerminalApp, app_pid: u32, hints: &[String]) -> bool;

    /// 在所有终端窗口标题中查找提示词（分屏场景下进程链不可靠）
    fn focus_window_by_hints(&self, hints: &[String]) -> Option<Focused>;

    /// 按 tty 查找标签页
    fn focus_by_tty(&self, tty: &str) -> Option<Focused>;

    /// 按标题查找标签页
    fn focus_by_title(&self, needle: &str) -> Option<Focused>;

    /// 仅把已运行的应用带到前台，不新开窗口
    fn activate_existing(&self, app: TerminalApp) -> bool;

    /// 打开新终端窗口执行启动命令
    fn open_terminal(&self, launch: &LaunchSpec) -> Result<TerminalApp>;

    /// 向 tty 对应的终端会话写入一行文本
    fn write_to_session(&self, _tty: &str, _text: &str, _app: Option<TerminalApp>) -> bool {
        false
    }
}

/// 新终端的启动参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub shell: String,
    /// 登录 shell 中执行的命令；None 表示只打开 shell
    pub command: Option<String>,
    pub cwd: Option<String>,
}

impl LaunchSpec {
    pub fn new(command: Option<String>, cwd: Option<String>) -> Self {
        Self {
            shell: default_shell(),
            command,
            cwd,
        }
    }

    /// 完整的 shell 命令行：`cd <cwd>; exec <shell> -lc <command>`
    pub fn shell_line(&self) -> String {
        let mut parts = Vec::new();
        if let Some(cwd) = &self.cwd {
            parts.push(format!("cd {}", shell_quote(cwd)));
        }
        match &self.command {
            Some(cmd) => parts.push(format!("exec {} -lc {}", shell_quote(&self.shell), shell_quote(cmd))),
            None => parts.push(format!("exec {} -l", shell_quote(&self.shell))),
        }
        parts.join("; ")
    }
}

/// 用户配置的 shell
pub fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| {
            if cfg!(target_os = "macos") {
                "/bin/zsh".to_string()
            } else {
                "/bin/sh".to_string()
            }
        })
}

/// 当前平台的聚焦后端
pub fn platform_backend(preference: TerminalPreference) -> Arc<dyn FocusBackend> {
    if cfg!(target_os = "macos") {
        Arc::new(macos::AppleScriptBackend::new(preference))
    } else {
        Arc::new(linux::WmctrlBackend::new(preference))
    }
}

/// 构造聚焦提示词：会话名、去掉 `agent-` 前缀的会话名、cwd 目录名、tty、客户端 tty
pub fn focus_hints(
    mux_session: Option<&str>,
    cwd: Option<&str>,
    tty: Option<&str>,
    client_tty: Option<&str>,
) -> Vec<String> {
    let mut hints: Vec<String> = Vec::new();
    if let Some(session) = mux_session.filter(|s| !s.is_empty()) {
        hints.push(session.to_string());
        if let Some(stripped) = session.strip_prefix("agent-").filter(|s| !s.is_empty()) {
            hints.push(stripped.to_string());
        }
    }
    if let Some(name) = cwd.and_then(|c| Path::new(c).file_name()) {
        hints.push(name.to_string_lossy().to_string());
    }
    for t in [tty, client_tty].into_iter().flatten() {
        if !t.is_empty() && t != NO_TTY {
            hints.push(t.to_string());
        }
    }

    let mut seen = std::collections::HashSet::new();
    hints.retain(|h| seen.insert(h.to_lowercase()));
    hints
}

/// 跳转目标：从一份不可变进程表解析出的全部信息
#[derive(Debug, Clone, PartialEq)]
pub struct JumpTarget {
    pub pid: u32,
    pub tty: String,
    pub cwd: Option<String>,
    pub mux: Option<Mux>,
    pub mux_session: Option<String>,
    pub client_pid: Option<u32>,
    /// 客户端进程所属终端应用
    pub client_app: Option<(TerminalApp, u32)>,
    /// 代理进程祖先链上的终端应用
    pub ancestry_app: Option<(TerminalApp, u32)>,
    pub hints: Vec<String>,
}

impl JumpTarget {
    pub fn from_table(table: &ProcessTable, pid: u32) -> Option<Self> {
        let agent = table.agent_process(pid)?;
        let client_tty = agent
            .client_pid
            .and_then(|c| table.get(c))
            .map(|row| row.tty.clone());
        let hints = focus_hints(
            agent.mux_session.as_deref(),
            agent.cwd.as_deref(),
            Some(agent.tty.as_str()),
            client_tty.as_deref(),
        );

        Some(Self {
            pid,
            tty: agent.tty.clone(),
            cwd: agent.cwd.clone(),
            mux: agent.mux,
            mux_session: agent.mux_session.clone(),
            client_pid: agent.client_pid,
            client_app: agent.client_pid.and_then(|c| table.detect_terminal(c)),
            ancestry_app: table.detect_terminal(pid),
            hints,
        })
    }

    pub fn has_tty(&self) -> bool {
        !self.tty.is_empty() && self.tty != NO_TTY
    }
}

/// 跳转最终结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JumpResult {
    FocusedExisting,
    OpenedAttach,
    OpenedShell,
    FoundClientNotFocused,
    NoMatch,
}

/// 单步状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Resolved,
    NotApplicable,
    Failed,
}

/// 单步记录
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JumpStep {
    pub step: &'static str,
    pub status: StepStatus,
    pub detail: Option<String>,
}

/// 策略成功时给出的结论
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub result: JumpResult,
    pub focused: Focused,
}

/// `jump` 的响应
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JumpReply {
    pub ok: bool,
    pub pid: u32,
    pub tty: String,
    pub cwd: Option<String>,
    pub mux: Option<Mux>,
    pub mux_session: Option<String>,
    pub client_pid: Option<u32>,
    pub result: JumpResult,
    pub focused: bool,
    pub focused_app: Option<TerminalApp>,
    pub focused_app_pid: Option<u32>,
    pub opened_attach: bool,
    pub opened_shell: bool,
    pub steps: Vec<JumpStep>,
}

/// 按顺序执行策略链
pub struct JumpResolver {
    strategies: Vec<Box<dyn JumpStrategy>>,
    backend: Arc<dyn FocusBackend>,
}

impl JumpResolver {
    pub fn new(backend: Arc<dyn FocusBackend>) -> Self {
        Self::with_strategies(backend, default_chain())
    }

    pub fn with_strategies(backend: Arc<dyn FocusBackend>, strategies: Vec<Box<dyn JumpStrategy>>) -> Self {
        Self { strategies, backend }
    }

    /// 执行跳转（阻塞，可能调用外部命令）
    pub fn resolve(&self, target: &JumpTarget) -> JumpReply {
        let mut steps = Vec::with_capacity(self.strategies.len());
        let mut resolution = Resolution {
            result: JumpResult::NoMatch,
            focused: Focused::default(),
        };

        for strategy in &self.strategies {
            let outcome = strategy.attempt(target, self.backend.as_ref());
            debug!(pid = target.pid, step = strategy.name(), outcome = ?outcome, "Jump step");
            match outcome {
                StepOutcome::Resolved(r) => {
                    steps.push(JumpStep {
                        step: strategy.name(),
                        status: StepStatus::Resolved,
                        detail: None,
                    });
                    resolution = r;
                    break;
                }
                StepOutcome::NotApplicable => steps.push(JumpStep {
                    step: strategy.name(),
                    status: StepStatus::NotApplicable,
                    detail: None,
                }),
                StepOutcome::Failed(reason) => steps.push(JumpStep {
                    step: strategy.name(),
                    status: StepStatus::Failed,
                    detail: Some(reason),
                }),
            }
        }

        info!(pid = target.pid, result = ?resolution.result, "Jump resolved");
        JumpReply {
            ok: true,
            pid: target.pid,
            tty: target.tty.clone(),
            cwd: target.cwd.clone(),
            mux: target.mux,
            mux_session: target.mux_session.clone(),
            client_pid: target.client_pid,
            result: resolution.result,
            focused: resolution.result == JumpResult::FocusedExisting,
            focused_app: resolution.focused.app,
            focused_app_pid: resolution.focused.pid,
            opened_attach: resolution.result == JumpResult::OpenedAttach,
            opened_shell: resolution.result == JumpResult::OpenedShell,
            steps,
        }
    }
}
