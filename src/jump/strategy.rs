//! 跳转策略链

use super::{FocusBackend, Focused, JumpResult, JumpTarget, LaunchSpec, Resolution};
use crate::process::TerminalApp;

/// 单个策略的结果
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// 已完成，停止
    Resolved(Resolution),
    /// 条件不满足，继续
    NotApplicable,
    /// 尝试失败，继续
    Failed(String),
}

impl StepOutcome {
    fn focused(app: Option<TerminalApp>, pid: Option<u32>) -> Self {
        StepOutcome::Resolved(Resolution {
            result: JumpResult::FocusedExisting,
            focused: Focused { app, pid },
        })
    }
}

pub trait JumpStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn attempt(&self, target: &JumpTarget, backend: &dyn FocusBackend) -> StepOutcome;
}

/// 默认顺序
pub fn default_chain() -> Vec<Box<dyn JumpStrategy>> {
    vec![
        Box::new(AttachedClient),
        Box::new(AncestryApp),
        Box::new(SplitPaneHints),
        Box::new(TtyMatch),
        Box::new(TitleMatch),
        Box::new(ClientPresentGuard),
        Box::new(OpenTerminal),
    ]
}

fn focus_terminal(app: Option<(TerminalApp, u32)>, target: &JumpTarget, backend: &dyn FocusBackend) -> StepOutcome {
    let Some((app, app_pid)) = app else {
        return StepOutcome::Failed("no terminal app in ancestry".to_string());
    };
    if backend.focus_app(app, app_pid, &target.hints) {
        StepOutcome::focused(Some(app), Some(app_pid))
    } else {
        StepOutcome::Failed(format!("{} window not focused", app))
    }
}

/// 1. 通过复用器客户端定位终端
pub struct AttachedClient;

impl JumpStrategy for AttachedClient {
    fn name(&self) -> &'static str {
        "attached_client"
    }

    fn attempt(&self, target: &JumpTarget, backend: &dyn FocusBackend) -> StepOutcome {
        if target.client_pid.is_none() {
            return StepOutcome::NotApplicable;
        }
        focus_terminal(target.client_app, target, backend)
    }
}

/// 2. 代理进程祖先链上的终端应用
pub struct AncestryApp;

impl JumpStrategy for AncestryApp {
    fn name(&self) -> &'static str {
        "ancestry_app"
    }

    fn attempt(&self, target: &JumpTarget, backend: &dyn FocusBackend) -> StepOutcome {
        if target.ancestry_app.is_none() {
            return StepOutcome::NotApplicable;
        }
        focus_terminal(target.ancestry_app, target, backend)
    }
}

/// 3. 分屏场景按窗口标题提示词匹配
pub struct SplitPaneHints;

impl JumpStrategy for SplitPaneHints {
    fn name(&self) -> &'static str {
        "split_pane_hints"
    }

    fn attempt(&self, target: &JumpTarget, backend: &dyn FocusBackend) -> StepOutcome {
        if target.hints.is_empty() {
            return StepOutcome::NotApplicable;
        }
        match backend.focus_window_by_hints(&target.hints) {
            Some(focused) => StepOutcome::focused(focused.app, focused.pid),
            None => StepOutcome::Failed("no window title matched".to_string()),
        }
    }
}

/// 4. 按 tty 匹配标签页
pub struct TtyMatch;

impl JumpStrategy for TtyMatch {
    fn name(&self) -> &'static str {
        "tty_match"
    }

    fn attempt(&self, target: &JumpTarget, backend: &dyn FocusBackend) -> StepOutcome {
        if !target.has_tty() {
            return StepOutcome::NotApplicable;
        }
        match backend.focus_by_tty(&target.tty) {
            Some(focused) => StepOutcome::focused(focused.app, focused.pid),
            None => StepOutcome::Failed(format!("no tab on {}", target.tty)),
        }
    }
}

/// 5. 按会话名匹配标签页标题
pub struct TitleMatch;

impl JumpStrategy for TitleMatch {
    fn name(&self) -> &'static str {
        "title_match"
    }

    fn attempt(&self, target: &JumpTarget, backend: &dyn FocusBackend) -> StepOutcome {
        let Some(session) = target.mux_session.as_deref().filter(|s| !s.is_empty()) else {
            return StepOutcome::NotApplicable;
        };
        let needles = std::iter::once(session).chain(session.strip_prefix("agent-").filter(|s| !s.is_empty()));
        for needle in needles {
            if let Some(focused) = backend.focus_by_title(needle) {
                return StepOutcome::focused(focused.app, focused.pid);
            }
        }
        StepOutcome::Failed(format!("no tab titled {}", session))
    }
}

/// 6. 已有客户端但无法定位窗口：只把应用带到前台，不新开窗口
pub struct ClientPresentGuard;

impl JumpStrategy for ClientPresentGuard {
    fn name(&self) -> &'static str {
        "client_present"
    }

    fn attempt(&self, target: &JumpTarget, backend: &dyn FocusBackend) -> StepOutcome {
        if target.client_pid.is_none() {
            return StepOutcome::NotApplicable;
        }
        if let Some((app, app_pid)) = target.client_app {
            if backend.activate_existing(app) {
                return StepOutcome::focused(Some(app), Some(app_pid));
            }
        }
        StepOutcome::Resolved(Resolution {
            result: JumpResult::FoundClientNotFocused,
            focused: Focused {
                app: target.client_app.map(|(app, _)| app),
                pid: target.client_app.map(|(_, pid)| pid),
            },
        })
    }
}

/// 7. 打开新终端：复用器会话则执行 attach，否则在 cwd 打开 shell
pub struct OpenTerminal;

impl JumpStrategy for OpenTerminal {
    fn name(&self) -> &'static str {
        "open_terminal"
    }

    fn attempt(&self, target: &JumpTarget, backend: &dyn FocusBackend) -> StepOutcome {
        let attach = match (target.mux, target.mux_session.as_deref()) {
            (Some(mux), Some(session)) if !session.is_empty() => Some(mux.attach_command(session)),
            _ => None,
        };
        if attach.is_none() && target.cwd.is_none() {
            return StepOutcome::NotApplicable;
        }

        let result = if attach.is_some() {
            JumpResult::OpenedAttach
        } else {
            JumpResult::OpenedShell
        };
        let launch = LaunchSpec::new(attach, target.cwd.clone());
        match backend.open_terminal(&launch) {
            Ok(app) => StepOutcome::Resolved(Resolution {
                result,
                focused: Focused::app(app),
            }),
            Err(e) => StepOutcome::Failed(format!("could not open terminal: {}", e)),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::jump::{JumpResolver, StepStatus};
    use crate::mux::Mux;
    use std::sync::{Arc, Mutex};

    /// 记录调用并按预设返回结果的后端
    #[derive(Default)]
    pub(crate) struct RecordingBackend {
        pub calls: Mutex<Vec<String>>,
        pub focus_app_ok: bool,
        pub hints_ok: bool,
        pub tty_ok: bool,
        pub title_ok: bool,
        pub activate_ok: bool,
        pub open_ok: bool,
    }

    impl RecordingBackend {
        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl FocusBackend for RecordingBackend {
        fn focus_app(&self, app: TerminalApp, app_pid: u32, _hints: &[String]) -> bool {
            self.record(format!("focus_app {} {}", app, app_pid));
            self.focus_app_ok
        }

        fn focus_window_by_hints(&self, hints: &[String]) -> Option<Focused> {
            self.record(format!("hints {}", hints.join(",")));
            self.hints_ok.then(|| Focused::app(TerminalApp::Ghostty))
        }

        fn focus_by_tty(&self, tty: &str) -> Option<Focused> {
            self.record(format!("tty {}", tty));
            self.tty_ok.then(|| Focused::app(TerminalApp::ITerm2))
        }

        fn focus_by_title(&self, needle: &str) -> Option<Focused> {
            self.record(format!("title {}", needle));
            self.title_ok.then(|| Focused::app(TerminalApp::Terminal))
        }

        fn activate_existing(&self, app: TerminalApp) -> bool {
            self.record(format!("activate {}", app));
            self.activate_ok
        }

        fn open_terminal(&self, launch: &LaunchSpec) -> anyhow::Result<TerminalApp> {
            self.record(format!("open {}", launch.command.as_deref().unwrap_or("shell")));
            if self.open_ok {
                Ok(TerminalApp::Terminal)
            } else {
                Err(anyhow::anyhow!("no terminal"))
            }
        }
    }

    fn target() -> JumpTarget {
        JumpTarget {
            pid: 22,
            tty: "ttys009".to_string(),
            cwd: Some("/work/web".to_string()),
            mux: Some(Mux::Zellij),
            mux_session: Some("agent-web".to_string()),
            client_pid: None,
            client_app: None,
            ancestry_app: None,
            hints: vec!["agent-web".to_string(), "web".to_string()],
        }
    }

    #[test]
    fn test_attached_client_stops_chain() {
        let backend = Arc::new(RecordingBackend {
            focus_app_ok: true,
            ..Default::default()
        });
        let mut t = target();
        t.client_pid = Some(12);
        t.client_app = Some((TerminalApp::Ghostty, 10));

        let reply = JumpResolver::new(backend.clone()).resolve(&t);
        assert_eq!(reply.result, JumpResult::FocusedExisting);
        assert!(reply.focused);
        assert_eq!(reply.focused_app, Some(TerminalApp::Ghostty));
        assert_eq!(reply.focused_app_pid, Some(10));
        assert_eq!(reply.steps.len(), 1);
        assert_eq!(backend.calls(), vec!["focus_app Ghostty 10"]);
    }

    #[test]
    fn test_client_present_never_opens_new_terminal() {
        let backend = Arc::new(RecordingBackend {
            open_ok: true,
            ..Default::default()
        });
        let mut t = target();
        t.client_pid = Some(12);
        t.client_app = Some((TerminalApp::Ghostty, 10));

        let reply = JumpResolver::new(backend.clone()).resolve(&t);
        assert_eq!(reply.result, JumpResult::FoundClientNotFocused);
        assert!(!reply.focused);
        assert!(!reply.opened_attach);
        assert!(backend.calls().iter().all(|c| !c.starts_with("open")));
        assert_eq!(reply.steps.last().unwrap().step, "client_present");
    }

    #[test]
    fn test_no_client_opens_attach() {
        let backend = Arc::new(RecordingBackend {
            open_ok: true,
            ..Default::default()
        });
        let reply = JumpResolver::new(backend.clone()).resolve(&target());

        assert_eq!(reply.result, JumpResult::OpenedAttach);
        assert!(reply.opened_attach);
        assert_eq!(
            backend.calls(),
            vec![
                "hints agent-web,web",
                "tty ttys009",
                "title agent-web",
                "title web",
                "open zellij attach agent-web",
            ]
        );
        let statuses: Vec<StepStatus> = reply.steps.iter().map(|s| s.status).collect();
        assert_eq!(
            statuses,
            vec![
                StepStatus::NotApplicable,
                StepStatus::NotApplicable,
                StepStatus::Failed,
                StepStatus::Failed,
                StepStatus::Failed,
                StepStatus::NotApplicable,
                StepStatus::Resolved,
            ]
        );
    }

    #[test]
    fn test_plain_shell_and_no_match() {
        let backend = Arc::new(RecordingBackend::default());
        let mut t = target();
        t.mux = None;
        t.mux_session = None;
        t.hints.clear();
        t.tty = "??".to_string();

        let reply = JumpResolver::new(backend.clone()).resolve(&t);
        assert_eq!(reply.result, JumpResult::NoMatch);
        assert!(reply.ok);
        assert_eq!(backend.calls(), vec!["open shell"]);

        let backend = Arc::new(RecordingBackend {
            open_ok: true,
            ..Default::default()
        });
        let reply = JumpResolver::new(backend).resolve(&t);
        assert_eq!(reply.result, JumpResult::OpenedShell);
    }

    #[test]
    fn test_tty_match_after_failed_ancestry() {
        let backend = Arc::new(RecordingBackend {
            tty_ok: true,
            ..Default::default()
        });
        let mut t = target();
        t.ancestry_app = Some((TerminalApp::ITerm2, 50));

        let reply = JumpResolver::new(backend.clone()).resolve(&t);
        assert_eq!(reply.result, JumpResult::FocusedExisting);
        assert_eq!(reply.focused_app, Some(TerminalApp::ITerm2));
        assert_eq!(
            backend.calls(),
            vec!["focus_app iTerm2 50", "hints agent-web,web", "tty ttys009"]
        );
    }
}
