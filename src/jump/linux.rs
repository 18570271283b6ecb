//! Linux 聚焦后端 - wmctrl 管理窗口，which 查找终端程序

use anyhow::{anyhow, Context, Result};
use std::process::{Command, Stdio};
use tracing::{debug, info};

use super::{FocusBackend, Focused, LaunchSpec};
use crate::config::TerminalPreference;
use crate::process::TerminalApp;

/// 自动选择时的终端优先级
const AUTO_ORDER: [TerminalApp; 7] = [
    TerminalApp::Ghostty,
    TerminalApp::GnomeTerminal,
    TerminalApp::Konsole,
    TerminalApp::Kitty,
    TerminalApp::Alacritty,
    TerminalApp::WezTerm,
    TerminalApp::Xterm,
];

/// `wmctrl -lpx` 的一行
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowEntry {
    pub id: String,
    pub pid: u32,
    /// WM_CLASS，形如 `kitty.kitty`
    pub class: String,
    pub title: String,
}

impl WindowEntry {
    /// 按 WM_CLASS 识别终端窗口
    pub fn terminal_app(&self) -> Option<TerminalApp> {
        let class = self.class.to_lowercase();
        AUTO_ORDER
            .into_iter()
            .find(|app| class.contains(app.binary_name()))
    }
}

/// 解析 `wmctrl -lpx` 输出：`<id> <desktop> <pid> <class> <host> <title...>`
pub fn parse_wmctrl_list(output: &str) -> Vec<WindowEntry> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let id = parts.next()?.to_string();
            let _desktop = parts.next()?;
            let pid = parts.next()?.parse().ok()?;
            let class = parts.next()?.to_string();
            let _host = parts.next()?;
            let title = parts.collect::<Vec<_>>().join(" ");
            Some(WindowEntry { id, pid, class, title })
        })
        .collect()
}

/// 标题命中提示词的第一个终端窗口；浏览器等其他窗口不参与
pub fn find_terminal_window<'a>(
    windows: &'a [WindowEntry],
    hints: &[String],
) -> Option<(&'a WindowEntry, TerminalApp)> {
    windows
        .iter()
        .filter(|w| title_matches(&w.title, hints))
        .find_map(|w| w.terminal_app().map(|app| (w, app)))
}

fn title_matches(title: &str, hints: &[String]) -> bool {
    let lower = title.to_lowercase();
    hints
        .iter()
        .filter(|h| !h.is_empty())
        .any(|h| lower.contains(&h.to_lowercase()))
}

/// wmctrl 后端
pub struct WmctrlBackend {
    preference: TerminalPreference,
}

impl WmctrlBackend {
    pub fn new(preference: TerminalPreference) -> Self {
        Self { preference }
    }

    fn list_windows() -> Vec<WindowEntry> {
        if which::which("wmctrl").is_err() {
            return Vec::new();
        }
        match Command::new("wmctrl").arg("-lpx").output() {
            Ok(output) if output.status.success() => {
                parse_wmctrl_list(&String::from_utf8_lossy(&output.stdout))
            }
            _ => Vec::new(),
        }
    }

    fn activate_window(window: &WindowEntry) -> bool {
        let ok = Command::new("wmctrl")
            .args(["-i", "-a", &window.id])
            .status()
            .map(|s| s.success())
            .unwrap_or(false);
        if ok {
            debug!(window = %window.id, title = %window.title, "Window activated");
        }
        ok
    }

    fn resolve_terminal(&self) -> Option<TerminalApp> {
        let preferred = match self.preference {
            TerminalPreference::App(app) => Some(app),
            TerminalPreference::Auto => None,
        };
        preferred
            .into_iter()
            .chain(AUTO_ORDER)
            .find(|app| which::which(app.binary_name()).is_ok())
    }
}

/// 各终端执行命令的参数格式
pub fn terminal_args(app: TerminalApp, shell: &str, line: &str) -> Vec<String> {
    let exec = vec![shell.to_string(), "-lc".to_string(), line.to_string()];
    let prefix: Vec<&str> = match app {
        TerminalApp::GnomeTerminal => vec!["--"],
        TerminalApp::Kitty => vec![],
        TerminalApp::WezTerm => vec!["start", "--"],
        _ => vec!["-e"],
    };
    prefix.into_iter().map(str::to_string).chain(exec).collect()
}

impl FocusBackend for WmctrlBackend {
    fn focus_app(&self, app: TerminalApp, app_pid: u32, hints: &[String]) -> bool {
        let windows: Vec<WindowEntry> = Self::list_windows()
            .into_iter()
            .filter(|w| w.pid == app_pid)
            .collect();
        // 同一进程多个窗口时需要命中提示词
        let target = windows
            .iter()
            .find(|w| title_matches(&w.title, hints))
            .or_else(|| (windows.len() == 1 && app != TerminalApp::Ghostty).then(|| &windows[0]));
        target.map(Self::activate_window).unwrap_or(false)
    }

    fn focus_window_by_hints(&self, hints: &[String]) -> Option<Focused> {
        let windows = Self::list_windows();
        let (window, app) = find_terminal_window(&windows, hints)?;
        Self::activate_window(window).then_some(Focused {
            app: Some(app),
            pid: Some(window.pid),
        })
    }

    fn focus_by_tty(&self, _tty: &str) -> Option<Focused> {
        // X11 窗口不暴露 tty
        None
    }

    fn focus_by_title(&self, needle: &str) -> Option<Focused> {
        self.focus_window_by_hints(&[needle.to_string()])
    }

    fn activate_existing(&self, app: TerminalApp) -> bool {
        if which::which("wmctrl").is_err() {
            return false;
        }
        Command::new("wmctrl")
            .args(["-x", "-a", app.binary_name()])
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn open_terminal(&self, launch: &LaunchSpec) -> Result<TerminalApp> {
        let app = self
            .resolve_terminal()
            .ok_or_else(|| anyhow!("no terminal emulator found"))?;
        let line = launch.shell_line();
        let args = terminal_args(app, &launch.shell, &line);
        info!(app = %app, command = %line, "Opening terminal");

        Command::new(app.binary_name())
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to launch {}", app.binary_name()))?;
        Ok(app)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_wmctrl_list() {
        let output = "0x03a00003  0 4242 kitty.kitty  host  web — zellij (agent-web)\n0x01  -1 77 desktop_window.Nautilus host Desktop\nbad\n";
        let windows = parse_wmctrl_list(output);
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].id, "0x03a00003");
        assert_eq!(windows[0].pid, 4242);
        assert_eq!(windows[0].class, "kitty.kitty");
        assert_eq!(windows[0].title, "web — zellij (agent-web)");
        assert_eq!(windows[1].pid, 77);
        assert_eq!(windows[1].terminal_app(), None);
    }

    #[test]
    fn test_hint_search_skips_non_terminal_windows() {
        let output = concat!(
            "0x02000007  0 900  Navigator.firefox  host  Web App - Mozilla Firefox\n",
            "0x04400003  0 1200 gnome-terminal-server.Gnome-terminal  host  ~/web: pi\n",
        );
        let windows = parse_wmctrl_list(output);
        let hints = vec!["web".to_string()];

        let (window, app) = find_terminal_window(&windows, &hints).unwrap();
        assert_eq!(window.pid, 1200);
        assert_eq!(app, TerminalApp::GnomeTerminal);

        // 只有浏览器标题命中时不聚焦任何窗口
        assert!(find_terminal_window(&windows[..1], &hints).is_none());
    }

    #[test]
    fn test_title_matches_case_insensitive() {
        let hints = vec!["Agent-Web".to_string()];
        assert!(title_matches("zellij (agent-web)", &hints));
        assert!(!title_matches("zellij (other)", &hints));
        assert!(!title_matches("anything", &[String::new()]));
    }

    #[test]
    fn test_terminal_args() {
        assert_eq!(
            terminal_args(TerminalApp::GnomeTerminal, "/bin/bash", "exec /bin/bash -l"),
            vec!["--", "/bin/bash", "-lc", "exec /bin/bash -l"]
        );
        assert_eq!(
            terminal_args(TerminalApp::Xterm, "/bin/sh", "x"),
            vec!["-e", "/bin/sh", "-lc", "x"]
        );
        assert_eq!(terminal_args(TerminalApp::Kitty, "/bin/sh", "x"), vec!["/bin/sh", "-lc", "x"]);
    }
}
