//! macOS 聚焦后端 - 通过 osascript 执行 AppleScript

use anyhow::{anyhow, Result};
use std::process::Command;
use tracing::{debug, warn};

use super::{FocusBackend, Focused, LaunchSpec};
use crate::config::TerminalPreference;
use crate::process::TerminalApp;

/// 自动选择时的终端优先级
const AUTO_ORDER: [TerminalApp; 3] = [TerminalApp::Ghostty, TerminalApp::ITerm2, TerminalApp::Terminal];

/// AppleScript 字符串转义
pub fn applescript_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

fn applescript_list(items: &[String]) -> String {
    items
        .iter()
        .filter(|s| !s.is_empty())
        .map(|s| format!("\"{}\"", applescript_escape(s)))
        .collect::<Vec<_>>()
        .join(", ")
}

/// 执行脚本，脚本返回 "ok" 视为成功
fn run_osascript(script: &str) -> bool {
    match Command::new("/usr/bin/osascript").args(["-e", script]).output() {
        Ok(output) if output.status.success() => {
            String::from_utf8_lossy(&output.stdout).trim().eq_ignore_ascii_case("ok")
        }
        Ok(output) => {
            let err = String::from_utf8_lossy(&output.stderr);
            if !err.trim().is_empty() {
                debug!(error = %err.trim(), "osascript error");
            }
            false
        }
        Err(e) => {
            warn!(error = %e, "Failed to run osascript");
            false
        }
    }
}

fn window_raise_script(process_clause: &str, needles: &str) -> String {
    format!(
        r#"
set needles to {{{needles}}}
try
  tell application "System Events"
    {process_clause}
    tell targetProcess
      repeat with w in windows
        try
          set n to (name of w as text)
          repeat with needle in needles
            ignoring case
              if n contains (needle as text) then
                tell application "Ghostty" to activate
                set frontmost to true
                perform action "AXRaise" of w
                return "ok"
              end if
            end ignoring
          end repeat
        end try
      end repeat
    end tell
  end tell
end try
return "no"
"#
    )
}

/// AppleScript 后端
pub struct AppleScriptBackend {
    preference: TerminalPreference,
}

impl AppleScriptBackend {
    pub fn new(preference: TerminalPreference) -> Self {
        Self { preference }
    }

    fn app_available(app: TerminalApp) -> bool {
        Command::new("/usr/bin/open")
            .args(["-Ra", &app.bundle_name()])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// 配置的终端可用时优先，否则按 Ghostty、iTerm2、Terminal 顺序
    fn resolve_terminal(&self) -> TerminalApp {
        if let TerminalPreference::App(app) = self.preference {
            if AUTO_ORDER.contains(&app) && Self::app_available(app) {
                return app;
            }
        }
        AUTO_ORDER
            .into_iter()
            .find(|app| Self::app_available(*app))
            .unwrap_or(TerminalApp::Terminal)
    }

    fn activate_app(app: TerminalApp) -> bool {
        let name = applescript_escape(&app.to_string());
        let script = format!(
            r#"
try
  tell application "{name}" to activate
  delay 0.05
  tell application "System Events"
    if exists process "{name}" then
      tell process "{name}"
        set frontmost to true
        try
          if (count of windows) > 0 then
            perform action "AXRaise" of window 1
          end if
        end try
      end tell
    end if
  end tell
  return "ok"
end try
return "no"
"#
        );
        run_osascript(&script)
    }
}

impl FocusBackend for AppleScriptBackend {
    fn focus_app(&self, app: TerminalApp, app_pid: u32, hints: &[String]) -> bool {
        if app == TerminalApp::Ghostty {
            // Ghostty 多实例时必须命中具体窗口
            let needles = applescript_list(hints);
            if needles.is_empty() {
                return false;
            }
            let clause = format!(
                "set targetProcess to missing value\n    try\n      set targetProcess to first process whose unix id is {}\n    end try\n    if targetProcess is missing value then\n      return \"no\"\n    end if",
                app_pid
            );
            return run_osascript(&window_raise_script(&clause, &needles));
        }
        Self::activate_app(app)
    }

    fn focus_window_by_hints(&self, hints: &[String]) -> Option<Focused> {
        let needles = applescript_list(hints);
        if needles.is_empty() {
            return None;
        }
        let clause = "if not (exists process \"Ghostty\") then\n      return \"no\"\n    end if\n    set targetProcess to process \"Ghostty\"";
        run_osascript(&window_raise_script(clause, &needles)).then(|| Focused::app(TerminalApp::Ghostty))
    }

    fn focus_by_tty(&self, tty: &str) -> Option<Focused> {
        let t = applescript_escape(tty);
        let iterm = format!(
            r#"
set targetTTY to "{t}"
try
  tell application "iTerm2"
    repeat with w in windows
      repeat with tb in tabs of w
        repeat with s in sessions of tb
          try
            if (tty of s as text) ends with targetTTY then
              tell w to select tb
              activate
              return "ok"
            end if
          end try
        end repeat
      end repeat
    end repeat
  end tell
end try
return "no"
"#
        );
        if run_osascript(&iterm) {
            return Some(Focused::app(TerminalApp::ITerm2));
        }

        let terminal = format!(
            r#"
set targetTTY to "{t}"
try
  tell application "Terminal"
    repeat with w in windows
      repeat with tb in tabs of w
        try
          if (tty of tb as text) ends with targetTTY then
            set selected of tb to true
            activate
            return "ok"
          end if
        end try
      end repeat
    end repeat
  end tell
end try
return "no"
"#
        );
        run_osascript(&terminal).then(|| Focused::app(TerminalApp::Terminal))
    }

    fn focus_by_title(&self, needle: &str) -> Option<Focused> {
        let n = applescript_escape(needle);
        let iterm = format!(
            r#"
set needle to "{n}"
try
  tell application "iTerm2"
    repeat with w in windows
      repeat with tb in tabs of w
        try
          if (name of tb as text) contains needle then
            tell w to select tb
            activate
            return "ok"
          end if
        end try
      end repeat
    end repeat
  end tell
end try
return "no"
"#
        );
        if run_osascript(&iterm) {
            return Some(Focused::app(TerminalApp::ITerm2));
        }

        let terminal = format!(
            r#"
set needle to "{n}"
try
  tell application "Terminal"
    repeat with w in windows
      repeat with tb in tabs of w
        try
          if (custom title of tb as text) contains needle then
            set selected of tb to true
            activate
            return "ok"
          end if
        end try
      end repeat
    end repeat
  end tell
end try
return "no"
"#
        );
        run_osascript(&terminal).then(|| Focused::app(TerminalApp::Terminal))
    }

    fn activate_existing(&self, app: TerminalApp) -> bool {
        let name = applescript_escape(&app.to_string());
        let script = format!(
            r#"
try
  tell application "System Events"
    if exists process "{name}" then
      tell process "{name}"
        set frontmost to true
        try
          if (count of windows) > 0 then
            perform action "AXRaise" of window 1
          end if
        end try
      end tell
      return "ok"
    end if
  end tell
end try
return "no"
"#
        );
        run_osascript(&script)
    }

    fn open_terminal(&self, launch: &LaunchSpec) -> Result<TerminalApp> {
        let app = self.resolve_terminal();
        let line = launch.shell_line();
        debug!(app = %app, command = %line, "Opening terminal");

        let ok = match app {
            TerminalApp::Ghostty => Command::new("/usr/bin/open")
                .args(["-na", "Ghostty.app", "--args", "-e", &launch.shell, "-lc", &line])
                .output()
                .map(|o| o.status.success())
                .unwrap_or(false),
            TerminalApp::ITerm2 => run_osascript(&format!(
                "try\n  tell application \"iTerm2\"\n    activate\n    create window with default profile command \"{}\"\n    return \"ok\"\n  end tell\nend try\nreturn \"no\"",
                applescript_escape(&line)
            )),
            _ => run_osascript(&format!(
                "try\n  tell application \"Terminal\"\n    activate\n    do script \"{}\"\n    return \"ok\"\n  end tell\nend try\nreturn \"no\"",
                applescript_escape(&line)
            )),
        };

        if ok {
            Ok(app)
        } else {
            Err(anyhow!("{} did not open a window", app))
        }
    }

    fn write_to_session(&self, tty: &str, text: &str, app: Option<TerminalApp>) -> bool {
        let t = applescript_escape(tty);
        let payload = applescript_escape(text);

        let mut order = Vec::new();
        if let Some(a @ (TerminalApp::ITerm2 | TerminalApp::Terminal)) = app {
            order.push(a);
        }
        for candidate in [TerminalApp::ITerm2, TerminalApp::Terminal] {
            if !order.contains(&candidate) {
                order.push(candidate);
            }
        }

        order.into_iter().any(|candidate| {
            let script = if candidate == TerminalApp::ITerm2 {
                format!(
                    r#"
set targetTTY to "{t}"
set payload to "{payload}"
try
  tell application "iTerm2"
    repeat with w in windows
      repeat with tb in tabs of w
        repeat with s in sessions of tb
          try
            if (tty of s as text) ends with targetTTY then
              write text payload newline YES to s
              return "ok"
            end if
          end try
        end repeat
      end repeat
    end repeat
  end tell
end try
return "no"
"#
                )
            } else {
                format!(
                    r#"
set targetTTY to "{t}"
set payload to "{payload}"
try
  tell application "Terminal"
    repeat with w in windows
      repeat with tb in tabs of w
        try
          if (tty of tb as text) ends with targetTTY then
            do script payload in tb
            return "ok"
          end if
        end try
      end repeat
    end repeat
  end tell
end try
return "no"
"#
                )
            };
            run_osascript(&script)
        })
    }
}
