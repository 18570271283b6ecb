//! 终端复用器模块 - zellij / tmux / screen 的会话解析、消息注入与屏幕预览

pub mod tmux;
pub mod zellij;

use serde::{Deserialize, Serialize};
use std::path::Path;

pub use tmux::TmuxClient;
pub use zellij::ZellijClient;

/// 终端复用器类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mux {
    Zellij,
    Tmux,
    Screen,
}

impl Mux {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mux::Zellij => "zellij",
            Mux::Tmux => "tmux",
            Mux::Screen => "screen",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "zellij" => Some(Mux::Zellij),
            "tmux" => Some(Mux::Tmux),
            "screen" => Some(Mux::Screen),
            _ => None,
        }
    }

    /// 重新接入会话的 shell 命令
    pub fn attach_command(&self, session: &str) -> String {
        let quoted = shell_quote(session);
        match self {
            Mux::Zellij => format!("zellij attach {}", quoted),
            Mux::Tmux => format!("tmux attach -t {}", quoted),
            Mux::Screen => format!("screen -r {}", quoted),
        }
    }
}

impl std::fmt::Display for Mux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 从 zellij 命令行提取会话名：`-s`、`--session`，或 `--server <socket path>` 的文件名
pub fn zellij_session_from_args(args: &str) -> Option<String> {
    let parts: Vec<&str> = args.split_whitespace().collect();
    for (i, part) in parts.iter().enumerate() {
        let Some(next) = parts.get(i + 1) else {
            break;
        };
        match *part {
            "-s" | "--session" => return Some(next.to_string()),
            "--server" => {
                return Path::new(next)
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
            }
            _ => {}
        }
    }
    None
}

/// 从 tmux 命令行提取会话名：`-t`、`--target` 或 `-tNAME`，只取 `:` 之前
pub fn tmux_session_from_args(args: &str) -> Option<String> {
    let parts: Vec<&str> = args.split_whitespace().collect();
    for (i, part) in parts.iter().enumerate() {
        let target = match *part {
            "-t" | "--target" => parts.get(i + 1).copied(),
            p if p.starts_with("-t") && p.len() > 2 => Some(&p[2..]),
            _ => None,
        };
        if let Some(target) = target {
            let session = target.split(':').next().unwrap_or("").trim();
            if !session.is_empty() {
                return Some(session.to_string());
            }
        }
    }
    None
}

/// 从 screen 命令行提取会话名：`-S` 或 `-r`
pub fn screen_session_from_args(args: &str) -> Option<String> {
    let parts: Vec<&str> = args.split_whitespace().collect();
    parts
        .windows(2)
        .find(|w| matches!(w[0], "-S" | "-r" | "-x"))
        .map(|w| w[1].to_string())
}

/// POSIX shell 单引号转义
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:@%+=".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// 通过复用器抓取屏幕尾部作为消息预览（阻塞调用）
pub fn runtime_preview(mux: Mux, session: &str) -> Option<String> {
    let dump = match mux {
        Mux::Zellij => ZellijClient::new(session).dump_screen().ok()?,
        Mux::Tmux => TmuxClient::new().capture_pane_labeled(session, 2000).ok()?,
        Mux::Screen => return None,
    };
    crate::terminal_utils::preview_from_terminal_dump(&dump)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zellij_session_parsing() {
        assert_eq!(
            zellij_session_from_args("zellij -s agent-web"),
            Some("agent-web".to_string())
        );
        assert_eq!(
            zellij_session_from_args("zellij --server /tmp/zellij-501/0.40.1/work"),
            Some("work".to_string())
        );
        assert_eq!(zellij_session_from_args("zellij"), None);
    }

    #[test]
    fn test_tmux_session_parsing() {
        assert_eq!(tmux_session_from_args("tmux attach -t dev:1.0"), Some("dev".to_string()));
        assert_eq!(tmux_session_from_args("tmux a -tmain"), Some("main".to_string()));
        assert_eq!(tmux_session_from_args("tmux new-session"), None);
    }

    #[test]
    fn test_screen_session_parsing() {
        assert_eq!(screen_session_from_args("SCREEN -S build"), Some("build".to_string()));
        assert_eq!(screen_session_from_args("screen"), None);
    }

    #[test]
    fn test_attach_command_quotes_session() {
        assert_eq!(Mux::Zellij.attach_command("agent-web"), "zellij attach agent-web");
        assert_eq!(Mux::Tmux.attach_command("my session"), "tmux attach -t 'my session'");
        assert_eq!(Mux::Screen.attach_command("it's"), r"screen -r 'it'\''s'");
    }

    #[test]
    fn test_mux_serde_lowercase() {
        assert_eq!(serde_json::to_string(&Mux::Zellij).unwrap(), "\"zellij\"");
        assert_eq!(Mux::parse("TMUX"), Some(Mux::Tmux));
        assert_eq!(Mux::parse("byobu"), None);
    }
}
