//! tmux 操作封装 - 向 pane 注入文本、抓取 pane 内容、按 tty 定位 pane

use anyhow::{anyhow, Result};
use std::process::Command;
use tracing::{debug, info, warn};

/// tmux 命令封装
pub struct TmuxClient {
    /// `-L` socket 标签（会话名实际是 socket 名时使用）
    socket_label: Option<String>,
}

impl TmuxClient {
    pub fn new() -> Self {
        Self { socket_label: None }
    }

    pub fn with_socket_label(label: &str) -> Self {
        Self {
            socket_label: Some(label.to_string()),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("tmux");
        if let Some(label) = &self.socket_label {
            cmd.args(["-L", label]);
        }
        cmd
    }

    /// 向 target 发送一条消息并回车
    /// 使用 -l 标志确保文本被字面解释，Enter 单独发送
    pub fn send_message(&self, target: Option<&str>, text: &str) -> Result<()> {
        let target_label = target.unwrap_or("<current>");
        info!(target = %target_label, text_len = text.len(), "Sending message to tmux pane");

        let mut cmd = self.command();
        cmd.arg("send-keys");
        if let Some(t) = target {
            cmd.args(["-t", t]);
        }
        let status = cmd.args(["-l", text]).status()?;
        if !status.success() {
            warn!(target = %target_label, "Failed to send text to tmux");
            return Err(anyhow!("tmux send-keys failed for {}", target_label));
        }

        debug!(target = %target_label, "Text sent, now sending Enter");

        let mut cmd = self.command();
        cmd.arg("send-keys");
        if let Some(t) = target {
            cmd.args(["-t", t]);
        }
        let status = cmd.arg("Enter").status()?;
        if status.success() {
            Ok(())
        } else {
            Err(anyhow!("tmux Enter failed for {}", target_label))
        }
    }

    /// 捕获 pane 最近 N 行输出
    pub fn capture_pane(&self, target: Option<&str>, lines: u32) -> Result<String> {
        let mut cmd = self.command();
        cmd.arg("capture-pane");
        if let Some(t) = target {
            cmd.args(["-t", t]);
        }
        let output = cmd
            .args(["-p", "-S", &format!("-{}", lines)])
            .output()?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(anyhow!("Failed to capture tmux pane"))
        }
    }

    /// 按 socket 标签抓取当前 pane（会话名常被用作 `-L` 标签）
    pub fn capture_pane_labeled(&self, label: &str, lines: u32) -> Result<String> {
        match Self::with_socket_label(label).capture_pane(None, lines) {
            Ok(text) => Ok(text),
            Err(_) => self.capture_pane(Some(label), lines),
        }
    }

    /// 查找 tty 对应的 pane（`session:window.pane`）
    pub fn pane_target_for_tty(&self, tty: &str) -> Option<String> {
        if tty.is_empty() || tty == crate::process::NO_TTY {
            return None;
        }
        let output = self
            .command()
            .args([
                "list-panes",
                "-a",
                "-F",
                "#{pane_tty} #{session_name}:#{window_index}.#{pane_index}",
            ])
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        parse_pane_target(&String::from_utf8_lossy(&output.stdout), tty)
    }
}

impl Default for TmuxClient {
    fn default() -> Self {
        Self::new()
    }
}

/// 解析 `list-panes` 输出，返回 tty 匹配的 pane target
pub fn parse_pane_target(list_output: &str, tty: &str) -> Option<String> {
    let tty_path = if tty.starts_with("/dev/") {
        tty.to_string()
    } else {
        format!("/dev/{}", tty)
    };

    list_output.lines().find_map(|line| {
        let (pane_tty, target) = line.trim().split_once(' ')?;
        let target = target.trim();
        (pane_tty == tty_path && !target.is_empty()).then(|| target.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pane_target() {
        let output = "/dev/ttys003 main:0.0\n/dev/ttys007 work:2.1\n\n";
        assert_eq!(parse_pane_target(output, "ttys007"), Some("work:2.1".to_string()));
        assert_eq!(
            parse_pane_target(output, "/dev/ttys003"),
            Some("main:0.0".to_string())
        );
        assert_eq!(parse_pane_target(output, "ttys009"), None);
    }

    #[test]
    fn test_pane_target_for_missing_tty() {
        let client = TmuxClient::new();
        assert_eq!(client.pane_target_for_tty("??"), None);
        assert_eq!(client.pane_target_for_tty(""), None);
    }
}
