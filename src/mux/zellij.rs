//! zellij 操作封装

use anyhow::{anyhow, Context, Result};
use std::fs;
use std::process::Command;
use tracing::{debug, info};

/// 绑定到单个 zellij 会话的命令封装
pub struct ZellijClient {
    session: String,
}

impl ZellijClient {
    pub fn new(session: &str) -> Self {
        Self {
            session: session.to_string(),
        }
    }

    fn action(&self, args: &[&str]) -> Result<()> {
        let status = Command::new("zellij")
            .args(["--session", &self.session, "action"])
            .args(args)
            .status()
            .context("failed to run zellij")?;
        if status.success() {
            Ok(())
        } else {
            Err(anyhow!("zellij action {:?} failed for session {}", args, self.session))
        }
    }

    /// 写入文本后发送回车（字节 13）
    pub fn send_message(&self, text: &str) -> Result<()> {
        info!(session = %self.session, text_len = text.len(), "Sending message to zellij session");
        self.action(&["write-chars", text])?;
        self.action(&["write", "13"])
    }

    /// 导出当前 pane 的完整屏幕内容
    pub fn dump_screen(&self) -> Result<String> {
        let path = std::env::temp_dir().join(format!("statusd-zellij-{}.txt", uuid::Uuid::new_v4()));
        let path_str = path.to_string_lossy().to_string();

        let result = self
            .action(&["dump-screen", "--full", &path_str])
            .and_then(|_| fs::read(&path).context("failed to read zellij dump"))
            .map(|bytes| String::from_utf8_lossy(&bytes).to_string());

        if let Err(e) = fs::remove_file(&path) {
            debug!(path = %path.display(), error = %e, "Could not remove zellij dump file");
        }
        result
    }
}
