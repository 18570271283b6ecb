//! 配置模块 - 守护进程路径、阈值、终端偏好与 HTTP bridge 配置
//!
//! 所有运行参数都有默认值，环境变量优先于配置文件。配置文件缺失或损坏时
//! 回退到默认值，不会阻止守护进程启动。

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::process::TerminalApp;

/// 默认监控的进程名
pub const DEFAULT_PROCESS_NAME: &str = "pi";
/// 默认扫描间隔（毫秒）
pub const DEFAULT_SCAN_INTERVAL_MS: u64 = 1_000;
/// telemetry 记录默认过期时间（毫秒）
pub const DEFAULT_TELEMETRY_STALE_MS: u64 = 10_000;
/// 会话目录缓存刷新间隔
pub const DEFAULT_SESSION_REFRESH: Duration = Duration::from_secs(5);
/// 会话日志只读取末尾窗口
pub const TRANSCRIPT_TAIL_BYTES: u64 = 256 * 1024;
/// HTTP bridge 默认端口
pub const DEFAULT_HTTP_PORT: u16 = 8787;

/// 守护进程配置
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// 数据目录（socket、配置文件、telemetry）
    pub home: PathBuf,
    /// 本地 socket 路径
    pub socket_path: PathBuf,
    /// 代理进程名
    pub process_name: String,
    /// 扫描间隔
    pub scan_interval: Duration,
    /// telemetry 实例目录
    pub telemetry_dir: PathBuf,
    /// telemetry 过期阈值
    pub telemetry_stale: Duration,
    /// 会话日志根目录
    pub sessions_dir: PathBuf,
    /// 会话目录缓存刷新间隔
    pub session_refresh: Duration,
    /// 会话日志尾部读取窗口
    pub transcript_tail_bytes: u64,
    /// 消息 bridge 目录
    pub bridge_dir: PathBuf,
}

impl DaemonConfig {
    /// 从环境变量构建配置
    pub fn from_env() -> Self {
        let home = env_path("PI_STATUSD_HOME").unwrap_or_else(default_home);
        let mut config = Self::with_home(home);

        if let Some(dir) = env_path("PI_TELEMETRY_DIR") {
            config.telemetry_dir = dir;
        }
        if let Some(ms) = env_u64("PI_TELEMETRY_STALE_MS") {
            config.telemetry_stale = Duration::from_millis(ms.max(1_000));
        }
        if let Some(dir) = env_path("PI_SESSIONS_DIR") {
            config.sessions_dir = dir;
        }
        if let Some(dir) = env_path("PI_BRIDGE_DIR") {
            config.bridge_dir = dir;
        }
        config
    }

    /// 以指定数据目录构建配置（测试中使用临时目录）
    pub fn with_home(home: PathBuf) -> Self {
        let sessions_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".pi")
            .join("agent")
            .join("sessions");

        Self {
            socket_path: home.join("statusd.sock"),
            process_name: DEFAULT_PROCESS_NAME.to_string(),
            scan_interval: Duration::from_millis(DEFAULT_SCAN_INTERVAL_MS),
            telemetry_dir: home.join("telemetry").join("instances"),
            telemetry_stale: Duration::from_millis(DEFAULT_TELEMETRY_STALE_MS),
            sessions_dir,
            session_refresh: DEFAULT_SESSION_REFRESH,
            transcript_tail_bytes: TRANSCRIPT_TAIL_BYTES,
            bridge_dir: home.join("statusbridge"),
            home,
        }
    }

    /// 终端偏好配置文件
    pub fn terminal_config_path(&self) -> PathBuf {
        self.home.join("statusd.json")
    }

    /// HTTP bridge 配置文件
    pub fn http_config_path(&self) -> PathBuf {
        self.home.join("statusd-http.json")
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

fn default_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".pi-statusbar")
}

/// 终端偏好：`auto` 按固定顺序解析，或指定应用
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TerminalPreference {
    #[default]
    Auto,
    App(TerminalApp),
}

impl TerminalPreference {
    pub fn parse(raw: &str) -> Self {
        let value = raw.trim().to_lowercase();
        match value.as_str() {
            "" | "auto" | "system" | "default" => TerminalPreference::Auto,
            other => TerminalApp::from_config_name(other)
                .map(TerminalPreference::App)
                .unwrap_or(TerminalPreference::Auto),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct TerminalConfigFile {
    terminal: Option<String>,
    preferred_terminal: Option<String>,
}

/// 读取终端偏好；`PI_STATUS_TERMINAL` 优先于配置文件
pub fn load_terminal_preference(path: &Path) -> TerminalPreference {
    if let Some(value) = env_string("PI_STATUS_TERMINAL") {
        return TerminalPreference::parse(&value);
    }

    let file: TerminalConfigFile = read_json_file(path).unwrap_or_default();
    let raw = file.terminal.or(file.preferred_terminal).unwrap_or_default();
    TerminalPreference::parse(&raw)
}

/// HTTP bridge 配置
#[derive(Debug, Clone, PartialEq)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
    pub token: Option<String>,
    pub allow_cidrs: Vec<String>,
    pub allow_loopback_unauth: bool,
    pub send_rate_per_10s: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_HTTP_PORT,
            token: None,
            allow_cidrs: Vec::new(),
            allow_loopback_unauth: true,
            send_rate_per_10s: 12,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct HttpConfigFile {
    host: Option<String>,
    port: Option<u16>,
    token: Option<String>,
    allow_cidrs: Option<Vec<String>>,
    allow_loopback_unauth: Option<bool>,
    send_rate_per_10s: Option<usize>,
}

impl HttpConfig {
    /// 读取配置文件并应用环境变量覆盖
    pub fn load(path: &Path) -> Self {
        let file: HttpConfigFile = read_json_file(path).unwrap_or_default();
        let defaults = Self::default();

        let host = env_string("PI_STATUSD_HTTP_HOST")
            .or(file.host)
            .unwrap_or(defaults.host);
        let port = env_string("PI_STATUSD_HTTP_PORT")
            .and_then(|v| v.parse::<u16>().ok())
            .or(file.port)
            .filter(|p| *p > 0)
            .unwrap_or(defaults.port);
        let token = env_string("PI_STATUSD_HTTP_TOKEN")
            .or(file.token)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        let allow_cidrs = match env_string("PI_STATUSD_HTTP_ALLOW_CIDRS") {
            Some(raw) => raw
                .split(',')
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect(),
            None => file.allow_cidrs.unwrap_or_default(),
        };

        Self {
            host,
            port,
            token,
            allow_cidrs,
            allow_loopback_unauth: file
                .allow_loopback_unauth
                .unwrap_or(defaults.allow_loopback_unauth),
            send_rate_per_10s: file
                .send_rate_per_10s
                .unwrap_or(defaults.send_rate_per_10s)
                .clamp(1, 200),
        }
    }
}

fn read_json_file<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let content = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(value) => Some(value),
        Err(err) => {
            debug!(path = %path.display(), error = %err, "Ignoring malformed config file");
            None
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env_string(key).map(PathBuf::from)
}

fn env_u64(key: &str) -> Option<u64> {
    env_string(key).and_then(|v| v.parse().ok())
}
