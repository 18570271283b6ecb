//! 本地行协议：请求解析与分发

use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::error::ProtocolError;
use crate::monitor::{clamp_watch_timeout, Monitor};

/// 一行请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Status,
    Ping,
    Jump(u32),
    Latest(u32),
    Send { pid: u32, message: String },
    Watch { timeout: Duration, fingerprint: String },
}

/// 解析正整数 pid
pub fn parse_pid(raw: &str) -> Result<u32, ProtocolError> {
    raw.trim()
        .parse::<u32>()
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| ProtocolError::InvalidPid(raw.trim().to_string()))
}

/// 解析一行请求
pub fn parse_request(line: &str) -> Result<Request, ProtocolError> {
    let line = line.trim();
    let (command, rest) = match line.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim_start()),
        None => (line, ""),
    };

    match command {
        "" | "status" if rest.is_empty() => Ok(Request::Status),
        "ping" if rest.is_empty() => Ok(Request::Ping),
        "jump" if !rest.is_empty() => Ok(Request::Jump(parse_pid(rest)?)),
        "latest" if !rest.is_empty() => Ok(Request::Latest(parse_pid(rest)?)),
        "jump" | "latest" => Err(ProtocolError::BadRequest(format!("usage: {} <pid>", command))),
        "send" => {
            let Some((pid, message)) = rest.split_once(' ') else {
                return Err(ProtocolError::BadRequest("usage: send <pid> <message>".to_string()));
            };
            Ok(Request::Send {
                pid: parse_pid(pid)?,
                message: message.to_string(),
            })
        }
        "watch" => {
            let mut parts = rest.split_whitespace();
            // 无法解析的超时退回默认值
            let timeout = clamp_watch_timeout(parts.next().and_then(|t| t.parse().ok()));
            let fingerprint = parts.next().unwrap_or_default().to_string();
            Ok(Request::Watch { timeout, fingerprint })
        }
        _ => Err(ProtocolError::UnknownCommand(line.to_string())),
    }
}

fn render<T: Serialize>(result: Result<T, ProtocolError>) -> Value {
    result
        .and_then(|reply| serde_json::to_value(reply).map_err(|e| ProtocolError::Internal(e.to_string())))
        .unwrap_or_else(|e| e.to_json())
}

pub fn pong() -> Value {
    json!({"ok": true, "pong": true, "timestamp": chrono::Utc::now().timestamp()})
}

/// 执行请求并生成 JSON 响应
pub async fn dispatch(monitor: &Arc<Monitor>, request: Request) -> Value {
    match request {
        Request::Status => render(
            monitor
                .refresh()
                .await
                .map(|view| view.snapshot.clone())
                .map_err(ProtocolError::from),
        ),
        Request::Ping => pong(),
        Request::Jump(pid) => render(monitor.jump(pid).await),
        Request::Latest(pid) => render(monitor.latest(pid).await),
        Request::Send { pid, message } => render(monitor.send(pid, &message).await),
        Request::Watch { timeout, fingerprint } => render(
            monitor
                .wait_for_change(&fingerprint, timeout)
                .await
                .map_err(ProtocolError::from),
        ),
    }
}
