//! 消息 bridge - 通过文件收件箱把消息交给代理内的 bridge 扩展
//!
//! 目录结构：
//! - `registry/<pid>.json`：扩展定期刷新的注册信息（`pid`、`updatedAt`）
//! - `inbox/<pid>/<id>.json`：守护进程写入的消息（先写临时文件再原子改名）
//! - `acks/<pid>/<id>.json`：扩展写回的确认（`status`、`error`、`resolvedMode`）

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

const DEFAULT_REGISTRY_STALE_MS: i64 = 10_000;
const DEFAULT_ACK_TIMEOUT_MS: u64 = 1_200;
const DEFAULT_RETRIES: u32 = 3;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 450;
const ACK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// bridge 侧表示限流的错误码
const RATE_LIMIT_ERRORS: [&str; 3] = ["rate_limited", "bridge_rate_limited", "pi_rate_limited"];

#[derive(Debug, Serialize)]
struct Envelope<'a> {
    v: u32,
    id: String,
    pid: u32,
    text: &'a str,
    source: &'static str,
    #[serde(rename = "createdAt")]
    created_at: String,
    #[serde(rename = "expiresAt")]
    expires_at: String,
    delivery: EnvelopeDelivery,
    meta: EnvelopeMeta,
}

#[derive(Debug, Serialize)]
struct EnvelopeDelivery {
    mode: &'static str,
}

#[derive(Debug, Serialize)]
struct EnvelopeMeta {
    #[serde(rename = "requestId")]
    request_id: String,
    attempt: u32,
}

#[derive(Debug, Default, Deserialize)]
struct Ack {
    status: Option<String>,
    error: Option<String>,
    #[serde(rename = "resolvedMode")]
    resolved_mode: Option<String>,
}

/// 一次 bridge 投递的结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BridgeReply {
    pub delivered: bool,
    pub mode: String,
    pub ack: Option<String>,
    pub error: Option<String>,
    pub bridge_error: Option<String>,
    pub attempts: u32,
}

impl BridgeReply {
    /// bridge 明确返回限流
    pub fn rate_limited(&self) -> bool {
        self.bridge_error
            .as_deref()
            .map(|e| RATE_LIMIT_ERRORS.contains(&e))
            .unwrap_or(false)
            || self
                .error
                .as_deref()
                .map(|e| e.contains("rate_limited"))
                .unwrap_or(false)
    }

    fn failed(error: impl Into<String>, attempts: u32) -> Self {
        Self {
            delivered: false,
            mode: "queued".to_string(),
            ack: None,
            error: Some(error.into()),
            bridge_error: None,
            attempts,
        }
    }
}

/// bridge 目录客户端
#[derive(Debug, Clone)]
pub struct BridgeClient {
    dir: PathBuf,
    registry_stale_ms: i64,
    ack_timeout: Duration,
    retries: u32,
    retry_backoff: Duration,
}

impl BridgeClient {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let env_num = |key: &str| std::env::var(key).ok().and_then(|v| v.trim().parse::<u64>().ok());
        Self {
            dir: dir.into(),
            registry_stale_ms: env_num("PI_BRIDGE_REGISTRY_STALE_MS")
                .map(|v| (v as i64).max(1_000))
                .unwrap_or(DEFAULT_REGISTRY_STALE_MS),
            ack_timeout: Duration::from_millis(
                env_num("PI_BRIDGE_ACK_TIMEOUT_MS")
                    .unwrap_or(DEFAULT_ACK_TIMEOUT_MS)
                    .max(200),
            ),
            retries: env_num("PI_BRIDGE_SEND_RETRIES")
                .map(|v| v.clamp(1, 8) as u32)
                .unwrap_or(DEFAULT_RETRIES),
            retry_backoff: Duration::from_millis(
                env_num("PI_BRIDGE_SEND_RETRY_BACKOFF_MS")
                    .unwrap_or(DEFAULT_RETRY_BACKOFF_MS)
                    .clamp(100, 3_000),
            ),
        }
    }

    /// 调整确认等待参数（测试用）
    pub fn with_timing(mut self, ack_timeout: Duration, retries: u32, retry_backoff: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self.retries = retries.max(1);
        self.retry_backoff = retry_backoff;
        self
    }

    /// 注册信息存在、pid 一致且未过期
    pub fn is_registered(&self, pid: u32, now_ms: i64) -> bool {
        let path = self.dir.join("registry").join(format!("{}.json", pid));
        let Ok(content) = fs::read_to_string(&path) else {
            return false;
        };
        let Ok(value) = serde_json::from_str::<Value>(&content) else {
            debug!(path = %path.display(), "Ignoring malformed bridge registry entry");
            return false;
        };
        let registered_pid = value.get("pid").and_then(Value::as_u64);
        let updated_at = value.get("updatedAt").and_then(Value::as_f64).unwrap_or(0.0) as i64;

        registered_pid == Some(pid as u64)
            && updated_at > 0
            && now_ms - updated_at <= self.registry_stale_ms
    }

    /// 投递消息并等待确认（阻塞）；限流时按退避重试
    pub fn send(&self, pid: u32, text: &str) -> BridgeReply {
        let inbox_dir = self.dir.join("inbox").join(pid.to_string());
        let ack_dir = self.dir.join("acks").join(pid.to_string());
        if let Err(e) = fs::create_dir_all(&inbox_dir).and_then(|_| fs::create_dir_all(&ack_dir)) {
            return BridgeReply::failed(format!("bridge directory error: {}", e), 0);
        }

        let mut last = BridgeReply::failed("bridge delivery failed", 0);
        for attempt in 1..=self.retries {
            let id = Uuid::new_v4().to_string();
            if let Err(e) = self.enqueue(&inbox_dir, &id, pid, text, attempt) {
                warn!(pid = pid, error = %e, "Bridge enqueue failed");
                return BridgeReply::failed(format!("bridge enqueue failed: {}", e), attempt);
            }

            let Some(ack) = self.wait_for_ack(&ack_dir.join(format!("{}.json", id))) else {
                return BridgeReply::failed("bridge ack timeout", attempt);
            };

            let status = ack.status.unwrap_or_else(|| "failed".to_string());
            let mode = ack.resolved_mode.unwrap_or_else(|| "queued".to_string());
            if status == "delivered" {
                info!(pid = pid, attempt = attempt, "Bridge delivered message");
                return BridgeReply {
                    delivered: true,
                    mode,
                    ack: Some(status),
                    error: None,
                    bridge_error: None,
                    attempts: attempt,
                };
            }

            last = BridgeReply {
                delivered: false,
                mode,
                error: Some(format!("bridge ack: {}", status)),
                ack: Some(status),
                bridge_error: ack.error.filter(|e| !e.is_empty()),
                attempts: attempt,
            };
            if last.rate_limited() && attempt < self.retries {
                debug!(pid = pid, attempt = attempt, "Bridge rate limited, retrying");
                std::thread::sleep(self.retry_backoff);
                continue;
            }
            break;
        }
        last
    }

    fn enqueue(&self, inbox_dir: &Path, id: &str, pid: u32, text: &str, attempt: u32) -> Result<()> {
        let now = Utc::now();
        let envelope = Envelope {
            v: 1,
            id: id.to_string(),
            pid,
            text,
            source: "statusbar",
            created_at: now.to_rfc3339_opts(SecondsFormat::Millis, true),
            expires_at: (now + ChronoDuration::seconds(60)).to_rfc3339_opts(SecondsFormat::Millis, true),
            delivery: EnvelopeDelivery { mode: "queued" },
            meta: EnvelopeMeta {
                request_id: format!("statusd-{}", id),
                attempt,
            },
        };

        let tmp = inbox_dir.join(format!(".{}.tmp", id));
        let target = inbox_dir.join(format!("{}.json", id));
        fs::write(&tmp, serde_json::to_vec(&envelope)?).context("failed to write envelope")?;
        if let Err(e) = fs::rename(&tmp, &target) {
            let _ = fs::remove_file(&tmp);
            return Err(e).context("failed to publish envelope");
        }
        Ok(())
    }

    fn wait_for_ack(&self, ack_path: &Path) -> Option<Ack> {
        let deadline = Instant::now() + self.ack_timeout;
        while Instant::now() < deadline {
            if let Ok(content) = fs::read_to_string(ack_path) {
                return Some(serde_json::from_str(&content).unwrap_or(Ack {
                    status: Some("failed".to_string()),
                    error: Some("invalid_ack".to_string()),
                    resolved_mode: None,
                }));
            }
            std::thread::sleep(ACK_POLL_INTERVAL);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// 模拟扩展：读取收件箱中的第一条消息并写回确认
    fn spawn_acker(dir: PathBuf, pid: u32, acks: Vec<Value>) -> std::thread::JoinHandle<Vec<Value>> {
        std::thread::spawn(move || {
            let inbox = dir.join("inbox").join(pid.to_string());
            let ack_dir = dir.join("acks").join(pid.to_string());
            let mut seen = Vec::new();
            let mut answered = std::collections::HashSet::new();
            let deadline = Instant::now() + Duration::from_secs(5);

            while seen.len() < acks.len() && Instant::now() < deadline {
                if let Ok(entries) = fs::read_dir(&inbox) {
                    for entry in entries.flatten() {
                        let path = entry.path();
                        if path.extension().and_then(|e| e.to_str()) != Some("json") || answered.contains(&path) {
                            continue;
                        }
                        let envelope: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
                        let id = envelope["id"].as_str().unwrap().to_string();
                        fs::write(ack_dir.join(format!("{}.json", id)), acks[seen.len()].to_string()).unwrap();
                        answered.insert(path);
                        seen.push(envelope);
                    }
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            seen
        })
    }

    #[test]
    fn test_registry_freshness() {
        let dir = tempfile::tempdir().unwrap();
        let registry = dir.path().join("registry");
        fs::create_dir_all(&registry).unwrap();
        fs::write(registry.join("10.json"), json!({"pid": 10, "updatedAt": 100_000}).to_string()).unwrap();
        fs::write(registry.join("11.json"), json!({"pid": 99, "updatedAt": 100_000}).to_string()).unwrap();

        let client = BridgeClient::new(dir.path());
        assert!(client.is_registered(10, 105_000));
        assert!(!client.is_registered(10, 200_000));
        assert!(!client.is_registered(11, 105_000));
        assert!(!client.is_registered(12, 105_000));
    }

    #[test]
    fn test_send_delivered() {
        let dir = tempfile::tempdir().unwrap();
        let client = BridgeClient::new(dir.path()).with_timing(Duration::from_secs(3), 1, Duration::from_millis(100));
        let acker = spawn_acker(dir.path().to_path_buf(), 42, vec![json!({"status": "delivered", "resolvedMode": "queued"})]);

        let reply = client.send(42, "hello");
        let envelopes = acker.join().unwrap();

        assert!(reply.delivered);
        assert_eq!(reply.attempts, 1);
        assert_eq!(envelopes[0]["text"], "hello");
        assert_eq!(envelopes[0]["source"], "statusbar");
        assert_eq!(envelopes[0]["delivery"]["mode"], "queued");
    }

    #[test]
    fn test_send_retries_on_rate_limit() {
        let dir = tempfile::tempdir().unwrap();
        let client = BridgeClient::new(dir.path()).with_timing(Duration::from_secs(3), 3, Duration::from_millis(100));
        let acker = spawn_acker(
            dir.path().to_path_buf(),
            7,
            vec![
                json!({"status": "rejected", "error": "rate_limited"}),
                json!({"status": "delivered"}),
            ],
        );

        let reply = client.send(7, "again");
        acker.join().unwrap();
        assert!(reply.delivered);
        assert_eq!(reply.attempts, 2);
    }

    #[test]
    fn test_send_ack_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let client = BridgeClient::new(dir.path()).with_timing(Duration::from_millis(200), 1, Duration::from_millis(100));
        let reply = client.send(5, "nobody home");
        assert!(!reply.delivered);
        assert_eq!(reply.error.as_deref(), Some("bridge ack timeout"));
        assert!(!reply.rate_limited());
    }
}
