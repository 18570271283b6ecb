//! 监控核心 - 共享状态、定时扫描与变更广播
//!
//! 聚合器与当前视图放在同一把锁后面，每次扫描整体替换视图；指纹变化时
//! 通过 watch 通道发布新的 [`Publication`]。等待方只读取不可变的发布副本。

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::aggregator::{ScanView, StateAggregator};
use crate::bridge::{BridgeClient, BridgeReply};
use crate::config::DaemonConfig;
use crate::error::ProtocolError;
use crate::jump::{FocusBackend, JumpReply, JumpResolver, JumpTarget};
use crate::mux::{self, Mux, TmuxClient, ZellijClient};
use crate::process::{ProcessSource, TerminalApp, NO_TTY};
use crate::snapshot::{
    agent_fingerprint, classify_agent_change, diff, AgentRow, ChangeEvent, SnapshotSource, StatusSnapshot,
};
use crate::terminal_utils::{message_gist, message_html};

/// watch 默认超时
pub const DEFAULT_WATCH_TIMEOUT_MS: u64 = 20_000;
pub const MIN_WATCH_TIMEOUT_MS: u64 = 250;
pub const MAX_WATCH_TIMEOUT_MS: u64 = 60_000;

/// 运行时预览缓存时间
const PREVIEW_TTL: Duration = Duration::from_secs(4);

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// 限制 watch 超时范围；缺省时使用默认值
pub fn clamp_watch_timeout(timeout_ms: Option<u64>) -> Duration {
    let ms = timeout_ms
        .unwrap_or(DEFAULT_WATCH_TIMEOUT_MS)
        .clamp(MIN_WATCH_TIMEOUT_MS, MAX_WATCH_TIMEOUT_MS);
    Duration::from_millis(ms)
}

/// 一次对外发布：按扫描序号全序排列
#[derive(Debug, Clone)]
pub struct Publication {
    pub seq: u64,
    pub snapshot: StatusSnapshot,
    /// 相对上一次发布的变更
    pub changes: Vec<ChangeEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchEvent {
    Snapshot,
    OutOfSync,
    StatusChanged,
    Timeout,
}

/// 全局 watch 的响应
#[derive(Debug, Clone, Serialize)]
pub struct WatchReply {
    pub ok: bool,
    pub event: WatchEvent,
    pub fingerprint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changes: Option<Vec<ChangeEvent>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusSnapshot>,
}

/// 单个代理 watch 的响应
#[derive(Debug, Clone, Serialize)]
pub struct AgentWatchReply {
    pub ok: bool,
    pub event: &'static str,
    pub pid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentRow>,
}

impl AgentWatchReply {
    fn with_agent(event: &'static str, agent: &AgentRow) -> Self {
        Self {
            ok: true,
            event,
            pid: agent.pid,
            fingerprint: Some(agent_fingerprint(agent)),
            agent: Some(agent.clone()),
        }
    }

    pub fn gone(pid: u32) -> Self {
        Self {
            ok: true,
            event: "agent_gone",
            pid,
            fingerprint: None,
            agent: None,
        }
    }
}

/// `latest <pid>` 的响应
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatestReply {
    pub ok: bool,
    pub pid: u32,
    pub session_file: Option<String>,
    pub latest_message: Option<String>,
    pub latest_message_full: Option<String>,
    pub latest_message_html: Option<String>,
    pub latest_message_at: Option<i64>,
}

/// `send <pid> <message>` 的响应
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SendReply {
    pub ok: bool,
    pub pid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub mux: Option<Mux>,
    pub mux_session: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tmux_target: Option<String>,
    pub tty: String,
    pub terminal_app: Option<TerminalApp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bridge: Option<BridgeReply>,
}

/// 投递所需的全部路由信息（从不可变视图复制）
#[derive(Debug, Clone)]
struct SendRoute {
    pid: u32,
    tty: String,
    mux: Option<Mux>,
    mux_session: Option<String>,
    pane_target: Option<String>,
    terminal_app: Option<TerminalApp>,
}

impl SendRoute {
    fn reply(&self, delivery: Option<&'static str>, error: Option<String>) -> SendReply {
        SendReply {
            ok: delivery.is_some(),
            pid: self.pid,
            delivery,
            error,
            mux: self.mux,
            mux_session: self.mux_session.clone(),
            tmux_target: None,
            tty: self.tty.clone(),
            terminal_app: self.terminal_app,
            bridge: None,
        }
    }
}

struct MonitorState {
    aggregator: StateAggregator,
    view: Arc<ScanView>,
}

/// 守护进程共享状态
pub struct Monitor {
    state: Mutex<MonitorState>,
    tx: watch::Sender<Arc<Publication>>,
    jumper: JumpResolver,
    backend: Arc<dyn FocusBackend>,
    bridge: BridgeClient,
    previews: Mutex<HashMap<u32, (Instant, Option<String>)>>,
}

impl Monitor {
    pub fn new(config: &DaemonConfig, source: Box<dyn ProcessSource>, backend: Arc<dyn FocusBackend>) -> Self {
        let initial = ScanView::empty(SnapshotSource::ProcessFallback, now_ms() / 1000);
        let (tx, _rx) = watch::channel(Arc::new(Publication {
            seq: 0,
            snapshot: initial.snapshot.clone(),
            changes: Vec::new(),
        }));

        Self {
            state: Mutex::new(MonitorState {
                aggregator: StateAggregator::new(config, source),
                view: Arc::new(initial),
            }),
            tx,
            jumper: JumpResolver::new(Arc::clone(&backend)),
            backend,
            bridge: BridgeClient::new(&config.bridge_dir),
            previews: Mutex::new(HashMap::new()),
        }
    }

    /// 订阅发布
    pub fn subscribe(&self) -> watch::Receiver<Arc<Publication>> {
        self.tx.subscribe()
    }

    /// 最近一次发布
    pub fn current(&self) -> Arc<Publication> {
        Arc::clone(&self.tx.borrow())
    }

    /// 同步扫描一次（阻塞），指纹变化时发布
    pub fn refresh_blocking(&self) -> Arc<ScanView> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let view = Arc::new(state.aggregator.scan(now_ms()));
        let prev = std::mem::replace(&mut state.view, Arc::clone(&view));

        if view.snapshot.fingerprint != prev.snapshot.fingerprint {
            let changes = diff(&prev.snapshot, &view.snapshot);
            let seq = self.tx.borrow().seq + 1;
            info!(
                seq = seq,
                fingerprint = %view.snapshot.fingerprint,
                changes = changes.len(),
                "Status changed"
            );
            self.tx.send_replace(Arc::new(Publication {
                seq,
                snapshot: view.snapshot.clone(),
                changes,
            }));
        }
        view
    }

    /// 在阻塞线程上扫描
    pub async fn refresh(self: &Arc<Self>) -> Result<Arc<ScanView>> {
        let this = Arc::clone(self);
        tokio::task::spawn_blocking(move || this.refresh_blocking())
            .await
            .context("scan task failed")
    }

    /// 按固定间隔扫描，直到任务被取消
    pub async fn run_scan_loop(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(e) = self.refresh().await {
                warn!(error = %e, "Scan loop iteration failed");
            }
        }
    }

    /// 全局 watch：指纹为空返回快照，不一致立即返回 out_of_sync，否则等待变化或超时
    pub async fn wait_for_change(self: &Arc<Self>, since: &str, timeout: Duration) -> Result<WatchReply> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut rx = self.subscribe();
        let view = self.refresh().await?;
        let held = rx.borrow_and_update().clone();
        let current = &view.snapshot;

        if since.is_empty() {
            return Ok(WatchReply {
                ok: true,
                event: WatchEvent::Snapshot,
                fingerprint: current.fingerprint.clone(),
                changes: None,
                status: Some(current.clone()),
            });
        }
        if since != current.fingerprint {
            debug!(since = %since, current = %current.fingerprint, "Watcher out of sync");
            return Ok(WatchReply {
                ok: true,
                event: WatchEvent::OutOfSync,
                fingerprint: current.fingerprint.clone(),
                changes: None,
                status: Some(current.clone()),
            });
        }

        // 刷新后可能已有更新的发布，先检查再等待
        let mut base_seq = (held.snapshot.fingerprint == since).then_some(held.seq);
        let mut publication = held;
        loop {
            if publication.snapshot.fingerprint != since {
                let changes = match base_seq {
                    Some(seq) if publication.seq == seq + 1 => publication.changes.clone(),
                    _ => diff(current, &publication.snapshot),
                };
                return Ok(WatchReply {
                    ok: true,
                    event: WatchEvent::StatusChanged,
                    fingerprint: publication.snapshot.fingerprint.clone(),
                    changes: Some(changes),
                    status: Some(publication.snapshot.clone()),
                });
            }
            base_seq = Some(publication.seq);

            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => publication = rx.borrow_and_update().clone(),
                Ok(Err(_)) | Err(_) => {
                    return Ok(WatchReply {
                        ok: true,
                        event: WatchEvent::Timeout,
                        fingerprint: since.to_string(),
                        changes: None,
                        status: None,
                    });
                }
            }
        }
    }

    /// 单个代理 watch；pid 不存在时返回 None
    pub async fn wait_for_agent_change(
        self: &Arc<Self>,
        pid: u32,
        since: &str,
        timeout: Duration,
    ) -> Result<Option<AgentWatchReply>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut rx = self.subscribe();
        let view = self.refresh().await?;
        let mut publication = rx.borrow_and_update().clone();

        let Some(held) = view.snapshot.agent(pid).cloned() else {
            return Ok(None);
        };
        let held_fp = agent_fingerprint(&held);

        if since.is_empty() {
            return Ok(Some(AgentWatchReply::with_agent("snapshot", &held)));
        }
        if since != held_fp {
            return Ok(Some(AgentWatchReply::with_agent("out_of_sync", &held)));
        }

        loop {
            match publication.snapshot.agent(pid) {
                None => return Ok(Some(AgentWatchReply::gone(pid))),
                Some(next) if agent_fingerprint(next) != held_fp => {
                    let event = classify_agent_change(&held, next);
                    return Ok(Some(AgentWatchReply::with_agent(event.name(), next)));
                }
                Some(_) => {}
            }

            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => publication = rx.borrow_and_update().clone(),
                Ok(Err(_)) | Err(_) => {
                    return Ok(Some(AgentWatchReply {
                        ok: true,
                        event: "timeout",
                        pid,
                        fingerprint: Some(held_fp),
                        agent: None,
                    }));
                }
            }
        }
    }

    /// 跳转到代理所在终端；外部操作在锁外、阻塞线程上执行
    pub async fn jump(self: &Arc<Self>, pid: u32) -> Result<JumpReply, ProtocolError> {
        let view = self.refresh().await?;
        if view.snapshot.agent(pid).is_none() {
            return Err(ProtocolError::PidNotFound(pid));
        }
        let target = JumpTarget::from_table(&view.table, pid).ok_or(ProtocolError::PidNotFound(pid))?;

        let this = Arc::clone(self);
        tokio::task::spawn_blocking(move || this.jumper.resolve(&target))
            .await
            .map_err(|e| ProtocolError::Internal(e.to_string()))
    }

    /// 代理最新消息：快照中的消息，否则复用器屏幕预览，否则 `waiting on <tty>`
    pub async fn latest(self: &Arc<Self>, pid: u32) -> Result<LatestReply, ProtocolError> {
        let view = self.refresh().await?;
        let row = view
            .snapshot
            .agent(pid)
            .cloned()
            .ok_or(ProtocolError::PidNotFound(pid))?;

        if row.latest_message_full.is_some() {
            return Ok(LatestReply {
                ok: true,
                pid,
                session_file: row.session_file,
                latest_message: row.latest_message,
                latest_message_full: row.latest_message_full,
                latest_message_html: row.latest_message_html,
                latest_message_at: row.latest_message_at,
            });
        }

        let this = Arc::clone(self);
        let (mux, session, tty) = (row.mux, row.mux_session.clone(), row.tty.clone());
        let preview = tokio::task::spawn_blocking(move || this.runtime_preview(pid, mux, session.as_deref(), &tty))
            .await
            .map_err(|e| ProtocolError::Internal(e.to_string()))?;

        Ok(LatestReply {
            ok: true,
            pid,
            session_file: row.session_file,
            latest_message: preview.as_deref().and_then(message_gist),
            latest_message_html: preview.as_deref().and_then(message_html),
            latest_message_full: preview,
            latest_message_at: row.latest_message_at,
        })
    }

    fn runtime_preview(&self, pid: u32, mux: Option<Mux>, session: Option<&str>, tty: &str) -> Option<String> {
        if let Some((at, text)) = self
            .previews
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&pid)
        {
            if at.elapsed() < PREVIEW_TTL {
                return text.clone();
            }
        }

        let text = match (mux, session) {
            (Some(m), Some(s)) if !s.is_empty() => mux::runtime_preview(m, s),
            _ => None,
        }
        .or_else(|| (!tty.is_empty() && tty != NO_TTY).then(|| format!("waiting on {}", tty)));

        self.previews
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pid, (Instant::now(), text.clone()));
        text
    }

    /// 向代理发送一条消息；不会修改进程或活动状态
    pub async fn send(self: &Arc<Self>, pid: u32, message: &str) -> Result<SendReply, ProtocolError> {
        let text = message.trim().to_string();
        if text.is_empty() {
            return Err(ProtocolError::EmptyMessage);
        }

        let view = self.refresh().await?;
        let row = view.snapshot.agent(pid).ok_or(ProtocolError::PidNotFound(pid))?;
        let record = view.telemetry.get(&pid);
        let route = SendRoute {
            pid,
            tty: row.tty.clone(),
            mux: record.and_then(|r| r.routing_mux).or(row.mux),
            mux_session: record
                .and_then(|r| r.routing_mux_session.clone())
                .or_else(|| row.mux_session.clone()),
            pane_target: record.and_then(|r| r.tmux_pane_target.clone()),
            terminal_app: row.terminal_app,
        };

        let this = Arc::clone(self);
        let reply = tokio::task::spawn_blocking(move || this.deliver(&route, &text))
            .await
            .map_err(|e| ProtocolError::Internal(e.to_string()))?;
        info!(pid = pid, delivery = ?reply.delivery, ok = reply.ok, "Send finished");
        Ok(reply)
    }

    /// 投递顺序：zellij、tmux、bridge 收件箱、终端脚本
    fn deliver(&self, route: &SendRoute, text: &str) -> SendReply {
        let session = route.mux_session.as_deref().filter(|s| !s.is_empty());

        if let (Some(Mux::Zellij), Some(s)) = (route.mux, session) {
            match ZellijClient::new(s).send_message(text) {
                Ok(()) => return route.reply(Some("zellij"), None),
                Err(e) => debug!(pid = route.pid, error = %e, "zellij delivery failed"),
            }
        }

        if route.mux == Some(Mux::Tmux) {
            let tmux = TmuxClient::new();
            let pane = route
                .pane_target
                .clone()
                .or_else(|| tmux.pane_target_for_tty(&route.tty));
            if let Some(target) = self.send_tmux(&tmux, pane.as_deref(), session, text) {
                let mut reply = route.reply(Some("tmux"), None);
                reply.tmux_target = Some(target);
                return reply;
            }
        }

        if self.bridge.is_registered(route.pid, now_ms()) {
            let bridge = self.bridge.send(route.pid, text);
            if bridge.delivered {
                let mut reply = route.reply(Some("pi-bridge"), None);
                reply.bridge = Some(bridge);
                return reply;
            }
            // 限流时继续尝试终端投递，其余失败直接返回，避免重复发送
            if !bridge.rate_limited() {
                let mut reply = route.reply(None, bridge.error.clone());
                reply.bridge = Some(bridge);
                return reply;
            }
            debug!(pid = route.pid, "Bridge rate limited, falling back");
        }

        if matches!(route.mux, Some(Mux::Zellij | Mux::Screen)) {
            return route.reply(None, Some("could not deliver message via mux".to_string()));
        }

        if route.tty != NO_TTY && self.backend.write_to_session(&route.tty, text, route.terminal_app) {
            return route.reply(Some("terminal-script"), None);
        }

        route.reply(None, Some("could not deliver message (mux, bridge and terminal script all failed)".to_string()))
    }

    /// 依次尝试 pane、会话、socket 标签；返回成功的目标
    fn send_tmux(&self, tmux: &TmuxClient, pane: Option<&str>, session: Option<&str>, text: &str) -> Option<String> {
        for target in [pane, session].into_iter().flatten() {
            if tmux.send_message(Some(target), text).is_ok() {
                return Some(target.to_string());
            }
        }
        let label = session?;
        TmuxClient::with_socket_label(label)
            .send_message(None, text)
            .ok()
            .map(|_| format!("-L {}", label))
    }
}
