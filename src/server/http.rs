//! HTTP bridge：只读状态、watch（长轮询 / SSE）与发送消息
//!
//! `jump` 和 `latest` 不在网络接口上暴露，窗口自动化只能由本地 socket 触发。

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{ConnectInfo, DefaultBodyLimit, Path, Query, Request, State},
    http::{header, HeaderMap},
    middleware::{self, Next},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::stream;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::auth::AuthPolicy;
use super::protocol::{parse_pid, pong};
use crate::config::HttpConfig;
use crate::error::ProtocolError;
use crate::monitor::{clamp_watch_timeout, AgentWatchReply, Monitor, MAX_WATCH_TIMEOUT_MS};
use crate::throttle::SendThrottle;

pub const API_VERSION: u32 = 3;
/// `/send` 请求体上限
pub const MAX_SEND_BODY_BYTES: usize = 100_000;
/// 折叠空白后的消息长度上限
pub const MAX_SEND_MESSAGE_CHARS: usize = 4_000;
/// SSE keep-alive 注释间隔
pub const SSE_KEEPALIVE: Duration = Duration::from_secs(15);

/// 限流表超过这个来源数时清理
const THROTTLE_PRUNE_THRESHOLD: usize = 1024;

/// HTTP 共享状态
pub struct HttpState {
    pub monitor: Arc<Monitor>,
    auth: AuthPolicy,
    throttle: Mutex<SendThrottle>,
}

impl HttpState {
    pub fn new(monitor: Arc<Monitor>, config: &HttpConfig) -> Self {
        Self {
            monitor,
            auth: AuthPolicy::from_config(config),
            throttle: Mutex::new(SendThrottle::new(config.send_rate_per_10s)),
        }
    }

    /// 未被信任的来源计入发送限流
    fn allow_send(&self, ip: IpAddr) -> bool {
        if self.auth.trusts(ip) {
            return true;
        }
        let mut throttle = self.throttle.lock().unwrap_or_else(PoisonError::into_inner);
        if throttle.tracked_sources() > THROTTLE_PRUNE_THRESHOLD {
            throttle.prune(Instant::now());
        }
        throttle.check(ip)
    }
}

/// 构建路由
pub fn router(state: Arc<HttpState>) -> Router {
    let protected = Router::new()
        .route("/status", get(status_handler))
        .route("/watch", get(watch_handler))
        .route("/watch/:pid", get(agent_watch_handler))
        .route(
            "/send",
            post(send_handler).layer(DefaultBodyLimit::max(MAX_SEND_BODY_BYTES)),
        )
        .route_layer(middleware::from_fn_with_state(Arc::clone(&state), require_auth));

    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(|| async { Json(pong()) }))
        .merge(protected)
        .fallback(|| async { ProtocolError::NotFound })
        .with_state(state)
}

/// 服务 HTTP bridge，直到关闭信号
pub async fn serve(
    listener: TcpListener,
    state: Arc<HttpState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let addr = listener.local_addr()?;
    if !state.auth.has_token() {
        warn!(addr = %addr, "HTTP bridge has no token; only trusted loopback callers can use it");
    }
    info!(addr = %addr, "HTTP bridge listening");

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
    })
    .await?;

    info!(addr = %addr, "HTTP bridge stopped");
    Ok(())
}

async fn require_auth(
    State(state): State<Arc<HttpState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    if let Err(e) = state.auth.check(addr.ip(), request.headers()) {
        debug!(peer = %addr, path = %request.uri().path(), code = e.code(), "HTTP request rejected");
        return e.into_response();
    }
    next.run(request).await
}

async fn root_handler() -> Json<Value> {
    Json(json!({"ok": true, "service": "pi-statusd-http", "api_version": API_VERSION}))
}

async fn status_handler(State(state): State<Arc<HttpState>>) -> Response {
    match state.monitor.refresh().await {
        Ok(view) => Json(view.snapshot.clone()).into_response(),
        Err(e) => ProtocolError::from(e).into_response(),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct WatchQuery {
    timeout_ms: Option<String>,
    fingerprint: Option<String>,
}

impl WatchQuery {
    fn timeout(&self) -> Duration {
        clamp_watch_timeout(self.timeout_ms.as_deref().and_then(|t| t.trim().parse().ok()))
    }

    fn fingerprint(&self) -> &str {
        self.fingerprint.as_deref().map(str::trim).unwrap_or_default()
    }
}

async fn watch_handler(State(state): State<Arc<HttpState>>, Query(query): Query<WatchQuery>) -> Response {
    match state
        .monitor
        .wait_for_change(query.fingerprint(), query.timeout())
        .await
    {
        Ok(reply) => Json(reply).into_response(),
        Err(e) => ProtocolError::from(e).into_response(),
    }
}

fn wants_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("text/event-stream"))
}

async fn agent_watch_handler(
    State(state): State<Arc<HttpState>>,
    Path(raw_pid): Path<String>,
    Query(query): Query<WatchQuery>,
    headers: HeaderMap,
) -> Response {
    let pid = match parse_pid(&raw_pid) {
        Ok(pid) => pid,
        Err(e) => return e.into_response(),
    };

    if wants_event_stream(&headers) {
        return agent_event_stream(state, pid, &headers).await;
    }

    match state
        .monitor
        .wait_for_agent_change(pid, query.fingerprint(), query.timeout())
        .await
    {
        Ok(Some(reply)) => Json(reply).into_response(),
        Ok(None) => ProtocolError::PidNotFound(pid).into_response(),
        Err(e) => ProtocolError::from(e).into_response(),
    }
}

/// SSE 游标：上一次发出的代理指纹
struct AgentCursor {
    monitor: Arc<Monitor>,
    pid: u32,
    since: String,
    done: bool,
}

/// 从 `Last-Event-ID` 取出指纹；pid 不一致时原样保留，必然触发 out_of_sync
fn resume_fingerprint(pid: u32, last_event_id: Option<&str>) -> String {
    let Some(id) = last_event_id.map(str::trim).filter(|id| !id.is_empty()) else {
        return String::new();
    };
    id.strip_prefix(&format!("{}:", pid)).unwrap_or(id).to_string()
}

fn agent_event(pid: u32, reply: &AgentWatchReply) -> Event {
    let id = match reply.fingerprint.as_deref() {
        Some(fp) => format!("{}:{}", pid, fp),
        None => format!("{}:gone", pid),
    };
    Event::default()
        .id(id)
        .event(reply.event)
        .data(serde_json::to_string(reply).unwrap_or_else(|_| "{}".to_string()))
}

async fn next_agent_event(mut cursor: AgentCursor) -> Option<(Result<Event, Infallible>, AgentCursor)> {
    if cursor.done {
        return None;
    }
    let timeout = Duration::from_millis(MAX_WATCH_TIMEOUT_MS);

    loop {
        let outcome = cursor
            .monitor
            .wait_for_agent_change(cursor.pid, &cursor.since, timeout)
            .await;

        let reply = match outcome {
            // 超时不产生事件，keep-alive 负责保持连接
            Ok(Some(reply)) if reply.event == "timeout" => continue,
            Ok(Some(reply)) => reply,
            Ok(None) => AgentWatchReply::gone(cursor.pid),
            Err(e) => {
                warn!(pid = cursor.pid, error = %e, "Agent event stream failed");
                cursor.done = true;
                let event = Event::default()
                    .id(format!("{}:error", cursor.pid))
                    .event("error")
                    .data(ProtocolError::from(e).to_json().to_string());
                return Some((Ok(event), cursor));
            }
        };

        match reply.fingerprint.as_deref() {
            Some(fp) => cursor.since = fp.to_string(),
            None => cursor.done = true,
        }
        let event = agent_event(cursor.pid, &reply);
        return Some((Ok(event), cursor));
    }
}

async fn agent_event_stream(state: Arc<HttpState>, pid: u32, headers: &HeaderMap) -> Response {
    match state.monitor.refresh().await {
        Ok(view) if view.snapshot.agent(pid).is_some() => {}
        Ok(_) => return ProtocolError::PidNotFound(pid).into_response(),
        Err(e) => return ProtocolError::from(e).into_response(),
    }

    let last_event_id = headers.get("last-event-id").and_then(|v| v.to_str().ok());
    let cursor = AgentCursor {
        monitor: Arc::clone(&state.monitor),
        pid,
        since: resume_fingerprint(pid, last_event_id),
        done: false,
    };
    debug!(pid = pid, resume = !cursor.since.is_empty(), "Agent event stream opened");

    Sse::new(stream::unfold(cursor, next_agent_event))
        .keep_alive(KeepAlive::new().interval(SSE_KEEPALIVE))
        .into_response()
}

/// 校验 `/send` 请求体，返回 pid 与折叠空白后的消息
pub fn parse_send_body(body: &[u8]) -> Result<(u32, String), ProtocolError> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;

    let pid = match value.get("pid") {
        Some(Value::Number(n)) => n
            .as_u64()
            .filter(|p| *p > 0)
            .and_then(|p| u32::try_from(p).ok())
            .ok_or_else(|| ProtocolError::InvalidPid(n.to_string()))?,
        Some(Value::String(s)) => parse_pid(s)?,
        Some(other) => return Err(ProtocolError::InvalidPid(other.to_string())),
        None => return Err(ProtocolError::BadRequest("missing pid".to_string())),
    };

    let Some(raw) = value.get("message").and_then(Value::as_str) else {
        return Err(ProtocolError::BadRequest("message must be a string".to_string()));
    };
    let message = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if message.is_empty() {
        return Err(ProtocolError::EmptyMessage);
    }
    if message.chars().count() > MAX_SEND_MESSAGE_CHARS {
        return Err(ProtocolError::MessageTooLong(MAX_SEND_MESSAGE_CHARS));
    }
    Ok((pid, message))
}

async fn send_handler(
    State(state): State<Arc<HttpState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> Response {
    // 先校验请求体，格式错误的请求不占用限流额度
    let (pid, message) = match parse_send_body(&body) {
        Ok(parsed) => parsed,
        Err(e) => return e.into_response(),
    };

    if !state.allow_send(addr.ip()) {
        info!(peer = %addr, "Send rate limit exceeded");
        return ProtocolError::RateLimited.into_response();
    }

    match state.monitor.send(pid, &message).await {
        Ok(reply) => {
            info!(peer = %addr, pid = pid, ok = reply.ok, delivery = ?reply.delivery, "HTTP send");
            Json(reply).into_response()
        }
        Err(e) => e.into_response(),
    }
}
