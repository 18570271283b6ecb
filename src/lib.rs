//! pi-statusd - 监控本机 pi 代理进程的状态守护进程
//!
//! 周期扫描进程表，合并 telemetry 与会话日志推断每个代理的活动状态，
//! 通过本地 Unix socket 与可选的 HTTP bridge 提供状态、watch、跳转与发送消息。

pub mod activity;
pub mod aggregator;
pub mod bridge;
pub mod client;
pub mod config;
pub mod error;
pub mod jump;
pub mod monitor;
pub mod mux;
pub mod process;
pub mod server;
pub mod session;
pub mod snapshot;
pub mod telemetry;
pub mod terminal_utils;
pub mod throttle;
pub mod transcript;

pub use activity::{ActivityState, Confidence};
pub use aggregator::{ScanView, StateAggregator};
pub use config::{DaemonConfig, HttpConfig, TerminalPreference};
pub use error::ProtocolError;
pub use jump::{FocusBackend, JumpReply, JumpResolver, JumpResult, JumpTarget};
pub use monitor::{Monitor, Publication, WatchEvent, WatchReply};
pub use process::{ProcessRow, ProcessScanner, ProcessSource, ProcessTable, TerminalApp};
pub use snapshot::{AgentRow, ChangeEvent, SnapshotSource, StatusSnapshot};
