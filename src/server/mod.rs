//! 请求服务：本地 Unix socket 行协议与可选的 HTTP bridge

pub mod auth;
pub mod http;
pub mod local;
pub mod protocol;

pub use auth::AuthPolicy;
pub use http::HttpState;
pub use protocol::{dispatch, parse_request, Request};
