//! 本地 socket 客户端

use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

/// 发送一行请求并读取 JSON 响应
///
/// 写入后不关闭写端：服务端把读端 EOF 视为 watch 客户端断开。
pub async fn request(socket_path: &Path, line: &str) -> Result<Value> {
    let mut stream = UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("failed to connect to {}", socket_path.display()))?;

    let mut payload = line.trim_end_matches('\n').as_bytes().to_vec();
    payload.push(b'\n');
    stream.write_all(&payload).await?;

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;
    if buf.is_empty() {
        bail!("daemon closed the connection without a reply");
    }
    serde_json::from_slice(&buf).context("daemon reply is not valid JSON")
}
