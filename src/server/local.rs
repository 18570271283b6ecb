//! 本地 Unix socket：每个连接一行请求、一行 JSON 响应

use anyhow::{bail, Context, Result};
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::protocol::{dispatch, parse_request};
use crate::error::ProtocolError;
use crate::monitor::Monitor;

/// 单行请求上限
pub const MAX_REQUEST_BYTES: usize = 64 * 1024;

/// 绑定 socket：目录 0700、socket 0600；仍有守护进程在监听时报错，残留文件才删除
pub fn bind(socket_path: &Path) -> Result<UnixListener> {
    if let Some(parent) = socket_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create socket directory {}", parent.display()))?;
        let _ = fs::set_permissions(parent, fs::Permissions::from_mode(0o700));
    }
    if socket_path.exists() {
        remove_stale_socket(socket_path)?;
    }

    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("failed to bind {}", socket_path.display()))?;
    fs::set_permissions(socket_path, fs::Permissions::from_mode(0o600))
        .with_context(|| format!("failed to restrict {}", socket_path.display()))?;
    Ok(listener)
}

fn remove_stale_socket(socket_path: &Path) -> Result<()> {
    match StdUnixStream::connect(socket_path) {
        Ok(_) => bail!("pi-statusd already running on {}", socket_path.display()),
        Err(e) if matches!(e.kind(), ErrorKind::ConnectionRefused | ErrorKind::NotFound) => {
            debug!(socket = %socket_path.display(), "Removing stale socket");
            match fs::remove_file(socket_path) {
                Err(e) if e.kind() != ErrorKind::NotFound => Err(e)
                    .with_context(|| format!("failed to remove stale socket {}", socket_path.display())),
                _ => Ok(()),
            }
        }
        Err(e) => Err(e).with_context(|| format!("failed to probe {}", socket_path.display())),
    }
}

/// 接受连接直到收到关闭信号，退出时删除 socket 文件
pub async fn serve(
    listener: UnixListener,
    socket_path: PathBuf,
    monitor: Arc<Monitor>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(socket = %socket_path.display(), "Local socket listening");

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accept = listener.accept() => {
                match accept {
                    Ok((stream, _addr)) => {
                        let monitor = Arc::clone(&monitor);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, monitor).await {
                                debug!(error = %e, "Local connection ended with error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "Local socket accept failed"),
                }
            }
        }
    }

    let _ = fs::remove_file(&socket_path);
    info!(socket = %socket_path.display(), "Local socket stopped");
}

async fn handle_connection(stream: UnixStream, monitor: Arc<Monitor>) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut buf = Vec::new();
    (&mut reader)
        .take(MAX_REQUEST_BYTES as u64 + 1)
        .read_until(b'\n', &mut buf)
        .await?;

    let reply = if buf.len() > MAX_REQUEST_BYTES {
        ProtocolError::BadRequest("request too long".to_string()).to_json()
    } else {
        let line = String::from_utf8_lossy(&buf);
        debug!(request = %line.trim(), "Local request");
        // 读端 EOF 只表示客户端半关闭，仍然等待并回复
        match parse_request(&line) {
            Ok(request) => dispatch(&monitor, request).await,
            Err(e) => e.to_json(),
        }
    };

    let mut payload = serde_json::to_vec(&reply)?;
    payload.push(b'\n');
    if let Err(e) = write_half.write_all(&payload).await {
        if matches!(e.kind(), ErrorKind::BrokenPipe | ErrorKind::ConnectionReset) {
            debug!("Local client disconnected before reply");
            return Ok(());
        }
        return Err(e.into());
    }
    write_half.shutdown().await?;
    Ok(())
}
