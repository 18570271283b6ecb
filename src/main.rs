//! pi-statusd CLI
//!
//! 运行状态守护进程，或向正在运行的守护进程发送一行请求

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pi_statusd::{
    client,
    config::{load_terminal_preference, DaemonConfig, HttpConfig},
    jump::platform_backend,
    monitor::{now_ms, Monitor},
    server::{http, local, HttpState},
    ProcessScanner, ProcessSource, StateAggregator,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// 收到关闭信号后等待监听任务退出的时间
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

#[derive(Parser)]
#[command(name = "pi-statusd")]
#[command(about = "pi-statusd - 监控本机 pi 代理进程的状态守护进程")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 运行守护进程
    Serve {
        /// 扫描间隔（毫秒）
        #[arg(long)]
        interval_ms: Option<u64>,
        /// 本地 socket 路径
        #[arg(long)]
        socket: Option<PathBuf>,
        /// 启用 HTTP bridge
        #[arg(long)]
        http: bool,
        /// HTTP 监听地址（覆盖配置文件）
        #[arg(long)]
        http_host: Option<String>,
        /// HTTP 监听端口（覆盖配置文件）
        #[arg(long)]
        http_port: Option<u16>,
        /// 代理进程名
        #[arg(long)]
        process_name: Option<String>,
        /// 输出调试日志
        #[arg(long, short)]
        verbose: bool,
    },
    /// 扫描一次并输出 JSON
    Once {
        /// 代理进程名
        #[arg(long)]
        process_name: Option<String>,
    },
    /// 向运行中的守护进程发送一行请求
    Request {
        /// 本地 socket 路径
        #[arg(long)]
        socket: Option<PathBuf>,
        /// 请求内容，例如 `status`、`jump 1234`、`watch 20000 <fingerprint>`
        #[arg(required = true, trailing_var_arg = true)]
        line: Vec<String>,
    },
}

fn init_logging(verbose: bool) {
    // RUST_LOG 优先；例如 RUST_LOG=pi_statusd=trace pi-statusd serve
    let default = if verbose {
        "pi_statusd=debug,pi-statusd=debug"
    } else {
        "pi_statusd=info,pi-statusd=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            interval_ms,
            socket,
            http,
            http_host,
            http_port,
            process_name,
            verbose,
        } => {
            init_logging(verbose);

            let mut config = DaemonConfig::from_env();
            if let Some(ms) = interval_ms {
                config.scan_interval = Duration::from_millis(ms.max(100));
            }
            if let Some(path) = socket {
                config.socket_path = path;
            }
            if let Some(name) = process_name {
                config.process_name = name;
            }

            let http_config = http.then(|| {
                let mut http_config = HttpConfig::load(&config.http_config_path());
                if let Some(host) = http_host {
                    http_config.host = host;
                }
                if let Some(port) = http_port {
                    http_config.port = port;
                }
                http_config
            });

            run_daemon(config, http_config).await?;
        }
        Commands::Once { process_name } => {
            init_logging(false);

            let mut config = DaemonConfig::from_env();
            if let Some(name) = process_name {
                config.process_name = name;
            }
            let view = tokio::task::spawn_blocking(move || {
                let source: Box<dyn ProcessSource> = Box::new(ProcessScanner::new());
                StateAggregator::new(&config, source).scan(now_ms())
            })
            .await
            .context("scan task failed")?;
            println!("{}", serde_json::to_string_pretty(&view.snapshot)?);
        }
        Commands::Request { socket, line } => {
            init_logging(false);

            let socket = socket.unwrap_or_else(|| DaemonConfig::from_env().socket_path);
            let reply = client::request(&socket, &line.join(" ")).await?;
            println!("{}", serde_json::to_string_pretty(&reply)?);
        }
    }

    Ok(())
}

async fn run_daemon(config: DaemonConfig, http_config: Option<HttpConfig>) -> Result<()> {
    let preference = load_terminal_preference(&config.terminal_config_path());
    let backend = platform_backend(preference);
    let monitor = Arc::new(Monitor::new(&config, Box::new(ProcessScanner::new()), backend));

    // 监听失败时立即退出
    let listener = local::bind(&config.socket_path)?;
    let tcp = match &http_config {
        Some(http_config) => {
            let addr = format!("{}:{}", http_config.host, http_config.port);
            let tcp = tokio::net::TcpListener::bind(&addr)
                .await
                .with_context(|| format!("failed to bind HTTP bridge on {}", addr))?;
            Some(tcp)
        }
        None => None,
    };

    info!(
        socket = %config.socket_path.display(),
        process_name = %config.process_name,
        interval_ms = config.scan_interval.as_millis() as u64,
        http = tcp.is_some(),
        "pi-statusd starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scan_task = tokio::spawn(Arc::clone(&monitor).run_scan_loop(config.scan_interval));
    let mut tasks = vec![tokio::spawn(local::serve(
        listener,
        config.socket_path.clone(),
        Arc::clone(&monitor),
        shutdown_rx.clone(),
    ))];

    if let (Some(tcp), Some(http_config)) = (tcp, http_config.as_ref()) {
        let state = Arc::new(HttpState::new(Arc::clone(&monitor), http_config));
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = http::serve(tcp, state, shutdown).await {
                error!(error = %e, "HTTP bridge failed");
            }
        }));
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    let _ = shutdown_tx.send(true);
    scan_task.abort();
    for task in tasks {
        let abort = task.abort_handle();
        if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
            warn!("Listener did not stop in time; aborting");
            abort.abort();
        }
    }

    // 被中止的本地监听不会自行清理 socket
    let _ = std::fs::remove_file(&config.socket_path);
    info!("pi-statusd stopped");
    Ok(())
}
