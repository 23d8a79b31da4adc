#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static ALLOC: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

pub mod admission;
pub mod config;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod upstream;
pub mod usage;
pub mod util;
pub mod validation;

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cfg = config::Config::load();

    tracing::info!(
        minute_limit = cfg.minute_limit,
        daily_limit = cfg.daily_limit,
        temperature_min = cfg.temperature_min,
        temperature_max = cfg.temperature_max,
        upstream = %cfg.base_url,
        "限流与校验配置已加载"
    );

    let state = Arc::new(gateway::AppState::new(cfg.clone()).context("初始化网关状态失败")?);
    let app = gateway::router(state);

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], cfg.port)));

    tracing::info!("Server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("绑定监听端口失败")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("服务异常退出")?;

    Ok(())
}

fn init_tracing() {
    // DEBUG 只控制请求/响应块日志；结构化日志由 RUST_LOG 决定，
    // 本项目日志至少 info，避免预设的 RUST_LOG=warn 把准入与上游日志过滤掉。
    let env = std::env::var("RUST_LOG").unwrap_or_default();
    let env = env.trim();
    let filter = if env.is_empty() {
        EnvFilter::new("warn,chatgate=info")
    } else if env.contains("chatgate") {
        EnvFilter::new(env)
    } else {
        EnvFilter::new(format!("{env},chatgate=info"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .try_init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("收到退出信号，准备关闭服务...");
}
