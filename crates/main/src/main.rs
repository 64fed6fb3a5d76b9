//! 实时投递服务入口
//!
//! 加载配置、连接 Postgres 与 Redis、组装实时层并启动 Axum 服务。
//! 收到 Ctrl+C 后停止接受新连接，并以 1001 关闭所有现存连接。

use std::sync::Arc;

use application::{CloseReason, Realtime, RealtimeSettings};
use config::AppConfig;
use infrastructure::{Infrastructure, InfrastructureConfig};
use tracing_subscriber::EnvFilter;
use web_api::{router, AppState, JwtService, OriginPolicy};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::load()?;
    tracing::info!(config = %config.sanitize(), "配置加载完成");

    let infrastructure =
        Infrastructure::connect(InfrastructureConfig::from_app_config(&config)).await?;

    let realtime = Arc::new(Realtime::new(
        infrastructure.realtime_dependencies(),
        RealtimeSettings::from_config(&config.realtime, &config.redis.key_prefix),
    ));
    let jwt_service = Arc::new(JwtService::new(config.jwt.clone()));
    let origin_policy = Arc::new(OriginPolicy::new(&config.server.allowed_origins));
    let state = AppState::new(realtime.clone(), jwt_service, origin_policy);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("实时服务启动在 http://{}", addr);

    let hub = realtime.hub().clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "监听退出信号失败");
            }
            let closed = hub.close_all(CloseReason::ServerShutdown).await;
            tracing::info!(closed, "收到退出信号，已通知所有实时连接关闭");
        })
        .await?;

    tracing::info!("实时服务已停止");
    Ok(())
}
