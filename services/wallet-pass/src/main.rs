//! 服务入口

use std::net::SocketAddr;
use std::sync::Arc;

use secrecy::ExposeSecret;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use cardlink_config::AppConfig;
use cardlink_telemetry::{init_tracing, init_tracing_json};

use wallet_pass::archive::PassArchiveBuilder;
use wallet_pass::callbacks::CallbackAuth;
use wallet_pass::events::{EventSink, PgEventSink, TelemetryRecorder};
use wallet_pass::google::{GoogleProvisioner, RestWalletObjects};
use wallet_pass::member::PgMemberStore;
use wallet_pass::routes;
use wallet_pass::state::AppState;
use wallet_pass::token::CapabilityTokens;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // 加载配置并初始化 tracing
    let config = AppConfig::load("config")?;
    if config.is_production() {
        init_tracing_json(&config.telemetry.log_level);
    } else {
        init_tracing(&config.telemetry.log_level);
    }
    info!(
        app_name = %config.app_name,
        app_env = %config.app_env,
        "Runtime initialized"
    );

    // 连接池的并发上限是唯一的背压机制
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(config.database.url.expose_secret())
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;

    // 组装服务
    let tokens = CapabilityTokens::new(
        &config.tokens.secret,
        config.tokens.device_ttl_minutes,
        config.tokens.email_ttl_days,
    );
    let events: Arc<dyn EventSink> = Arc::new(PgEventSink::new(pool.clone()));
    let recorder = TelemetryRecorder::new(events.clone());
    let objects = Arc::new(RestWalletObjects::new(&config.google_wallet));
    let google = Arc::new(GoogleProvisioner::new(
        config.google_wallet.clone(),
        config.pass_archive.organization_name.clone(),
        objects,
    ));
    let archives = Arc::new(PassArchiveBuilder::new(
        config.pass_archive.clone(),
        &config.callbacks,
    ));
    let callback_auth = CallbackAuth::new(&config.callbacks);

    let state = AppState {
        tokens,
        members: Arc::new(PgMemberStore::new(pool.clone())),
        google,
        archives,
        events,
        recorder,
        callback_auth,
    };
    let app = routes::router(state);

    // 启动服务器
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "Starting wallet-pass service");

    // 携带连接信息，遥测才能在无代理头时拿到对端地址
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

/// 等待关闭信号
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
