//! 主应用程序入口
//!
//! 加载配置、装配核心组件、启动后台维护任务和 Axum 服务，收到 Ctrl-C 后优雅退出。

use std::sync::Arc;
use std::time::Duration;

use application::repository::memory::{
    MemoryJoinRequestRepository, MemoryMessageRepository, MemoryRoomRepository,
    MemoryUserRepository,
};
use application::{
    ChatGateway, ChatGatewayDependencies, Clock, ContentFilter, ContentFilterConfig,
    DeliveryEngine, JoinRequestRepository, MaintenanceConfig, MaintenanceTasks,
    MessageRepository, PresenceConfig, PresenceTracker, RateLimiterConfig, RoomRepository,
    RoomSequencer, SessionIdentityResolver, SystemClock, TokenBucketRateLimiter, UserRepository,
};
use config::AppConfig;
use infrastructure::{Infrastructure, InfrastructureConfig, JwtIdentityVerifier};
use tracing_subscriber::EnvFilter;
use web_api::{router, AppState};

/// 单帧写入连接队列的超时
const DELIVERY_SEND_TIMEOUT: Duration = Duration::from_secs(1);

struct Collaborators {
    users: Arc<dyn UserRepository>,
    rooms: Arc<dyn RoomRepository>,
    messages: Arc<dyn MessageRepository>,
    join_requests: Arc<dyn JoinRequestRepository>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    init_tracing(&config);
    tracing::info!(config = %config.sanitized(), "configuration loaded");

    let collaborators = build_collaborators(&config).await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let verifier = Arc::new(JwtIdentityVerifier::new(
        &config.jwt.secret,
        config.jwt.leeway_seconds,
    ));
    let delivery = Arc::new(DeliveryEngine::new(clock.clone(), DELIVERY_SEND_TIMEOUT));
    let presence = Arc::new(PresenceTracker::new(
        PresenceConfig {
            stale_after: chrono::Duration::from_std(config.presence.stale_after())?,
            online_window: chrono::Duration::from_std(config.presence.online_window())?,
            probe_timeout: config.presence.probe_timeout(),
        },
        clock.clone(),
    ));
    let rate_limiter = Arc::new(TokenBucketRateLimiter::new(
        RateLimiterConfig {
            capacity: config.rate_limit.capacity,
            refill_per_second: config.rate_limit.refill_per_second,
        },
        clock.clone(),
    ));
    let content_filter = Arc::new(ContentFilter::new(ContentFilterConfig {
        max_length: config.content.max_length,
        max_lines: config.content.max_lines,
        max_repeated_chars: config.content.max_repeated_chars,
        banned_terms: config.content.banned_terms.clone(),
        mask_urls: config.content.mask_urls,
        trusted_domains: config.content.trusted_domains.clone(),
        mask_token: config.content.mask_token.clone(),
    }));

    let gateway = Arc::new(ChatGateway::new(ChatGatewayDependencies {
        room_repository: collaborators.rooms,
        message_repository: collaborators.messages,
        user_repository: collaborators.users,
        join_request_repository: collaborators.join_requests,
        identity: Arc::new(SessionIdentityResolver::new(verifier)),
        delivery: delivery.clone(),
        presence: presence.clone(),
        rate_limiter: rate_limiter.clone(),
        content_filter,
        sequencer: Arc::new(RoomSequencer::new()),
        clock: clock.clone(),
    }));

    let maintenance = MaintenanceTasks::start(
        MaintenanceConfig {
            sweep_interval: config.presence.sweep_interval(),
            probe_interval: config.presence.probe_interval(),
            bucket_cleanup_interval: config.rate_limit.cleanup_interval(),
            bucket_idle_eviction: config.rate_limit.idle_eviction(),
        },
        presence,
        delivery,
        rate_limiter,
    );

    let app = router(AppState::new(gateway, clock));
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "chat delivery server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    maintenance.stop().await;
    tracing::info!("chat delivery server stopped");
    Ok(())
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if config.log.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// 配置了数据库时使用 PostgreSQL，否则使用内存存储
async fn build_collaborators(config: &AppConfig) -> anyhow::Result<Collaborators> {
    match &config.database.url {
        Some(database_url) => {
            let infrastructure = Infrastructure::connect(InfrastructureConfig {
                database_url: database_url.clone(),
                max_connections: config.database.max_connections,
            })
            .await?;
            Ok(Collaborators {
                users: infrastructure.user_repository(),
                rooms: infrastructure.room_repository(),
                messages: infrastructure.message_repository(),
                join_requests: infrastructure.join_request_repository(),
            })
        }
        None => {
            tracing::warn!("no database configured, using in-memory storage");
            Ok(Collaborators {
                users: Arc::new(MemoryUserRepository::new()),
                rooms: Arc::new(MemoryRoomRepository::new()),
                messages: Arc::new(MemoryMessageRepository::new()),
                join_requests: Arc::new(MemoryJoinRequestRepository::new()),
            })
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
