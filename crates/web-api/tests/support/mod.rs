#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use application::repository::memory::{
    MemoryJoinRequestRepository, MemoryMessageRepository, MemoryRoomRepository,
    MemoryUserRepository,
};
use application::{
    ChatGateway, ChatGatewayDependencies, Clock, ContentFilter, ContentFilterConfig,
    DeliveryEngine, PresenceConfig, PresenceTracker, RateLimiterConfig, RoomSequencer,
    SessionIdentityResolver, SystemClock, TokenBucketRateLimiter,
};
use axum::Router;
use domain::UserId;
use futures_util::{SinkExt, StreamExt};
use infrastructure::JwtIdentityVerifier;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use web_api::{router, AppState};

pub const JWT_SECRET: &str = "test-secret-key-that-is-at-least-32-chars";

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestApp {
    pub addr: SocketAddr,
    pub users: Arc<MemoryUserRepository>,
    pub messages: Arc<MemoryMessageRepository>,
    pub verifier: JwtIdentityVerifier,
    pub gateway: Arc<ChatGateway>,
    shutdown: Option<oneshot::Sender<()>>,
}

pub fn build_router() -> (Router, Arc<ChatGateway>, Arc<MemoryUserRepository>, Arc<MemoryMessageRepository>) {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let users = Arc::new(MemoryUserRepository::new());
    let messages = Arc::new(MemoryMessageRepository::new());
    let verifier = Arc::new(JwtIdentityVerifier::new(JWT_SECRET, 0));

    let gateway = Arc::new(ChatGateway::new(ChatGatewayDependencies {
        room_repository: Arc::new(MemoryRoomRepository::new()),
        message_repository: messages.clone(),
        user_repository: users.clone(),
        join_request_repository: Arc::new(MemoryJoinRequestRepository::new()),
        identity: Arc::new(SessionIdentityResolver::new(verifier)),
        delivery: Arc::new(DeliveryEngine::new(clock.clone(), Duration::from_millis(500))),
        presence: Arc::new(PresenceTracker::new(PresenceConfig::default(), clock.clone())),
        rate_limiter: Arc::new(TokenBucketRateLimiter::new(
            RateLimiterConfig {
                capacity: 100,
                refill_per_second: 100.0,
            },
            clock.clone(),
        )),
        content_filter: Arc::new(ContentFilter::new(ContentFilterConfig::default())),
        sequencer: Arc::new(RoomSequencer::new()),
        clock: clock.clone(),
    }));

    let app = router(AppState::new(gateway.clone(), clock));
    (app, gateway, users, messages)
}

impl TestApp {
    pub async fn spawn() -> Self {
        let (app, gateway, users, messages) = build_router();
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        Self {
            addr,
            users,
            messages,
            verifier: JwtIdentityVerifier::new(JWT_SECRET, 0),
            gateway,
            shutdown: Some(shutdown_tx),
        }
    }

    pub fn ws_url(&self, query: &str) -> String {
        format!("ws://{}/api/v1/ws{}", self.addr, query)
    }

    pub fn token_for(&self, user_id: UserId) -> String {
        self.verifier
            .issue_token(user_id, chrono::Duration::minutes(5))
            .expect("issue token")
    }

    /// 注册用户并用 JWT 建立连接
    pub async fn connect(&self, name: &str) -> (UserId, WsClient) {
        let user_id = UserId::random();
        self.users.insert(user_id, name).await;
        let client = self.connect_as(user_id).await;
        (user_id, client)
    }

    pub async fn connect_as(&self, user_id: UserId) -> WsClient {
        let url = self.ws_url(&format!("?token=Bearer%20{}", self.token_for(user_id)));
        let (client, _) = connect_async(url).await.expect("websocket handshake");
        // 等服务端登记完连接
        wait_until(|| self.gateway.delivery().is_connected(user_id)).await;
        client
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

pub async fn send_json(client: &mut WsClient, value: Value) {
    client
        .send(TungsteniteMessage::text(value.to_string()))
        .await
        .expect("send frame");
}

/// 读取下一个指定类型的信封，跳过其他帧
pub async fn next_of(client: &mut WsClient, event_type: &str) -> Value {
    let wait = async {
        loop {
            match client.next().await {
                Some(Ok(TungsteniteMessage::Text(text))) => {
                    let envelope: Value = serde_json::from_str(text.as_str()).expect("envelope json");
                    if envelope["type"] == event_type {
                        return envelope;
                    }
                }
                Some(Ok(_)) => continue,
                other => panic!("connection ended while waiting for {event_type}: {other:?}"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(3), wait)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {event_type}"))
}
