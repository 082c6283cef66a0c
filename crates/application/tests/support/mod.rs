#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use application::repository::memory::{
    MemoryJoinRequestRepository, MemoryMessageRepository, MemoryRoomRepository,
    MemoryUserRepository,
};
use application::{
    AuthError, ChatGateway, ChatGatewayDependencies, ContentFilter, ContentFilterConfig,
    DeliveryEngine, IdentityVerifier, ManualClock, MessageRepository, OutboundFrame,
    PresenceConfig,
    PresenceTracker, RateLimiterConfig, RoomSequencer, SessionIdentityResolver,
    TokenBucketRateLimiter,
};
use domain::{ConnectionId, EventType, UserId};
use tokio::sync::mpsc;
use uuid::Uuid;

/// 凭证就是 `token-<uuid>`
pub struct StaticVerifier;

impl IdentityVerifier for StaticVerifier {
    fn verify_token(&self, token: &str) -> Result<UserId, AuthError> {
        token
            .strip_prefix("token-")
            .and_then(|raw| raw.parse::<Uuid>().ok())
            .map(UserId::from)
            .ok_or_else(|| AuthError::InvalidCredential("unknown token".into()))
    }
}

pub struct Repositories {
    pub users: Arc<MemoryUserRepository>,
    pub rooms: Arc<MemoryRoomRepository>,
    pub messages: Arc<MemoryMessageRepository>,
    pub join_requests: Arc<MemoryJoinRequestRepository>,
}

impl Repositories {
    pub fn new() -> Self {
        Self {
            users: Arc::new(MemoryUserRepository::new()),
            rooms: Arc::new(MemoryRoomRepository::new()),
            messages: Arc::new(MemoryMessageRepository::new()),
            join_requests: Arc::new(MemoryJoinRequestRepository::new()),
        }
    }

    pub fn share(&self) -> Self {
        Self {
            users: self.users.clone(),
            rooms: self.rooms.clone(),
            messages: self.messages.clone(),
            join_requests: self.join_requests.clone(),
        }
    }
}

pub struct Harness {
    pub gateway: Arc<ChatGateway>,
    pub repos: Repositories,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(Repositories::new(), RateLimiterConfig { capacity: 1000, refill_per_second: 1000.0 })
    }

    pub fn with_rate_limit(rate_limit: RateLimiterConfig) -> Self {
        Self::with(Repositories::new(), rate_limit)
    }

    pub fn with(repos: Repositories, rate_limit: RateLimiterConfig) -> Self {
        let messages = repos.messages.clone();
        Self::build(repos, messages, rate_limit)
    }

    /// 网关使用指定的消息存储，`repos.messages` 只供测试直接读写
    pub fn with_message_repository(
        repos: Repositories,
        message_repository: Arc<dyn MessageRepository>,
    ) -> Self {
        Self::build(
            repos,
            message_repository,
            RateLimiterConfig { capacity: 1000, refill_per_second: 1000.0 },
        )
    }

    fn build(
        repos: Repositories,
        message_repository: Arc<dyn MessageRepository>,
        rate_limit: RateLimiterConfig,
    ) -> Self {
        let clock = Arc::new(ManualClock::default());
        let deps = ChatGatewayDependencies {
            room_repository: repos.rooms.clone(),
            message_repository,
            user_repository: repos.users.clone(),
            join_request_repository: repos.join_requests.clone(),
            identity: Arc::new(SessionIdentityResolver::new(Arc::new(StaticVerifier))),
            delivery: Arc::new(DeliveryEngine::new(clock.clone(), Duration::from_millis(200))),
            presence: Arc::new(PresenceTracker::new(PresenceConfig::default(), clock.clone())),
            rate_limiter: Arc::new(TokenBucketRateLimiter::new(rate_limit, clock.clone())),
            content_filter: Arc::new(ContentFilter::new(ContentFilterConfig::default())),
            sequencer: Arc::new(RoomSequencer::new()),
            clock: clock.clone(),
        };
        Self {
            gateway: Arc::new(ChatGateway::new(deps)),
            repos,
            clock,
        }
    }

    /// 注册用户并建立会话
    pub async fn connect(&self, name: &str) -> Client {
        let user_id = UserId::random();
        self.repos.users.insert(user_id, name).await;
        self.reconnect(user_id)
    }

    pub fn reconnect(&self, user_id: UserId) -> Client {
        let connection_id = ConnectionId::random();
        let frames = self.gateway.open_session(user_id, connection_id);
        Client {
            user_id,
            connection_id,
            frames,
        }
    }
}

pub struct Client {
    pub user_id: UserId,
    pub connection_id: ConnectionId,
    pub frames: mpsc::Receiver<OutboundFrame>,
}

impl Client {
    /// 等待下一个指定类型的帧，跳过其他类型
    pub async fn next_of(&mut self, event_type: EventType) -> OutboundFrame {
        let wait = async {
            loop {
                match self.frames.recv().await {
                    Some(frame) if frame.envelope.event_type == event_type => return frame,
                    Some(_) => continue,
                    None => panic!("connection queue closed while waiting for {event_type:?}"),
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(2), wait)
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {event_type:?}"))
    }

    /// 取出当前已排队的所有帧
    pub fn drain(&mut self) -> Vec<OutboundFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.frames.try_recv() {
            frames.push(frame);
        }
        frames
    }

    pub fn drain_of(&mut self, event_type: EventType) -> Vec<OutboundFrame> {
        self.drain()
            .into_iter()
            .filter(|frame| frame.envelope.event_type == event_type)
            .collect()
    }
}
