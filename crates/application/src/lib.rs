//! 应用层实现。
//!
//! 实时聊天投递的核心组件：会话身份解析、房间序号、幂等检查、下行投递、在线状态、
//! 限流与内容过滤，以及把它们串起来的会话网关。持久化和身份校验通过 trait 抽象，
//! 由基础设施层提供实现。

pub mod clock;
pub mod content_filter;
pub mod delivery;
pub mod error;
pub mod identity;
pub mod idempotency;
pub mod presence;
pub mod rate_limiter;
pub mod repository;
pub mod scheduler;
pub mod sequencer;
pub mod services;

pub use clock::{Clock, ManualClock, SystemClock};
pub use content_filter::{ContentFilter, ContentFilterConfig, SanitizedText, ValidationError};
pub use delivery::{
    BroadcastReport, ConnectionHandle, DeliveryEngine, DeliveryError, Destination, OutboundFrame,
};
pub use error::ApplicationError;
pub use identity::{
    credential_from_query, AuthError, IdentityVerifier, SessionAttributes,
    SessionIdentityResolver,
};
pub use idempotency::{IdempotencyGuard, IdempotencyOutcome, Reservation};
pub use presence::{PresenceConfig, PresenceEntry, PresenceTracker, ProbeReport};
pub use rate_limiter::{RateLimitError, RateLimiterConfig, TokenBucketRateLimiter};
pub use repository::{
    JoinRequestRepository, MessageRepository, RoomRepository, UserProfile, UserRepository,
};
pub use scheduler::PeriodicTask;
pub use sequencer::RoomSequencer;
pub use services::{
    ChatGateway, ChatGatewayDependencies, MaintenanceConfig, MaintenanceTasks, SendOutcome,
};
