//! 基础设施层实现。
//!
//! 提供 JWT 身份校验和 PostgreSQL 持久化协作方，实现应用层定义的接口。

pub mod auth;
pub mod builder;
pub mod migrations;
pub mod repository;

pub use auth::{Claims, JwtIdentityVerifier};
pub use builder::{Infrastructure, InfrastructureConfig, InfrastructureError};
pub use migrations::MIGRATOR;
pub use repository::{
    create_pg_pool, PgChatRoomRepository, PgJoinRequestRepository, PgMessageRepository,
    PgStorage, PgUserRepository,
};
