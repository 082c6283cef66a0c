use std::collections::BTreeSet;
use std::sync::Arc;

use application::{
    JoinRequestRepository, MessageRepository, RoomRepository, UserProfile, UserRepository,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{
    ChatRoom, IdempotencyKey, JoinRequest, JoinRequestId, Message, MessageId, RepositoryError,
    RoomId, SequenceNumber, UserId,
};
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool};
use uuid::Uuid;

/// PostgreSQL 唯一约束冲突
const UNIQUE_VIOLATION: &str = "23505";

fn map_sqlx_err(err: sqlx::Error) -> RepositoryError {
    match &err {
        sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) => {
            RepositoryError::Conflict
        }
        _ => RepositoryError::storage(err.to_string()),
    }
}

fn invalid_data(message: impl Into<String>) -> RepositoryError {
    RepositoryError::storage(message)
}

#[derive(Debug, FromRow)]
struct UserRecord {
    id: Uuid,
    display_name: String,
}

impl From<UserRecord> for UserProfile {
    fn from(value: UserRecord) -> Self {
        UserProfile {
            id: UserId::from(value.id),
            display_name: value.display_name,
        }
    }
}

#[derive(Debug, FromRow)]
struct RoomRecord {
    id: Uuid,
    name: String,
    owner_id: Uuid,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl RoomRecord {
    fn into_room(self, members: Vec<Uuid>) -> Result<ChatRoom, RepositoryError> {
        let members: BTreeSet<UserId> = members.into_iter().map(UserId::from).collect();
        ChatRoom::restore(
            RoomId::from(self.id),
            self.name,
            UserId::from(self.owner_id),
            members,
            self.created_at,
            self.updated_at,
        )
        .map_err(|err| invalid_data(err.to_string()))
    }
}

#[derive(Debug, FromRow)]
struct MessageRecord {
    id: Uuid,
    room_id: Uuid,
    sender_id: Uuid,
    content: String,
    sequence: i64,
    idempotency_key: Option<String>,
    sent_at: DateTime<Utc>,
}

impl TryFrom<MessageRecord> for Message {
    type Error = RepositoryError;

    fn try_from(value: MessageRecord) -> Result<Self, Self::Error> {
        let sequence = u64::try_from(value.sequence)
            .map_err(|_| invalid_data(format!("negative sequence {}", value.sequence)))?;
        let idempotency_key = IdempotencyKey::parse_optional(value.idempotency_key.as_deref())
            .map_err(|err| invalid_data(err.to_string()))?;

        Ok(Message {
            id: MessageId::from(value.id),
            room_id: RoomId::from(value.room_id),
            sender_id: UserId::from(value.sender_id),
            content: value.content,
            sequence: SequenceNumber(sequence),
            idempotency_key,
            sent_at: value.sent_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct JoinRequestRecord {
    id: Uuid,
    room_id: Uuid,
    requester_id: Uuid,
    created_at: DateTime<Utc>,
}

impl From<JoinRequestRecord> for JoinRequest {
    fn from(value: JoinRequestRecord) -> Self {
        JoinRequest {
            id: JoinRequestId::from(value.id),
            room_id: RoomId::from(value.room_id),
            requester_id: UserId::from(value.requester_id),
            created_at: value.created_at,
        }
    }
}

#[derive(Clone)]
pub struct PgUserRepository {
    pool: PgPool,
}

impl PgUserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 写入或更新资料（资料服务同步用）
    pub async fn upsert(&self, profile: &UserProfile) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO users (id, display_name) VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET display_name = EXCLUDED.display_name
            "#,
        )
        .bind(Uuid::from(profile.id))
        .bind(&profile.display_name)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }
}

#[async_trait]
impl UserRepository for PgUserRepository {
    async fn load_user(&self, id: UserId) -> Result<Option<UserProfile>, RepositoryError> {
        let record = sqlx::query_as::<_, UserRecord>(
            r#"SELECT id, display_name FROM users WHERE id = $1"#,
        )
        .bind(Uuid::from(id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(record.map(UserProfile::from))
    }
}

#[derive(Clone)]
pub struct PgChatRoomRepository {
    pool: PgPool,
}

impl PgChatRoomRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn member_ids(room: &ChatRoom) -> Vec<Uuid> {
        room.members().iter().copied().map(Uuid::from).collect()
    }
}

#[async_trait]
impl RoomRepository for PgChatRoomRepository {
    async fn create(&self, room: ChatRoom) -> Result<ChatRoom, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        sqlx::query(
            r#"
            INSERT INTO chat_rooms (id, name, owner_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::from(room.id))
        .bind(&room.name)
        .bind(Uuid::from(room.owner_id))
        .bind(room.created_at)
        .bind(room.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        sqlx::query(
            r#"
            INSERT INTO chat_room_members (room_id, user_id, joined_at)
            SELECT $1, member_id, $3 FROM UNNEST($2::uuid[]) AS member_id
            "#,
        )
        .bind(Uuid::from(room.id))
        .bind(Self::member_ids(&room))
        .bind(room.created_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        tx.commit().await.map_err(map_sqlx_err)?;
        Ok(room)
    }

    async fn load_room(&self, id: RoomId) -> Result<Option<ChatRoom>, RepositoryError> {
        let Some(record) = sqlx::query_as::<_, RoomRecord>(
            r#"SELECT id, name, owner_id, created_at, updated_at FROM chat_rooms WHERE id = $1"#,
        )
        .bind(Uuid::from(id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?
        else {
            return Ok(None);
        };

        let members: Vec<Uuid> = sqlx::query_scalar(
            r#"SELECT user_id FROM chat_room_members WHERE room_id = $1"#,
        )
        .bind(Uuid::from(id))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.into_room(members).map(Some)
    }

    async fn replace_members(&self, room: &ChatRoom) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        let updated = sqlx::query(r#"UPDATE chat_rooms SET updated_at = $2 WHERE id = $1"#)
            .bind(Uuid::from(room.id))
            .bind(room.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;
        if updated.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }

        let members = Self::member_ids(room);
        sqlx::query(
            r#"DELETE FROM chat_room_members WHERE room_id = $1 AND NOT (user_id = ANY($2::uuid[]))"#,
        )
        .bind(Uuid::from(room.id))
        .bind(&members)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        sqlx::query(
            r#"
            INSERT INTO chat_room_members (room_id, user_id, joined_at)
            SELECT $1, member_id, $3 FROM UNNEST($2::uuid[]) AS member_id
            ON CONFLICT (room_id, user_id) DO NOTHING
            "#,
        )
        .bind(Uuid::from(room.id))
        .bind(&members)
        .bind(room.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        tx.commit().await.map_err(map_sqlx_err)?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct PgMessageRepository {
    pool: PgPool,
}

impl PgMessageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageRepository for PgMessageRepository {
    async fn save_message(&self, message: &Message) -> Result<MessageId, RepositoryError> {
        let sequence = i64::try_from(message.sequence.value())
            .map_err(|_| invalid_data(format!("sequence {} out of range", message.sequence)))?;

        sqlx::query(
            r#"
            INSERT INTO chat_messages (id, room_id, sender_id, content, sequence, idempotency_key, sent_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(Uuid::from(message.id))
        .bind(Uuid::from(message.room_id))
        .bind(Uuid::from(message.sender_id))
        .bind(&message.content)
        .bind(sequence)
        .bind(message.idempotency_key.as_ref().map(|key| key.as_str()))
        .bind(message.sent_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(message.id)
    }

    async fn find_by_room_and_idempotency_key(
        &self,
        room_id: RoomId,
        key: &IdempotencyKey,
    ) -> Result<Option<Message>, RepositoryError> {
        let record = sqlx::query_as::<_, MessageRecord>(
            r#"
            SELECT id, room_id, sender_id, content, sequence, idempotency_key, sent_at
            FROM chat_messages
            WHERE room_id = $1 AND idempotency_key = $2
            "#,
        )
        .bind(Uuid::from(room_id))
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.map(Message::try_from).transpose()
    }

    async fn max_sequence(&self, room_id: RoomId) -> Result<u64, RepositoryError> {
        let max: i64 = sqlx::query_scalar(
            r#"SELECT COALESCE(MAX(sequence), 0) FROM chat_messages WHERE room_id = $1"#,
        )
        .bind(Uuid::from(room_id))
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        u64::try_from(max).map_err(|_| invalid_data(format!("negative sequence {max}")))
    }
}

#[derive(Clone)]
pub struct PgJoinRequestRepository {
    pool: PgPool,
}

impl PgJoinRequestRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JoinRequestRepository for PgJoinRequestRepository {
    async fn create(&self, request: JoinRequest) -> Result<JoinRequest, RepositoryError> {
        let record = sqlx::query_as::<_, JoinRequestRecord>(
            r#"
            INSERT INTO chat_join_requests (id, room_id, requester_id, created_at)
            VALUES ($1, $2, $3, $4)
            RETURNING id, room_id, requester_id, created_at
            "#,
        )
        .bind(Uuid::from(request.id))
        .bind(Uuid::from(request.room_id))
        .bind(Uuid::from(request.requester_id))
        .bind(request.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(JoinRequest::from(record))
    }

    async fn find(&self, id: JoinRequestId) -> Result<Option<JoinRequest>, RepositoryError> {
        let record = sqlx::query_as::<_, JoinRequestRecord>(
            r#"SELECT id, room_id, requester_id, created_at FROM chat_join_requests WHERE id = $1"#,
        )
        .bind(Uuid::from(id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(record.map(JoinRequest::from))
    }

    async fn remove(&self, id: JoinRequestId) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM chat_join_requests WHERE id = $1")
            .bind(Uuid::from(id))
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct PgStorage {
    pub pool: PgPool,
    pub user_repository: Arc<PgUserRepository>,
    pub room_repository: Arc<PgChatRoomRepository>,
    pub message_repository: Arc<PgMessageRepository>,
    pub join_request_repository: Arc<PgJoinRequestRepository>,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self {
            user_repository: Arc::new(PgUserRepository::new(pool.clone())),
            room_repository: Arc::new(PgChatRoomRepository::new(pool.clone())),
            message_repository: Arc::new(PgMessageRepository::new(pool.clone())),
            join_request_repository: Arc::new(PgJoinRequestRepository::new(pool.clone())),
            pool,
        }
    }
}

pub async fn create_pg_pool(
    database_url: &str,
    max_connections: u32,
) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}
