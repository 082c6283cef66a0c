//! 外部持久化协作方
//!
//! 核心只通过这几个简单的读写接口访问存储。`memory` 子模块给测试和无数据库的
//! 部署使用。

use async_trait::async_trait;
use domain::{
    ChatRoom, IdempotencyKey, JoinRequest, JoinRequestId, Message, MessageId, RepositoryError,
    RoomId, UserId,
};
use serde::{Deserialize, Serialize};

/// 资料服务返回的只读用户信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub display_name: String,
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn load_user(&self, id: UserId) -> Result<Option<UserProfile>, RepositoryError>;
}

#[async_trait]
pub trait RoomRepository: Send + Sync {
    async fn create(&self, room: ChatRoom) -> Result<ChatRoom, RepositoryError>;
    async fn load_room(&self, id: RoomId) -> Result<Option<ChatRoom>, RepositoryError>;
    /// 用 `room` 的成员集合整体替换存储中的成员集合
    async fn replace_members(&self, room: &ChatRoom) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// 保存消息。`(room_id, idempotency_key)` 冲突时返回 `RepositoryError::Conflict`。
    async fn save_message(&self, message: &Message) -> Result<MessageId, RepositoryError>;

    async fn find_by_room_and_idempotency_key(
        &self,
        room_id: RoomId,
        key: &IdempotencyKey,
    ) -> Result<Option<Message>, RepositoryError>;

    /// 房间内已分配的最大序号，没有消息时为 0
    async fn max_sequence(&self, room_id: RoomId) -> Result<u64, RepositoryError>;
}

#[async_trait]
pub trait JoinRequestRepository: Send + Sync {
    async fn create(&self, request: JoinRequest) -> Result<JoinRequest, RepositoryError>;
    async fn find(&self, id: JoinRequestId) -> Result<Option<JoinRequest>, RepositoryError>;
    async fn remove(&self, id: JoinRequestId) -> Result<(), RepositoryError>;
}

/// 内存实现的协作方（用于测试和单机部署）
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::RwLock;

    #[derive(Default)]
    pub struct MemoryUserRepository {
        users: RwLock<HashMap<UserId, UserProfile>>,
    }

    impl MemoryUserRepository {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn insert(&self, id: UserId, display_name: impl Into<String>) {
            let profile = UserProfile {
                id,
                display_name: display_name.into(),
            };
            self.users.write().await.insert(id, profile);
        }
    }

    #[async_trait]
    impl UserRepository for MemoryUserRepository {
        async fn load_user(&self, id: UserId) -> Result<Option<UserProfile>, RepositoryError> {
            Ok(self.users.read().await.get(&id).cloned())
        }
    }

    #[derive(Default)]
    pub struct MemoryRoomRepository {
        rooms: RwLock<HashMap<RoomId, ChatRoom>>,
    }

    impl MemoryRoomRepository {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl RoomRepository for MemoryRoomRepository {
        async fn create(&self, room: ChatRoom) -> Result<ChatRoom, RepositoryError> {
            let mut rooms = self.rooms.write().await;
            if rooms.contains_key(&room.id) {
                return Err(RepositoryError::Conflict);
            }
            rooms.insert(room.id, room.clone());
            Ok(room)
        }

        async fn load_room(&self, id: RoomId) -> Result<Option<ChatRoom>, RepositoryError> {
            Ok(self.rooms.read().await.get(&id).cloned())
        }

        async fn replace_members(&self, room: &ChatRoom) -> Result<(), RepositoryError> {
            let mut rooms = self.rooms.write().await;
            let stored = rooms.get_mut(&room.id).ok_or(RepositoryError::NotFound)?;
            *stored = room.clone();
            Ok(())
        }
    }

    #[derive(Default)]
    struct MessageTable {
        by_id: HashMap<MessageId, Message>,
        by_key: HashMap<(RoomId, IdempotencyKey), MessageId>,
    }

    /// 带 `(room, key)` 唯一约束的内存消息表
    #[derive(Default)]
    pub struct MemoryMessageRepository {
        table: RwLock<MessageTable>,
        unavailable: AtomicBool,
    }

    impl MemoryMessageRepository {
        pub fn new() -> Self {
            Self::default()
        }

        /// 模拟存储不可用
        pub fn set_unavailable(&self, unavailable: bool) {
            self.unavailable.store(unavailable, Ordering::SeqCst);
        }

        /// 房间内的消息，按序号排序
        pub async fn messages_in_room(&self, room_id: RoomId) -> Vec<Message> {
            let table = self.table.read().await;
            let mut messages: Vec<Message> = table
                .by_id
                .values()
                .filter(|message| message.room_id == room_id)
                .cloned()
                .collect();
            messages.sort_by_key(|message| message.sequence);
            messages
        }

        fn check_available(&self) -> Result<(), RepositoryError> {
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(RepositoryError::storage("message store unavailable"));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl MessageRepository for MemoryMessageRepository {
        async fn save_message(&self, message: &Message) -> Result<MessageId, RepositoryError> {
            self.check_available()?;
            let mut table = self.table.write().await;
            if let Some(key) = &message.idempotency_key {
                let index_key = (message.room_id, key.clone());
                if table.by_key.contains_key(&index_key) {
                    return Err(RepositoryError::Conflict);
                }
                table.by_key.insert(index_key, message.id);
            }
            table.by_id.insert(message.id, message.clone());
            Ok(message.id)
        }

        async fn find_by_room_and_idempotency_key(
            &self,
            room_id: RoomId,
            key: &IdempotencyKey,
        ) -> Result<Option<Message>, RepositoryError> {
            self.check_available()?;
            let table = self.table.read().await;
            Ok(table
                .by_key
                .get(&(room_id, key.clone()))
                .and_then(|id| table.by_id.get(id))
                .cloned())
        }

        async fn max_sequence(&self, room_id: RoomId) -> Result<u64, RepositoryError> {
            self.check_available()?;
            let table = self.table.read().await;
            Ok(table
                .by_id
                .values()
                .filter(|message| message.room_id == room_id)
                .map(|message| message.sequence.value())
                .max()
                .unwrap_or(0))
        }
    }

    #[derive(Default)]
    pub struct MemoryJoinRequestRepository {
        requests: RwLock<HashMap<JoinRequestId, JoinRequest>>,
    }

    impl MemoryJoinRequestRepository {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl JoinRequestRepository for MemoryJoinRequestRepository {
        async fn create(&self, request: JoinRequest) -> Result<JoinRequest, RepositoryError> {
            self.requests
                .write()
                .await
                .insert(request.id, request.clone());
            Ok(request)
        }

        async fn find(&self, id: JoinRequestId) -> Result<Option<JoinRequest>, RepositoryError> {
            Ok(self.requests.read().await.get(&id).cloned())
        }

        async fn remove(&self, id: JoinRequestId) -> Result<(), RepositoryError> {
            self.requests.write().await.remove(&id);
            Ok(())
        }
    }

}
