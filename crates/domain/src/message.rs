use crate::value_objects::{IdempotencyKey, MessageId, RoomId, SequenceNumber, Timestamp, UserId};

/// 已被接受的聊天消息，创建后不可变。
///
/// 序号只在接受时分配一次。
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub content: String,
    pub sequence: SequenceNumber,
    pub idempotency_key: Option<IdempotencyKey>,
    pub sent_at: Timestamp,
}

impl Message {
    pub fn new(
        room_id: RoomId,
        sender_id: UserId,
        content: String,
        sequence: SequenceNumber,
        idempotency_key: Option<IdempotencyKey>,
        sent_at: Timestamp,
    ) -> Self {
        Self {
            id: MessageId::random(),
            room_id,
            sender_id,
            content,
            sequence,
            idempotency_key,
            sent_at,
        }
    }
}
