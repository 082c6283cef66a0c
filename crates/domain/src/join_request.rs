use crate::value_objects::{JoinRequestId, RoomId, Timestamp, UserId};

/// 待房主处理的入群申请
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct JoinRequest {
    pub id: JoinRequestId,
    pub room_id: RoomId,
    pub requester_id: UserId,
    pub created_at: Timestamp,
}

impl JoinRequest {
    pub fn new(room_id: RoomId, requester_id: UserId, created_at: Timestamp) -> Self {
        Self {
            id: JoinRequestId::random(),
            room_id,
            requester_id,
            created_at,
        }
    }

    /// 申请是否与应答中携带的房间和申请人一致
    pub fn matches(&self, room_id: RoomId, requester_id: UserId) -> bool {
        self.room_id == room_id && self.requester_id == requester_id
    }
}
