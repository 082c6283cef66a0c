//! 上行操作
//!
//! 客户端帧是以 `op` 字段区分的 JSON 对象。

use serde::{Deserialize, Serialize};

use crate::value_objects::{JoinRequestId, RoomId, UserId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoom {
    pub room_name: String,
    #[serde(default)]
    pub participant_ids: Vec<UserId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestJoin {
    pub room_id: RoomId,
    #[serde(default)]
    pub requester_id: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RespondJoin {
    pub request_id: JoinRequestId,
    pub room_id: RoomId,
    pub requester_id: UserId,
    pub accepted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscribe {
    pub room_id: RoomId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    pub room_id: RoomId,
    pub content: String,
    #[serde(default)]
    pub client_message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum InboundOperation {
    CreateRoom(CreateRoom),
    JoinRequest(RequestJoin),
    JoinResponse(RespondJoin),
    Subscribe(Subscribe),
    SendMessage(SendMessage),
    /// 客户端心跳应答
    Pong,
}

impl InboundOperation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateRoom(_) => "create-room",
            Self::JoinRequest(_) => "join-request",
            Self::JoinResponse(_) => "join-response",
            Self::Subscribe(_) => "subscribe",
            Self::SendMessage(_) => "send-message",
            Self::Pong => "pong",
        }
    }
}
