//! 出站事件与版本化信封
//!
//! 所有下行事件都包在 `{v, type, messageId, ts, payload}` 里。`messageId` 是每个信封
//! 新生成的追踪标识，与聊天消息本身的 id 无关。

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::Message;
use crate::value_objects::{JoinRequestId, MessageId, RoomId, Timestamp, UserId};
use crate::ChatRoom;

pub const ENVELOPE_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "room.created")]
    RoomCreated,
    #[serde(rename = "room.invited")]
    RoomInvited,
    #[serde(rename = "join.request")]
    JoinRequest,
    #[serde(rename = "join.accepted")]
    JoinAccepted,
    #[serde(rename = "join.rejected")]
    JoinRejected,
    #[serde(rename = "subscribe.success")]
    SubscribeSuccess,
    #[serde(rename = "chat.message")]
    ChatMessage,
    #[serde(rename = "chat.receipt")]
    ChatReceipt,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "system.ping")]
    SystemPing,
    #[serde(rename = "system.notification")]
    SystemNotification,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RoomCreated => "room.created",
            Self::RoomInvited => "room.invited",
            Self::JoinRequest => "join.request",
            Self::JoinAccepted => "join.accepted",
            Self::JoinRejected => "join.rejected",
            Self::SubscribeSuccess => "subscribe.success",
            Self::ChatMessage => "chat.message",
            Self::ChatReceipt => "chat.receipt",
            Self::Error => "error",
            Self::SystemPing => "system.ping",
            Self::SystemNotification => "system.notification",
        }
    }
}

/// 线上传输的信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub v: u8,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub message_id: Uuid,
    pub ts: i64,
    pub payload: serde_json::Value,
}

impl Envelope {
    /// 用新的追踪 id 包装事件。
    pub fn wrap(event: &OutboundEvent, now: Timestamp) -> Result<Self, serde_json::Error> {
        Ok(Self {
            v: ENVELOPE_VERSION,
            event_type: event.event_type(),
            message_id: Uuid::new_v4(),
            ts: now.timestamp_millis(),
            payload: event.payload()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub room_id: RoomId,
    pub room_name: String,
    pub owner_id: UserId,
    pub member_ids: Vec<UserId>,
}

impl From<&ChatRoom> for RoomSummary {
    fn from(room: &ChatRoom) -> Self {
        Self {
            room_id: room.id,
            room_name: room.name.clone(),
            owner_id: room.owner_id,
            member_ids: room.members().iter().copied().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequestedPayload {
    pub request_id: JoinRequestId,
    pub room_id: RoomId,
    pub requester_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinDecisionPayload {
    pub request_id: JoinRequestId,
    pub room_id: RoomId,
    pub requester_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribedPayload {
    pub room_id: RoomId,
    pub destination: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessagePayload {
    pub message_id: MessageId,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub sender_name: Option<String>,
    pub content: String,
    pub sequence: u64,
    pub client_message_id: Option<String>,
    pub sent_at: i64,
}

impl ChatMessagePayload {
    pub fn from_message(message: &Message, sender_name: Option<String>) -> Self {
        Self {
            message_id: message.id,
            room_id: message.room_id,
            sender_id: message.sender_id,
            sender_name,
            content: message.content.clone(),
            sequence: message.sequence.value(),
            client_message_id: message
                .idempotency_key
                .as_ref()
                .map(|key| key.as_str().to_owned()),
            sent_at: message.sent_at.timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptStatus {
    Ok,
    Duplicate,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptPayload {
    pub client_message_id: Option<String>,
    pub status: ReceiptStatus,
    pub saved_message_id: Option<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingPayload {
    pub sent_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub kind: String,
    pub message: String,
}

/// 下行事件
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundEvent {
    RoomCreated(RoomSummary),
    RoomInvited(RoomSummary),
    JoinRequested(JoinRequestedPayload),
    JoinAccepted(JoinDecisionPayload),
    JoinRejected(JoinDecisionPayload),
    SubscribeSuccess(SubscribedPayload),
    ChatMessage(ChatMessagePayload),
    ChatReceipt(ReceiptPayload),
    Error(ErrorPayload),
    SystemPing(PingPayload),
    SystemNotification(NotificationPayload),
}

impl OutboundEvent {
    pub fn error(code: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Error(ErrorPayload {
            code: code.into(),
            reason: reason.into(),
        })
    }

    pub fn notification(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SystemNotification(NotificationPayload {
            kind: kind.into(),
            message: message.into(),
        })
    }

    pub fn receipt(
        client_message_id: Option<String>,
        status: ReceiptStatus,
        saved_message_id: Option<MessageId>,
    ) -> Self {
        Self::ChatReceipt(ReceiptPayload {
            client_message_id,
            status,
            saved_message_id,
        })
    }

    pub fn event_type(&self) -> EventType {
        match self {
            Self::RoomCreated(_) => EventType::RoomCreated,
            Self::RoomInvited(_) => EventType::RoomInvited,
            Self::JoinRequested(_) => EventType::JoinRequest,
            Self::JoinAccepted(_) => EventType::JoinAccepted,
            Self::JoinRejected(_) => EventType::JoinRejected,
            Self::SubscribeSuccess(_) => EventType::SubscribeSuccess,
            Self::ChatMessage(_) => EventType::ChatMessage,
            Self::ChatReceipt(_) => EventType::ChatReceipt,
            Self::Error(_) => EventType::Error,
            Self::SystemPing(_) => EventType::SystemPing,
            Self::SystemNotification(_) => EventType::SystemNotification,
        }
    }

    fn payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            Self::RoomCreated(p) | Self::RoomInvited(p) => serde_json::to_value(p),
            Self::JoinRequested(p) => serde_json::to_value(p),
            Self::JoinAccepted(p) | Self::JoinRejected(p) => serde_json::to_value(p),
            Self::SubscribeSuccess(p) => serde_json::to_value(p),
            Self::ChatMessage(p) => serde_json::to_value(p),
            Self::ChatReceipt(p) => serde_json::to_value(p),
            Self::Error(p) => serde_json::to_value(p),
            Self::SystemPing(p) => serde_json::to_value(p),
            Self::SystemNotification(p) => serde_json::to_value(p),
        }
    }
}
