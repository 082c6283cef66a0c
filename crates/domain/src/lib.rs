//! 实时聊天投递的核心领域模型
//!
//! 包含房间、消息、入群申请等实体，以及会话协议（上行操作、下行信封）。

pub mod chat_room;
pub mod errors;
pub mod events;
pub mod join_request;
pub mod message;
pub mod value_objects;

// 重新导出常用类型
pub use chat_room::ChatRoom;
pub use errors::*;
pub use events::*;
pub use join_request::JoinRequest;
pub use message::Message;
pub use value_objects::*;
