//! 领域模型错误定义
//!
//! 领域层只描述业务规则被违反的情况；持久化协作方的失败单独用 `RepositoryError` 表达。

use thiserror::Error;

/// 领域模型错误类型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    /// 参数不合法
    #[error("invalid argument {field}: {reason}")]
    InvalidArgument { field: String, reason: String },

    /// 房间不存在
    #[error("room not found")]
    RoomNotFound,

    /// 用户不存在
    #[error("user not found")]
    UserNotFound,

    /// 入群申请不存在
    #[error("join request not found")]
    JoinRequestNotFound,

    /// 操作者不是房间成员
    #[error("user not in room")]
    UserNotInRoom,

    /// 用户已是房间成员
    #[error("user already in room")]
    UserAlreadyInRoom,

    /// 仅房主可执行的操作
    #[error("only the room owner may perform this operation")]
    NotRoomOwner,

    /// 房间成员集合不能为空，且必须包含房主
    #[error("room membership invariant violated: {0}")]
    MembershipInvariant(&'static str),
}

impl DomainError {
    /// 创建参数错误
    pub fn invalid_argument(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// 持久化协作方错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RepositoryError {
    #[error("record not found")]
    NotFound,

    /// 唯一约束冲突（例如同一房间内重复的幂等键）
    #[error("unique constraint violated")]
    Conflict,

    #[error("storage failure: {message}")]
    Storage { message: String },
}

impl RepositoryError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }
}
