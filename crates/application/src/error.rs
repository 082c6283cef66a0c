use domain::{DomainError, RepositoryError};
use thiserror::Error;

use crate::content_filter::ValidationError;
use crate::identity::AuthError;
use crate::rate_limiter::RateLimitError;

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("domain error: {0}")]
    Domain(#[from] DomainError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("rate limited: {0}")]
    RateLimited(#[from] RateLimitError),
    #[error("repository error: {0}")]
    Repository(RepositoryError),
}

impl ApplicationError {
    /// 下行 `error` 信封里的稳定错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Auth(_) => "AUTH_FAILED",
            Self::Domain(DomainError::UserNotInRoom | DomainError::NotRoomOwner) => "FORBIDDEN",
            Self::Domain(
                DomainError::RoomNotFound
                | DomainError::UserNotFound
                | DomainError::JoinRequestNotFound,
            ) => "NOT_FOUND",
            Self::Domain(
                DomainError::InvalidArgument { .. }
                | DomainError::UserAlreadyInRoom
                | DomainError::MembershipInvariant(_),
            ) => "BAD_REQUEST",
            Self::Validation(_) => "VALIDATION_FAILED",
            Self::RateLimited(_) => "RATE_LIMITED",
            Self::Repository(RepositoryError::NotFound) => "NOT_FOUND",
            Self::Repository(_) => "INTERNAL_ERROR",
        }
    }

    /// 非预期故障，例如存储不可用。
    pub fn is_internal(&self) -> bool {
        self.code() == "INTERNAL_ERROR"
    }

    /// 返回给客户端的原因；内部错误的细节只进日志。
    pub fn reason(&self) -> String {
        if self.is_internal() {
            "internal error".to_owned()
        } else {
            match self {
                Self::Auth(err) => err.to_string(),
                Self::Domain(err) => err.to_string(),
                Self::Validation(err) => err.to_string(),
                Self::RateLimited(err) => err.to_string(),
                Self::Repository(err) => err.to_string(),
            }
        }
    }
}

impl From<RepositoryError> for ApplicationError {
    fn from(value: RepositoryError) -> Self {
        ApplicationError::Repository(value)
    }
}
