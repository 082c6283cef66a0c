//! 会话身份解析
//!
//! 握手时从连接参数中取出凭证并校验一次，主体写入会话级属性表；之后每个上行操作
//! 优先使用传输层携带的主体，丢失时再从属性表恢复。握手之后不会重新认证。

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use domain::UserId;
use thiserror::Error;
use uuid::Uuid;

/// 会话属性表里保存主体的键
pub const SUBJECT_ATTRIBUTE: &str = "subject";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing credential")]
    MissingCredential,
    #[error("invalid credential: {0}")]
    InvalidCredential(String),
    #[error("credential expired")]
    Expired,
    #[error("identity unavailable for this connection")]
    IdentityUnavailable,
}

/// 外部身份校验方：凭证 → 主体，无状态
#[cfg_attr(test, mockall::automock)]
pub trait IdentityVerifier: Send + Sync {
    fn verify_token(&self, token: &str) -> Result<UserId, AuthError>;
}

/// 单个连接的会话级键值上下文，握手时写入，之后按需读取。
#[derive(Debug, Default)]
pub struct SessionAttributes {
    values: RwLock<HashMap<String, String>>,
}

impl SessionAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, value: impl Into<String>) {
        let mut values = self
            .values
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let values = self
            .values
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        values.get(key).cloned()
    }

    /// 握手时绑定的主体
    pub fn subject(&self) -> Option<UserId> {
        self.get(SUBJECT_ATTRIBUTE)
            .and_then(|raw| raw.parse::<Uuid>().ok())
            .map(UserId::from)
    }

    fn bind_subject(&self, subject: UserId) {
        self.insert(SUBJECT_ATTRIBUTE, subject.to_string());
    }
}

/// 从握手查询串中取出凭证：`token=...`，百分号解码（`+` 保持原样），去掉可选的 `Bearer ` 前缀。
pub fn credential_from_query(raw_query: Option<&str>) -> Result<String, AuthError> {
    let raw_query = raw_query.ok_or(AuthError::MissingCredential)?;

    let encoded = raw_query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "token")
        .map(|(_, value)| value)
        .ok_or(AuthError::MissingCredential)?;

    let decoded = urlencoding::decode(encoded)
        .map_err(|err| AuthError::InvalidCredential(format!("malformed encoding: {err}")))?;

    let token = decoded.trim();
    let token = token
        .strip_prefix("Bearer ")
        .or_else(|| token.strip_prefix("bearer "))
        .unwrap_or(token)
        .trim();

    if token.is_empty() {
        return Err(AuthError::MissingCredential);
    }
    Ok(token.to_owned())
}

pub struct SessionIdentityResolver {
    verifier: Arc<dyn IdentityVerifier>,
}

impl SessionIdentityResolver {
    pub fn new(verifier: Arc<dyn IdentityVerifier>) -> Self {
        Self { verifier }
    }

    pub fn authenticate(&self, credential: &str) -> Result<UserId, AuthError> {
        self.verifier.verify_token(credential)
    }

    /// 握手：取凭证、校验、把主体写入会话属性。失败时连接应被直接拒绝。
    pub fn handshake(
        &self,
        raw_query: Option<&str>,
        session: &SessionAttributes,
    ) -> Result<UserId, AuthError> {
        let credential = credential_from_query(raw_query)?;
        let subject = self.authenticate(&credential)?;
        session.bind_subject(subject);
        tracing::debug!(user_id = %subject, "握手认证通过");
        Ok(subject)
    }

    /// 为单个上行操作解析主体，只读不产生副作用。
    pub fn resolve(
        &self,
        transport_principal: Option<UserId>,
        session: &SessionAttributes,
    ) -> Result<UserId, AuthError> {
        if let Some(subject) = transport_principal {
            return Ok(subject);
        }
        match session.subject() {
            Some(subject) => {
                tracing::debug!(user_id = %subject, "transport principal lost, recovered from session");
                Ok(subject)
            }
            None => Err(AuthError::IdentityUnavailable),
        }
    }
}
