//! JWT 身份校验
//!
//! 握手凭证是 HS256 签名的 JWT，主体取自 `user_id`（兼容标准的 `sub`）。

use application::{AuthError, IdentityVerifier};
use chrono::{Duration, Utc};
use domain::UserId;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// JWT Claims 结构
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    #[serde(alias = "sub")]
    pub user_id: Uuid,
    pub exp: i64, // 过期时间 (Unix timestamp)
}

/// 基于共享密钥的 JWT 校验器
#[derive(Clone)]
pub struct JwtIdentityVerifier {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtIdentityVerifier {
    pub fn new(secret: &str, leeway_seconds: u64) -> Self {
        let mut validation = Validation::default();
        validation.leeway = leeway_seconds;
        validation.set_required_spec_claims(&["exp"]);

        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// 签发令牌（测试和运维脚本使用）
    pub fn issue_token(&self, user_id: UserId, ttl: Duration) -> Result<String, AuthError> {
        let claims = Claims {
            user_id: user_id.into(),
            exp: (Utc::now() + ttl).timestamp(),
        };
        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|err| AuthError::InvalidCredential(format!("token generation failed: {err}")))
    }
}

impl IdentityVerifier for JwtIdentityVerifier {
    fn verify_token(&self, token: &str) -> Result<UserId, AuthError> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| UserId::from(data.claims.user_id))
            .map_err(|err| match err.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::InvalidCredential(err.to_string()),
            })
    }
}
