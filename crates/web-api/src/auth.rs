//! JWT 认证模块
//!
//! 实时层只消费上游签发的 token：从中取出用户 ID 和显示名组成 [`Identity`]。
//! 浏览器的 WebSocket API 不能自定义请求头，所以升级请求也接受 `?token=` 查询参数。

use application::Identity;
use axum::http::{header::AUTHORIZATION, HeaderMap};
use config::JwtConfig;
use domain::{DisplayName, UserId};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiError;

/// JWT Claims 结构
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub name: String,
    pub exp: i64, // 过期时间 (Unix timestamp)
}

/// JWT Token 服务
#[derive(Clone)]
pub struct JwtService {
    config: JwtConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtService {
    pub fn new(config: JwtConfig) -> Self {
        let encoding_key = EncodingKey::from_secret(config.secret.as_ref());
        let decoding_key = DecodingKey::from_secret(config.secret.as_ref());

        Self {
            config,
            encoding_key,
            decoding_key,
        }
    }

    /// 生成 JWT token，主要给测试和运维工具使用
    pub fn generate_token(
        &self,
        user_id: UserId,
        display_name: &DisplayName,
    ) -> Result<String, ApiError> {
        let exp = chrono::Utc::now() + chrono::Duration::hours(self.config.expiration_hours);
        let claims = Claims {
            sub: user_id.as_uuid(),
            name: display_name.as_str().to_string(),
            exp: exp.timestamp(),
        };

        encode(&Header::default(), &claims, &self.encoding_key).map_err(|err| {
            ApiError::internal_server_error(format!("Token generation failed: {err}"))
        })
    }

    /// 验证并解析 JWT token
    pub fn verify_token(&self, token: &str) -> Result<Claims, ApiError> {
        decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map(|token_data| token_data.claims)
            .map_err(|err| ApiError::unauthorized(format!("Invalid token: {err}")))
    }

    pub fn identity_from_token(&self, token: &str) -> Result<Identity, ApiError> {
        let claims = self.verify_token(token)?;
        let display_name = DisplayName::parse(claims.name)
            .map_err(|err| ApiError::unauthorized(format!("Invalid token: {err}")))?;
        Ok(Identity {
            user_id: UserId::from(claims.sub),
            display_name,
        })
    }

    /// 从请求中解析身份：优先 `Authorization: Bearer`，其次查询参数里的 token
    pub fn authenticate(
        &self,
        headers: &HeaderMap,
        query_token: Option<&str>,
    ) -> Result<Identity, ApiError> {
        match headers.get(AUTHORIZATION) {
            Some(value) => {
                let token = value
                    .to_str()
                    .ok()
                    .and_then(|header| header.strip_prefix("Bearer "))
                    .ok_or_else(|| ApiError::unauthorized("Invalid authorization header format"))?;
                self.identity_from_token(token)
            }
            None => {
                let token = query_token
                    .filter(|token| !token.is_empty())
                    .ok_or_else(|| ApiError::unauthorized("Missing authorization token"))?;
                self.identity_from_token(token)
            }
        }
    }
}
