//! WebSocket 升级请求的 Origin 校验
//!
//! 没有 Origin 头的请求来自非浏览器客户端，直接放行；
//! 白名单包含 `"*"` 时不做限制；白名单为空时拒绝所有带 Origin 的请求。

use std::collections::HashSet;

use axum::http::{header::ORIGIN, HeaderMap};

use crate::error::ApiError;

#[derive(Debug, Clone, Default)]
pub struct OriginPolicy {
    allow_any: bool,
    allowed: HashSet<String>,
}

fn normalize(origin: &str) -> String {
    origin.trim().trim_end_matches('/').to_ascii_lowercase()
}

impl OriginPolicy {
    pub fn new<I, S>(origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut policy = Self::default();
        for origin in origins {
            let origin = origin.as_ref().trim();
            if origin == "*" {
                policy.allow_any = true;
            } else if !origin.is_empty() {
                policy.allowed.insert(normalize(origin));
            }
        }
        policy
    }

    pub fn allow_any() -> Self {
        Self::new(["*"])
    }

    pub fn is_allowed(&self, origin: Option<&str>) -> bool {
        match origin {
            None => true,
            Some(_) if self.allow_any => true,
            Some(origin) => self.allowed.contains(&normalize(origin)),
        }
    }

    /// 校验升级请求，失败返回 403
    pub fn check(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        let origin = match headers.get(ORIGIN) {
            None => None,
            Some(value) => Some(
                value
                    .to_str()
                    .map_err(|_| ApiError::forbidden("origin not allowed"))?,
            ),
        };

        if self.is_allowed(origin) {
            Ok(())
        } else {
            tracing::warn!(origin = ?origin, "拒绝来自未授权 Origin 的升级请求");
            Err(ApiError::forbidden("origin not allowed"))
        }
    }
}
