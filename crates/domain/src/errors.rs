//! 领域模型错误定义
//!
//! 定义了领域层与外部协作方（会话成员、消息存储）交互时可能出现的错误。

use thiserror::Error;

use crate::message_status::MessageStatus;

/// 领域模型错误类型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    /// 参数校验失败
    #[error("invalid argument {field}: {reason}")]
    InvalidArgument { field: String, reason: String },

    /// 消息状态不允许这样迁移
    #[error("illegal message status transition: {from} -> {to}")]
    IllegalTransition {
        from: MessageStatus,
        to: MessageStatus,
    },
}

impl DomainError {
    pub fn invalid_argument(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// 外部存储 / 协作方错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("requested resource not found")]
    NotFound,
    #[error("resource conflict")]
    Conflict,
    #[error("storage error: {message}")]
    Storage { message: String },
}

impl RepositoryError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;
