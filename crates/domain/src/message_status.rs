//! 消息投递状态机
//!
//! `sending → sent → delivered → read`，`failed` 只能从 `sending` / `sent` 进入且为终态。
//! `delivered` 与 `read` 只由接收方上报驱动；`read` 视为已经经过 `delivered`。

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

/// 一次状态推进的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusTransition {
    /// 状态确实发生了变化
    Applied {
        from: MessageStatus,
        to: MessageStatus,
    },
    /// 已经处于该状态或更靠后的状态，重复上报视为无操作
    Unchanged(MessageStatus),
}

impl StatusTransition {
    pub fn is_applied(&self) -> bool {
        matches!(self, StatusTransition::Applied { .. })
    }
}

impl MessageStatus {
    /// 正常流转中的先后次序，`failed` 不参与排序。
    fn rank(self) -> Option<u8> {
        match self {
            MessageStatus::Sending => Some(0),
            MessageStatus::Sent => Some(1),
            MessageStatus::Delivered => Some(2),
            MessageStatus::Read => Some(3),
            MessageStatus::Failed => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Sending => "sending",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
            MessageStatus::Failed => "failed",
        }
    }

    /// 尝试推进到 `next`。
    ///
    /// 状态只会向前走：回退或重复都返回 `Unchanged`，这让重复的送达 / 已读上报天然幂等。
    /// 跳过中间状态是允许的（未送达直接已读即视为已读）。
    pub fn advance(self, next: MessageStatus) -> Result<StatusTransition, DomainError> {
        if self == next {
            return Ok(StatusTransition::Unchanged(self));
        }

        match (self.rank(), next.rank()) {
            (Some(current), Some(target)) if target > current => Ok(StatusTransition::Applied {
                from: self,
                to: next,
            }),
            (Some(_), Some(_)) => Ok(StatusTransition::Unchanged(self)),
            (Some(current), None) if current <= 1 => Ok(StatusTransition::Applied {
                from: self,
                to: next,
            }),
            _ => Err(DomainError::IllegalTransition {
                from: self,
                to: next,
            }),
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sending" => Ok(MessageStatus::Sending),
            "sent" => Ok(MessageStatus::Sent),
            "delivered" => Ok(MessageStatus::Delivered),
            "read" => Ok(MessageStatus::Read),
            "failed" => Ok(MessageStatus::Failed),
            other => Err(DomainError::invalid_argument(
                "status",
                format!("unknown message status `{other}`"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use MessageStatus::*;

    #[test]
    fn forward_transitions_apply() {
        assert!(Sending.advance(Sent).unwrap().is_applied());
        assert!(Sent.advance(Delivered).unwrap().is_applied());
        assert!(Delivered.advance(Read).unwrap().is_applied());
    }

    #[test]
    fn read_skips_delivered() {
        let transition = Sent.advance(Read).unwrap();
        assert_eq!(transition, StatusTransition::Applied { from: Sent, to: Read });
    }

    #[test]
    fn repeats_and_regressions_are_noops() {
        assert_eq!(
            Delivered.advance(Delivered).unwrap(),
            StatusTransition::Unchanged(Delivered)
        );
        assert_eq!(Read.advance(Delivered).unwrap(), StatusTransition::Unchanged(Read));
    }

    #[test]
    fn failed_only_from_early_states() {
        assert!(Sending.advance(Failed).unwrap().is_applied());
        assert!(Sent.advance(Failed).unwrap().is_applied());
        assert!(Delivered.advance(Failed).is_err());
        assert!(Failed.advance(Read).is_err());
        assert_eq!(Failed.advance(Failed).unwrap(), StatusTransition::Unchanged(Failed));
    }

    #[test]
    fn parses_wire_names() {
        assert_eq!("read".parse::<MessageStatus>().unwrap(), Read);
        assert!("seen".parse::<MessageStatus>().is_err());
        assert_eq!(serde_json::to_string(&Delivered).unwrap(), "\"delivered\"");
    }
}
