//! 实时投递层的核心领域模型
//!
//! 包含标识类型、实时事件及其编解码、消息投递状态机和在线状态模型。

pub mod errors;
pub mod events;
pub mod message_status;
pub mod presence;
pub mod value_objects;

// 重新导出常用类型
pub use errors::*;
pub use events::*;
pub use message_status::*;
pub use presence::*;
pub use value_objects::*;
