//! Web API 层。
//!
//! 提供 Axum 路由：WebSocket 升级入口（Origin 校验 + JWT 认证）以及在线状态、
//! 输入状态和连接统计的只读查询，实际的连接生命周期交给应用层的 [`application::Realtime`]。

mod auth;
mod error;
mod origin;
mod routes;
mod state;
mod ws_connection;

pub use auth::{Claims, JwtService};
pub use config::JwtConfig;
pub use error::{ApiError, ErrorBody};
pub use origin::OriginPolicy;
pub use routes::router;
pub use state::AppState;
