//! Web API 层。
//!
//! 提供 Axum 路由：健康检查和 WebSocket 握手，握手通过后把连接交给会话网关。

mod error;
mod routes;
mod state;
mod ws_connection;

pub use error::ApiError;
pub use routes::router;
pub use state::AppState;
