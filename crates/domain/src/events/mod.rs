//! 会话协议
//!
//! 上行操作与下行信封的线上格式。

pub mod envelope;
pub mod inbound;

pub use envelope::*;
pub use inbound::*;
