/// buggy 库入口
///
/// 传输层（`tcp`）以及基于它的服务端和客户端
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod server;
pub mod tcp;
pub mod tls;

// 重新导出常用类型
pub use config::{ClientConfig, ServerConfig};
pub use error::{ProtocolError, Result, TunnelError};
