/// 出站 TCP 连接
use tokio::net::TcpStream;
use tracing::debug;

use super::conn::{Connection, TcpConn};
use crate::error::{Result, TunnelError};

/// Opens outbound connections with fixed buffer sizes and no-delay policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dialer {
    pub tcp_nodelay: bool,
    pub reader_buf_size: usize,
    pub writer_buf_size: usize,
}

impl Dialer {
    pub fn new(tcp_nodelay: bool, reader_buf_size: usize, writer_buf_size: usize) -> Self {
        Self {
            tcp_nodelay,
            reader_buf_size,
            writer_buf_size,
        }
    }

    /// Connects to `address` (`host:port`).
    pub async fn dial(&self, address: &str) -> Result<TcpConn> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| TunnelError::connection_failed(address, e))?;
        stream
            .set_nodelay(self.tcp_nodelay)
            .map_err(|e| TunnelError::connection_failed(address, e))?;

        debug!("Connected to {}", address);
        Ok(Connection::new(
            stream,
            self.reader_buf_size,
            self.writer_buf_size,
        ))
    }
}
