/// 错误类型
///
/// 传输层（`tcp` 模块）内部的 I/O 操作返回 `std::io::Result`，协议层的失败以
/// [`ProtocolError`] 的形式包在 `io::Error` 里传递，到达连接处理函数时再还原成
/// [`TunnelError::Protocol`]。
use std::io;
use thiserror::Error;

/// Violations of the CONNECT tunnel wire protocol and of the reader's bounds.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A header line is missing its CR, has the wrong token count or is not UTF-8
    #[error("Malformed HTTP header")]
    MalformedHeader,

    #[error("Exceeding max number of HTTP headers ({limit})")]
    TooManyHeaders { limit: usize },

    /// No delimiter within the scan limit
    #[error("Line exceeds {limit} bytes without a delimiter")]
    LineTooLong { limit: usize },

    #[error("Method {0} not supported")]
    UnsupportedMethod(String),

    #[error("Tunnel rejected with status {code} {reason}")]
    UnexpectedStatus { code: u16, reason: String },

    #[error("Snapshot buffer full ({limit} bytes)")]
    SnapshotFull { limit: usize },
}

impl ProtocolError {
    /// Wrap into an `io::Error` so it can travel through `io::Result` returning code.
    pub fn into_io(self) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, self)
    }

    /// Recover a protocol error previously wrapped by [`ProtocolError::into_io`].
    pub fn from_io(err: &io::Error) -> Option<&ProtocolError> {
        err.get_ref().and_then(|inner| inner.downcast_ref::<ProtocolError>())
    }
}

/// 主要错误类型
#[derive(Error, Debug)]
pub enum TunnelError {
    /// 连接失败
    #[error("Failed to connect to {addr}: {source}")]
    ConnectionFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 配置错误
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// TLS 握手或证书校验失败
    #[error("TLS error: {0}")]
    Tls(#[source] io::Error),

    /// 协议错误
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// 超时错误
    #[error("Operation timeout after {duration:?}")]
    Timeout { duration: std::time::Duration },

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),

    /// 其他错误（保留与 anyhow 的兼容性）
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, TunnelError>;

impl From<io::Error> for TunnelError {
    fn from(err: io::Error) -> Self {
        match ProtocolError::from_io(&err) {
            Some(protocol) => Self::Protocol(protocol.clone()),
            None => Self::Io(err),
        }
    }
}

impl TunnelError {
    /// 创建连接失败错误
    pub fn connection_failed(addr: impl Into<String>, source: io::Error) -> Self {
        Self::ConnectionFailed {
            addr: addr.into(),
            source,
        }
    }

    /// 创建配置错误
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// 创建超时错误
    pub fn timeout(duration: std::time::Duration) -> Self {
        Self::Timeout { duration }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::ConfigError(_))
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }

    /// The protocol violation behind this error, if any
    pub fn protocol(&self) -> Option<&ProtocolError> {
        match self {
            Self::Protocol(p) => Some(p),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_protocol_error_survives_io_round_trip() {
        let io_err = ProtocolError::LineTooLong { limit: 8192 }.into_io();
        assert_eq!(io_err.kind(), io::ErrorKind::InvalidData);

        let err = TunnelError::from(io_err);
        assert_eq!(
            err.protocol(),
            Some(&ProtocolError::LineTooLong { limit: 8192 })
        );
    }

    #[test]
    fn test_plain_io_error_stays_io() {
        let err = TunnelError::from(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(matches!(err, TunnelError::Io(_)));
        assert!(err.protocol().is_none());
    }

    #[test]
    fn test_unsupported_method_message() {
        let err = TunnelError::from(ProtocolError::UnsupportedMethod("GET".to_string()));
        assert_eq!(err.to_string(), "Protocol error: Method GET not supported");
    }

    #[test]
    fn test_connection_failed() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let err = TunnelError::connection_failed("127.0.0.1:8080", io_err);
        assert!(err.to_string().contains("Failed to connect"));
        assert!(err.to_string().contains("127.0.0.1:8080"));
    }

    #[test]
    fn test_error_is_checks() {
        let config_err = TunnelError::config_error("test");
        let timeout_err = TunnelError::timeout(Duration::from_secs(1));
        let tls_err = TunnelError::Tls(io::Error::other("bad certificate"));

        assert!(config_err.is_config_error());
        assert!(!config_err.is_timeout());
        assert!(timeout_err.is_timeout());
        assert!(!timeout_err.is_tls());
        assert!(tls_err.is_tls());
        assert!(!tls_err.is_config_error());
    }
}
