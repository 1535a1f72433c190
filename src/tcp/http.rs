/// HTTP/1 请求头、响应头解析
///
/// 只处理起始行和头部，不读取消息体。每行必须以 `\r\n` 结尾，读到空行即结束。
use std::collections::HashMap;

use tokio::io::AsyncRead;

use super::io::Reader;
use crate::error::{ProtocolError, Result};

/// Maximum number of header lines accepted after the start line.
pub const MAX_HEADERS: usize = 100;

/// Parsed request head
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub target: String,
    pub version: String,
    /// Lower-cased names; the last occurrence of a name wins
    pub headers: HashMap<String, String>,
}

/// Parsed response head
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub version: String,
    pub status_code: u16,
    pub reason: String,
    pub headers: HashMap<String, String>,
}

impl HttpRequest {
    /// Reads a request head; nothing past the terminating empty line is consumed from
    /// an unbuffered reader.
    pub async fn parse<R: AsyncRead + Unpin>(reader: &mut Reader<R>) -> Result<Self> {
        let mut start = None;
        let headers = parse_head(reader, |line| {
            let mut tokens = line.split(' ');
            let (Some(method), Some(target), Some(version), None) =
                (tokens.next(), tokens.next(), tokens.next(), tokens.next())
            else {
                return Err(ProtocolError::MalformedHeader);
            };

            if method.is_empty() || target.is_empty() || !version.starts_with("HTTP/") {
                return Err(ProtocolError::MalformedHeader);
            }

            start = Some((method.to_string(), target.to_string(), version.to_string()));
            Ok(())
        })
        .await?;

        let (method, target, version) = start.ok_or(ProtocolError::MalformedHeader)?;
        Ok(Self {
            method,
            target,
            version,
            headers,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

impl HttpResponse {
    /// Reads a response head. The reason phrase may contain spaces.
    pub async fn parse<R: AsyncRead + Unpin>(reader: &mut Reader<R>) -> Result<Self> {
        let mut start = None;
        let headers = parse_head(reader, |line| {
            let mut tokens = line.splitn(3, ' ');
            let (Some(version), Some(code), Some(reason)) =
                (tokens.next(), tokens.next(), tokens.next())
            else {
                return Err(ProtocolError::MalformedHeader);
            };

            if code.len() != 3 || !version.starts_with("HTTP/") {
                return Err(ProtocolError::MalformedHeader);
            }
            let status_code = code
                .parse::<u16>()
                .map_err(|_| ProtocolError::MalformedHeader)?;

            start = Some((version.to_string(), status_code, reason.to_string()));
            Ok(())
        })
        .await?;

        let (version, status_code, reason) = start.ok_or(ProtocolError::MalformedHeader)?;
        Ok(Self {
            version,
            status_code,
            reason,
            headers,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// 解析起始行和头部，起始行交给 `start_line` 处理
async fn parse_head<R, F>(
    reader: &mut Reader<R>,
    mut start_line: F,
) -> Result<HashMap<String, String>>
where
    R: AsyncRead + Unpin,
    F: FnMut(&str) -> std::result::Result<(), ProtocolError>,
{
    let mut headers = HashMap::new();
    let mut started = false;
    let mut count = 0;

    loop {
        let line = reader.read_slice(b'\n').await?;
        let line = line
            .strip_suffix(b"\r\n")
            .ok_or(ProtocolError::MalformedHeader)?;
        let line = std::str::from_utf8(line).map_err(|_| ProtocolError::MalformedHeader)?;

        if !started {
            start_line(line)?;
            started = true;
            continue;
        }

        if line.is_empty() {
            return Ok(headers);
        }

        count += 1;
        if count > MAX_HEADERS {
            return Err(ProtocolError::TooManyHeaders { limit: MAX_HEADERS }.into());
        }

        let mut parts = line.split(": ");
        let (Some(name), Some(value), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(ProtocolError::MalformedHeader.into());
        };
        headers.insert(name.to_ascii_lowercase(), value.to_string());
    }
}
