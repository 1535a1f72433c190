/// CONNECT 隧道握手
use super::conn::{Connection, Socket};
use super::http::{HttpRequest, HttpResponse};
use crate::error::{ProtocolError, Result};

/// Reply sent once a tunnel request is accepted.
pub const PROXY_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";

/// Reads a tunnel request from `conn` and acknowledges it.
///
/// Only `CONNECT` is accepted. The reply is flushed before returning, so the caller can
/// start relaying immediately. On error nothing is written back.
pub async fn accept<S: Socket>(conn: &mut Connection<S>) -> Result<HttpRequest> {
    let request = HttpRequest::parse(conn.reader_mut()).await?;

    if request.method != "CONNECT" {
        return Err(ProtocolError::UnsupportedMethod(request.method).into());
    }

    conn.write(PROXY_RESPONSE).await?;
    conn.flush().await?;

    Ok(request)
}

/// Asks the peer on `conn` to open a tunnel to `target`, requiring a `200` reply.
pub async fn connect<S: Socket>(conn: &mut Connection<S>, target: &str) -> Result<HttpResponse> {
    conn.write_vectored_all(&[
        &b"CONNECT "[..],
        target.as_bytes(),
        b" HTTP/1.1\r\nHost: ",
        target.as_bytes(),
        b"\r\n\r\n",
    ])
    .await?;
    conn.flush().await?;

    let response = HttpResponse::parse(conn.reader_mut()).await?;
    if response.status_code != 200 {
        return Err(ProtocolError::UnexpectedStatus {
            code: response.status_code,
            reason: response.reason,
        }
        .into());
    }

    Ok(response)
}
