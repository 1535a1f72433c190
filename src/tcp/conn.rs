/// 带缓冲的连接
///
/// [`Connection`] 把 [`Reader`] 和 [`Writer`] 叠在同一个 [`Socket`] 上，读写缓冲大小
/// 相互独立。关闭和半关闭之前都会先把写缓冲刷出去。
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use socket2::SockRef;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;

use super::io::{Reader, Rewind, Writer};
use super::tls::TlsStream;

/// Size of the scratch buffer used by bulk copies.
const COPY_BUF_SIZE: usize = 8192;

/// A byte-stream transport a [`Connection`] can sit on.
pub trait Socket: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// Make the next close discard unsent data and reset the peer (zero linger).
    fn set_abortive_close(&self) -> io::Result<()>;

    fn peer_addr(&self) -> io::Result<SocketAddr>;
}

impl Socket for TcpStream {
    fn set_abortive_close(&self) -> io::Result<()> {
        SockRef::from(self).set_linger(Some(Duration::ZERO))
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }
}

impl<S: Socket> Socket for Rewind<S> {
    fn set_abortive_close(&self) -> io::Result<()> {
        self.get_ref().set_abortive_close()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.get_ref().peer_addr()
    }
}

/// In-memory pipe, used by tests.
#[cfg(test)]
impl Socket for tokio::io::DuplexStream {
    fn set_abortive_close(&self) -> io::Result<()> {
        Ok(())
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "in-memory stream has no peer address",
        ))
    }
}

/// Plain TCP connection
pub type TcpConn = Connection<TcpStream>;

/// TCP connection upgraded in place to TLS
pub type TlsConn = Connection<TlsStream<Rewind<TcpStream>>>;

/// Read side of a split connection: bytes the reader had buffered, then the transport.
pub type OwnedReadHalf<S> = Rewind<tokio::io::ReadHalf<S>>;

/// Duplex stream with independent read and write buffering.
pub struct Connection<S> {
    io: Reader<Writer<S>>,
}

impl<S> Connection<S> {
    /// `reader_buf_size` / `writer_buf_size` of `0` make that side unbuffered.
    pub fn new(stream: S, reader_buf_size: usize, writer_buf_size: usize) -> Self {
        Self {
            io: Reader::new(Writer::new(stream, writer_buf_size), reader_buf_size),
        }
    }

    pub fn get_ref(&self) -> &S {
        self.io.get_ref().get_ref()
    }

    pub fn get_mut(&mut self) -> &mut S {
        self.io.get_mut().get_mut()
    }

    pub fn reader(&self) -> &Reader<Writer<S>> {
        &self.io
    }

    pub fn reader_mut(&mut self) -> &mut Reader<Writer<S>> {
        &mut self.io
    }

    pub fn writer(&self) -> &Writer<S> {
        self.io.get_ref()
    }

    pub fn set_snapshot(&mut self, limit: usize) {
        self.io.set_snapshot(limit);
    }

    pub fn take_snapshot(&mut self) -> Vec<u8> {
        self.io.take_snapshot()
    }

    pub(crate) fn into_io(self) -> Reader<Writer<S>> {
        self.io
    }

    pub(crate) fn from_io(io: Reader<Writer<S>>) -> Self {
        Self { io }
    }
}

impl<S: Socket> Connection<S> {
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.get_ref().peer_addr()
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.io.read(buf).await
    }

    pub async fn read_full(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.io.read_full(buf).await
    }

    pub async fn read_all(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        self.io.read_all(buf).await
    }

    pub async fn read_slice(&mut self, delim: u8) -> io::Result<&[u8]> {
        self.io.read_slice(delim).await
    }

    pub async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.io.get_mut().write(buf).await
    }

    pub async fn write_vectored_all(&mut self, bufs: &[&[u8]]) -> io::Result<usize> {
        self.io.get_mut().write_vectored_all(bufs).await
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        self.io.get_mut().flush().await
    }

    /// Copies `src` into the connection until `src` ends.
    ///
    /// Pending buffered writes go out first; the copied bytes bypass the write buffer.
    pub async fn read_from<R>(&mut self, src: &mut R) -> io::Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.flush().await?;
        copy_stream(src, self.get_mut()).await
    }

    /// Flushes pending writes and shuts down the write direction.
    pub async fn close_write(&mut self) -> io::Result<()> {
        self.flush().await?;
        self.get_mut().shutdown().await
    }

    /// Flushes pending writes, shuts the transport down and releases it.
    pub async fn close(mut self) -> io::Result<()> {
        self.flush().await?;
        self.get_mut().shutdown().await
    }

    /// Drops the connection with zero linger: buffered data is discarded and the peer
    /// sees a reset instead of an orderly close.
    pub fn reset(self) -> io::Result<()> {
        self.get_ref().set_abortive_close()
    }

    /// Splits into the raw read side and the buffered write side.
    ///
    /// The read side replays whatever the reader had buffered and then reads the
    /// transport directly, with no second buffer in front of it.
    pub fn into_split(self) -> (OwnedReadHalf<S>, OwnedWriteHalf<S>) {
        let (rewind, _) = self.io.into_parts();
        let (prefix, writer) = rewind.into_parts();
        let (stream, state) = writer.into_parts();
        let (read_half, write_half) = tokio::io::split(stream);

        (
            Rewind::new(prefix, read_half),
            OwnedWriteHalf {
                writer: Writer::from_parts(write_half, state),
            },
        )
    }
}

impl<S: Socket> AsyncRead for Connection<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_read(cx, buf)
    }
}

impl<S: Socket> AsyncWrite for Connection<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(self.get_mut().io.get_mut()).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(self.get_mut().io.get_mut()).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(self.get_mut().io.get_mut()).poll_shutdown(cx)
    }
}

/// Write side of a split connection.
pub struct OwnedWriteHalf<S> {
    writer: Writer<tokio::io::WriteHalf<S>>,
}

impl<S: Socket> OwnedWriteHalf<S> {
    pub async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf).await
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        self.writer.flush().await
    }

    /// Copies `src` into this half until `src` ends, flushing pending writes first.
    pub async fn read_from<R>(&mut self, src: &mut R) -> io::Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.writer.flush().await?;
        copy_stream(src, self.writer.get_mut()).await
    }

    /// Flushes pending writes and half-closes the write direction.
    pub async fn close_write(&mut self) -> io::Result<()> {
        self.writer.flush().await?;
        self.writer.get_mut().shutdown().await
    }
}

/// 复制数据直到读端结束，返回复制的字节数
async fn copy_stream<R, W>(reader: &mut R, writer: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut total = 0u64;
    let mut buf = vec![0u8; COPY_BUF_SIZE];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }

        // TLS 写入可能停留在会话缓冲中，每块都要刷出
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        total += n as u64;
    }

    Ok(total)
}
