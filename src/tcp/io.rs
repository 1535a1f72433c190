/// 带缓冲的读写封装
///
/// 读写两侧都可以指定缓冲大小，`0` 表示不缓冲，每次调用直接落到底层连接。
/// 不缓冲的 [`Reader::read_slice`] 逐字节读取，不会越过分隔符多读，隧道头解析
/// 依赖这一点把剩余数据完整交给双向转发。
///
/// 重新绑定底层连接（[`Reader::reset`]、[`Writer::reset`]）时保留缓冲配置；已经从
/// 旧连接读入缓冲的字节用 [`Rewind`] 连同旧连接一起交还，不会当作新连接的数据。
use bytes::{Buf, Bytes};
use std::io::{self, IoSlice};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::error::ProtocolError;

/// Upper bound of bytes scanned by [`Reader::read_slice`] looking for a delimiter.
pub const MAX_READ_SLICE_LENGTH: usize = 8 * 1024;

/// Mirrors bytes handed out by a reader, up to `limit`.
#[derive(Debug)]
struct Snapshot {
    bytes: Vec<u8>,
    limit: usize,
}

fn record_snapshot(snapshot: &mut Option<Snapshot>, data: &[u8]) -> io::Result<()> {
    let Some(snapshot) = snapshot.as_mut() else {
        return Ok(());
    };

    let room = snapshot.limit.saturating_sub(snapshot.bytes.len());
    if data.len() > room {
        snapshot.bytes.extend_from_slice(&data[..room]);
        return Err(ProtocolError::SnapshotFull {
            limit: snapshot.limit,
        }
        .into_io());
    }
    snapshot.bytes.extend_from_slice(data);
    Ok(())
}

/// Buffered read half bound to a transport `R`.
pub struct Reader<R> {
    inner: R,
    buf: Box<[u8]>,
    pos: usize,
    filled: usize,
    /// Scratch space for unbuffered `read_slice`
    line: Vec<u8>,
    max_slice_len: usize,
    snapshot: Option<Snapshot>,
}

/// Transport-independent part of a [`Reader`], kept across a rebind.
pub struct ReaderState {
    buf: Box<[u8]>,
    line: Vec<u8>,
    max_slice_len: usize,
    snapshot: Option<Snapshot>,
}

impl<R> Reader<R> {
    /// Creates a reader; `capacity == 0` makes it unbuffered.
    pub fn new(inner: R, capacity: usize) -> Self {
        Self {
            inner,
            buf: vec![0u8; capacity].into_boxed_slice(),
            pos: 0,
            filled: 0,
            line: Vec::new(),
            max_slice_len: MAX_READ_SLICE_LENGTH,
            snapshot: None,
        }
    }

    /// Overrides the delimiter scan limit (default [`MAX_READ_SLICE_LENGTH`]).
    pub fn with_max_slice_len(mut self, max_slice_len: usize) -> Self {
        self.max_slice_len = max_slice_len;
        self
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn is_buffered(&self) -> bool {
        !self.buf.is_empty()
    }

    pub fn max_slice_len(&self) -> usize {
        self.max_slice_len
    }

    /// Bytes read from the transport but not yet consumed.
    pub fn buffer(&self) -> &[u8] {
        &self.buf[self.pos..self.filled]
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Starts mirroring every byte returned by this reader, up to `limit` bytes.
    pub fn set_snapshot(&mut self, limit: usize) {
        self.snapshot = Some(Snapshot {
            bytes: Vec::new(),
            limit,
        });
    }

    /// Returns the mirrored bytes and stops mirroring.
    pub fn take_snapshot(&mut self) -> Vec<u8> {
        self.snapshot
            .take()
            .map(|snapshot| snapshot.bytes)
            .unwrap_or_default()
    }

    /// Detaches the transport. Unconsumed bytes travel with it as a [`Rewind`] prefix.
    pub fn into_parts(self) -> (Rewind<R>, ReaderState) {
        let prefix = Bytes::copy_from_slice(&self.buf[self.pos..self.filled]);
        let state = ReaderState {
            buf: self.buf,
            line: self.line,
            max_slice_len: self.max_slice_len,
            snapshot: self.snapshot,
        };
        (Rewind::new(prefix, self.inner), state)
    }

    /// Binds a detached state to a new transport, starting with an empty buffer.
    pub fn from_parts(inner: R, state: ReaderState) -> Self {
        Self {
            inner,
            buf: state.buf,
            pos: 0,
            filled: 0,
            line: state.line,
            max_slice_len: state.max_slice_len,
            snapshot: state.snapshot,
        }
    }

    /// Rebinds onto `inner`, keeping capacity and scan limit.
    ///
    /// Returns the previous transport with its unconsumed bytes in front of it.
    pub fn reset<R2>(self, inner: R2) -> (Reader<R2>, Rewind<R>) {
        let (old, state) = self.into_parts();
        (Reader::from_parts(inner, state), old)
    }
}

impl<R: AsyncRead + Unpin> Reader<R> {
    /// Compacts the buffer and reads more bytes into it.
    fn poll_fill_buf(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        if self.pos > 0 {
            self.buf.copy_within(self.pos..self.filled, 0);
            self.filled -= self.pos;
            self.pos = 0;
        }

        let mut read_buf = ReadBuf::new(&mut self.buf[self.filled..]);
        ready!(Pin::new(&mut self.inner).poll_read(cx, &mut read_buf))?;
        let n = read_buf.filled().len();
        self.filled += n;
        Poll::Ready(Ok(n))
    }

    async fn fill_buf(&mut self) -> io::Result<usize> {
        std::future::poll_fn(|cx| self.poll_fill_buf(cx)).await
    }

    /// One read call. End of stream is `Ok(0)`.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        AsyncReadExt::read(self, buf).await
    }

    /// Reads until `buf` is full or the stream ends; a short count means end of stream.
    pub async fn read_full(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut n = 0;
        while n < buf.len() {
            match self.read(&mut buf[n..]).await? {
                0 => break,
                read => n += read,
            }
        }
        Ok(n)
    }

    /// Appends everything up to end of stream to `buf`, returning the bytes appended.
    pub async fn read_all(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        let start = buf.len();
        loop {
            if buf.len() == buf.capacity() {
                // double the allocation each time it runs out
                buf.reserve(buf.capacity().max(512));
            }
            if self.read_buf(buf).await? == 0 {
                return Ok(buf.len() - start);
            }
        }
    }

    /// Reads up to and including `delim`.
    ///
    /// Fails with [`ProtocolError::LineTooLong`] when no delimiter shows up within the
    /// scan limit, and with `UnexpectedEof` when the stream ends first. The returned
    /// slice is only valid until the next read.
    pub async fn read_slice(&mut self, delim: u8) -> io::Result<&[u8]> {
        if !self.is_buffered() {
            return self.read_slice_unbuffered(delim).await;
        }

        let limit = self.max_slice_len.min(self.buf.len());
        let mut scanned = 0;
        loop {
            let window = &self.buf[self.pos..self.filled];
            if let Some(i) = window[scanned..].iter().position(|&b| b == delim) {
                let len = scanned + i + 1;
                if len > limit {
                    return Err(ProtocolError::LineTooLong { limit }.into_io());
                }
                let start = self.pos;
                self.pos += len;
                record_snapshot(&mut self.snapshot, &self.buf[start..self.pos])?;
                return Ok(&self.buf[start..start + len]);
            }

            scanned = window.len();
            if scanned >= limit {
                return Err(ProtocolError::LineTooLong { limit }.into_io());
            }

            if self.fill_buf().await? == 0 {
                return Err(unexpected_eof());
            }
        }
    }

    async fn read_slice_unbuffered(&mut self, delim: u8) -> io::Result<&[u8]> {
        let limit = self.max_slice_len;
        self.line.clear();

        loop {
            if self.line.len() >= limit {
                return Err(ProtocolError::LineTooLong { limit }.into_io());
            }

            let mut byte = [0u8; 1];
            if self.inner.read(&mut byte).await? == 0 {
                return Err(unexpected_eof());
            }
            self.line.push(byte[0]);

            if byte[0] == delim {
                record_snapshot(&mut self.snapshot, &self.line)?;
                return Ok(self.line.as_slice());
            }
        }
    }
}

fn unexpected_eof() -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "stream ended before delimiter",
    )
}

impl<R: AsyncRead + Unpin> AsyncRead for Reader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = out.filled().len();

        // Large reads skip the buffer when nothing is pending, like tokio's BufReader
        if this.pos == this.filled && (!this.is_buffered() || out.remaining() >= this.buf.len()) {
            ready!(Pin::new(&mut this.inner).poll_read(cx, out))?;
        } else {
            if this.pos == this.filled {
                ready!(this.poll_fill_buf(cx))?;
            }
            let available = &this.buf[this.pos..this.filled];
            let n = available.len().min(out.remaining());
            out.put_slice(&available[..n]);
            this.pos += n;
        }

        Poll::Ready(record_snapshot(
            &mut this.snapshot,
            &out.filled()[before..],
        ))
    }
}

impl<R: AsyncWrite + Unpin> AsyncWrite for Reader<R> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Buffered write half bound to a transport `W`.
pub struct Writer<W> {
    inner: W,
    buf: Vec<u8>,
    /// Bytes at the front of `buf` already accepted by the transport
    written: usize,
    capacity: usize,
}

/// Transport-independent part of a [`Writer`], including bytes not yet flushed.
pub struct WriterState {
    buf: Vec<u8>,
    capacity: usize,
}

impl<W> Writer<W> {
    /// Creates a writer; `capacity == 0` makes it unbuffered.
    pub fn new(inner: W, capacity: usize) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(capacity),
            written: 0,
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_buffered(&self) -> bool {
        self.capacity > 0
    }

    /// Bytes waiting for the next flush.
    pub fn buffer(&self) -> &[u8] {
        &self.buf[self.written..]
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Detaches the transport. Unflushed bytes stay in the state and go to whichever
    /// transport it is bound to next.
    pub fn into_parts(mut self) -> (W, WriterState) {
        self.buf.drain(..self.written);
        let state = WriterState {
            buf: self.buf,
            capacity: self.capacity,
        };
        (self.inner, state)
    }

    pub fn from_parts(inner: W, state: WriterState) -> Self {
        Self {
            inner,
            buf: state.buf,
            written: 0,
            capacity: state.capacity,
        }
    }
}

impl<W: AsyncWrite + Unpin> Writer<W> {
    fn poll_flush_buf(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut ret = Ok(());
        while self.written < self.buf.len() {
            match ready!(Pin::new(&mut self.inner).poll_write(cx, &self.buf[self.written..])) {
                Ok(0) => {
                    ret = Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write the buffered data",
                    ));
                    break;
                }
                Ok(n) => self.written += n,
                Err(e) => {
                    ret = Err(e);
                    break;
                }
            }
        }
        if self.written > 0 {
            self.buf.drain(..self.written);
        }
        self.written = 0;
        Poll::Ready(ret)
    }

    pub async fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        AsyncWriteExt::write(self, data).await
    }

    /// 批量写入多个缓冲区，返回写入的总字节数
    ///
    /// 写缓冲放得下时只追加到缓冲；否则先刷出已缓冲的数据，再用 `write_vectored`
    /// 直接写入底层连接，减少系统调用次数。
    pub async fn write_vectored_all(&mut self, bufs: &[&[u8]]) -> io::Result<usize> {
        let total: usize = bufs.iter().map(|buf| buf.len()).sum();

        if self.is_buffered() && self.buf.len() + total <= self.capacity {
            for buf in bufs {
                self.buf.extend_from_slice(buf);
            }
            return Ok(total);
        }

        std::future::poll_fn(|cx| self.poll_flush_buf(cx)).await?;

        // 当前缓冲区下标和其中已写入的偏移
        let (mut idx, mut offset) = (0, 0);
        let mut remaining = total;
        while remaining > 0 {
            let slices: Vec<IoSlice<'_>> = std::iter::once(&bufs[idx][offset..])
                .chain(bufs[idx + 1..].iter().copied())
                .filter(|buf| !buf.is_empty())
                .map(IoSlice::new)
                .collect();

            let mut n = match self.inner.write_vectored(&slices).await {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write vectored data",
                    ))
                }
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            remaining -= n;

            // 跳过已写入的字节，可能停在某个缓冲区中间
            while n > 0 {
                let left = bufs[idx].len() - offset;
                if n < left {
                    offset += n;
                    n = 0;
                } else {
                    n -= left;
                    idx += 1;
                    offset = 0;
                }
            }
        }

        Ok(total)
    }

    /// Drains the buffer into the transport and flushes it.
    pub async fn flush(&mut self) -> io::Result<()> {
        AsyncWriteExt::flush(self).await
    }

    /// Flushes pending bytes to the current transport, then rebinds onto `inner`.
    ///
    /// Returns the previous transport.
    pub async fn reset<W2>(mut self, inner: W2) -> io::Result<(Writer<W2>, W)> {
        self.flush().await?;
        let (old, state) = self.into_parts();
        Ok((Writer::from_parts(inner, state), old))
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for Writer<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if !this.is_buffered() {
            return Pin::new(&mut this.inner).poll_write(cx, data);
        }

        if this.buf.len() + data.len() > this.capacity {
            ready!(this.poll_flush_buf(cx))?;
        }

        if data.len() >= this.capacity {
            Pin::new(&mut this.inner).poll_write(cx, data)
        } else {
            this.buf.extend_from_slice(data);
            Poll::Ready(Ok(data.len()))
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_flush_buf(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_flush_buf(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

impl<W: AsyncRead + Unpin> AsyncRead for Writer<W> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

/// A transport with already-read bytes replayed in front of it.
#[derive(Debug)]
pub struct Rewind<T> {
    prefix: Bytes,
    inner: T,
}

impl<T> Rewind<T> {
    pub fn new(prefix: Bytes, inner: T) -> Self {
        Self { prefix, inner }
    }

    /// Bytes still to be replayed before reading from the transport.
    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    pub fn into_parts(self) -> (Bytes, T) {
        (self.prefix, self.inner)
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Rewind<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.prefix.is_empty() {
            return Pin::new(&mut this.inner).poll_read(cx, out);
        }

        let n = this.prefix.len().min(out.remaining());
        out.put_slice(&this.prefix[..n]);
        this.prefix.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Rewind<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
