/// 双向转发
///
/// 两个方向各跑一个任务，结果通过 `JoinSet` 汇总。先结束的方向先半关闭其目的端，
/// 出错则立即返回，`JoinSet` 被丢弃时会中止另一个方向的任务。
use std::fmt;
use std::io;

use tokio::io::AsyncRead;
use tokio::task::JoinSet;
use tracing::debug;

use super::conn::{Connection, OwnedWriteHalf, Socket};
use crate::error::Result;

/// Relay direction between the two spliced connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    AToB,
    BToA,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AToB => f.write_str("a->b"),
            Self::BToA => f.write_str("b->a"),
        }
    }
}

/// Bytes relayed in each direction by a finished session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transferred {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

impl Transferred {
    fn record(&mut self, direction: Direction, bytes: u64) {
        match direction {
            Direction::AToB => self.a_to_b = bytes,
            Direction::BToA => self.b_to_a = bytes,
        }
    }
}

/// Write half a direction copied into.
enum Destination<A, B> {
    A(OwnedWriteHalf<A>),
    B(OwnedWriteHalf<B>),
}

impl<A: Socket, B: Socket> Destination<A, B> {
    async fn close_write(&mut self) -> io::Result<()> {
        match self {
            Self::A(half) => half.close_write().await,
            Self::B(half) => half.close_write().await,
        }
    }
}

struct Outcome<A, B> {
    direction: Direction,
    result: io::Result<u64>,
    dst: Destination<A, B>,
}

async fn relay<R, A, B>(
    direction: Direction,
    mut src: R,
    mut dst: Destination<A, B>,
) -> Outcome<A, B>
where
    R: AsyncRead + Unpin,
    A: Socket,
    B: Socket,
{
    let result = match &mut dst {
        Destination::A(half) => half.read_from(&mut src).await,
        Destination::B(half) => half.read_from(&mut src).await,
    };
    Outcome {
        direction,
        result,
        dst,
    }
}

fn start<A: Socket, B: Socket>(a: Connection<A>, b: Connection<B>) -> JoinSet<Outcome<A, B>> {
    let (a_read, a_write) = a.into_split();
    let (b_read, b_write) = b.into_split();

    let mut tasks = JoinSet::new();
    tasks.spawn(relay(Direction::AToB, a_read, Destination::B(b_write)));
    tasks.spawn(relay(Direction::BToA, b_read, Destination::A(a_write)));
    tasks
}

async fn next_outcome<A, B>(tasks: &mut JoinSet<Outcome<A, B>>) -> io::Result<Outcome<A, B>>
where
    A: 'static,
    B: 'static,
{
    match tasks.join_next().await {
        Some(Ok(outcome)) => Ok(outcome),
        Some(Err(e)) => Err(io::Error::other(e)),
        None => Err(io::Error::other("relay task missing")),
    }
}

async fn close_destination<A: Socket, B: Socket>(outcome: &mut Outcome<A, B>) {
    if let Err(e) = outcome.dst.close_write().await {
        debug!("Half-close after {} failed: {}", outcome.direction, e);
    }
}

/// Relays `a` and `b` in both directions until both directions have ended.
///
/// When one direction reaches end of stream its destination is half-closed, so the
/// other peer sees the end of stream too. The first error ends the session; the
/// remaining direction is aborted.
pub async fn splice<A: Socket, B: Socket>(a: Connection<A>, b: Connection<B>) -> Result<Transferred> {
    let mut tasks = start(a, b);
    let mut transferred = Transferred::default();

    let mut first = next_outcome(&mut tasks).await?;
    close_destination(&mut first).await;
    transferred.record(first.direction, first.result?);

    let mut second = next_outcome(&mut tasks).await?;
    close_destination(&mut second).await;
    transferred.record(second.direction, second.result?);

    Ok(transferred)
}

/// Relays `a` and `b` in both directions without half-closing in between.
///
/// Returns the first error, or the byte counts once both directions have ended.
pub async fn pipe<A: Socket, B: Socket>(a: Connection<A>, b: Connection<B>) -> Result<Transferred> {
    let mut tasks = start(a, b);
    let mut transferred = Transferred::default();

    for _ in 0..2 {
        let outcome = next_outcome(&mut tasks).await?;
        transferred.record(outcome.direction, outcome.result?);
    }

    Ok(transferred)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_splice_both_ways_with_half_close() {
        let (a_end, mut peer_a) = tokio::io::duplex(4096);
        let (b_end, mut peer_b) = tokio::io::duplex(4096);

        let session = tokio::spawn(splice(
            Connection::new(a_end, 0, 8192),
            Connection::new(b_end, 8192, 0),
        ));

        peer_a.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        peer_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        peer_b.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        peer_a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        // a finishes sending: b sees end of stream but can still answer
        peer_a.shutdown().await.unwrap();
        let mut rest = Vec::new();
        peer_b.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        peer_b.write_all(b"bye").await.unwrap();
        peer_b.shutdown().await.unwrap();
        let mut rest = Vec::new();
        peer_a.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"bye");

        let transferred = session.await.unwrap().unwrap();
        assert_eq!(
            transferred,
            Transferred {
                a_to_b: 4,
                b_to_a: 8
            }
        );
    }

    #[tokio::test]
    async fn test_splice_forwards_buffered_bytes() {
        let (a_end, mut peer_a) = tokio::io::duplex(4096);
        let (b_end, mut peer_b) = tokio::io::duplex(4096);

        peer_a.write_all(b"CONNECT x:1 HTTP/1.1\r\n\r\nhello").await.unwrap();
        peer_a.shutdown().await.unwrap();

        let mut a = Connection::new(a_end, 4096, 0);
        crate::tcp::tunnel::accept(&mut a).await.unwrap();
        assert_eq!(a.reader().buffer(), b"hello");

        let session = tokio::spawn(splice(a, Connection::new(b_end, 0, 0)));

        let mut received = Vec::new();
        peer_b.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"hello");

        drop(peer_b);
        let mut reply = Vec::new();
        peer_a.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, crate::tcp::tunnel::PROXY_RESPONSE);

        let transferred = session.await.unwrap().unwrap();
        assert_eq!(transferred.a_to_b, 5);
    }

    #[tokio::test]
    async fn test_splice_reports_write_error() {
        let (a_end, mut peer_a) = tokio::io::duplex(4096);
        let (b_end, peer_b) = tokio::io::duplex(4096);
        drop(peer_b);

        let session = tokio::spawn(splice(
            Connection::new(a_end, 0, 0),
            Connection::new(b_end, 0, 0),
        ));

        peer_a.write_all(b"nobody listens").await.unwrap();

        let err = session.await.unwrap().unwrap_err();
        assert!(matches!(err, crate::TunnelError::Io(_)));
    }

    #[tokio::test]
    async fn test_pipe_both_ways() {
        let (a_end, mut peer_a) = tokio::io::duplex(4096);
        let (b_end, mut peer_b) = tokio::io::duplex(4096);

        let session = tokio::spawn(pipe(
            Connection::new(a_end, 0, 0),
            Connection::new(b_end, 0, 0),
        ));

        peer_a.write_all(b"up").await.unwrap();
        peer_b.write_all(b"down").await.unwrap();

        let mut buf = [0u8; 2];
        peer_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"up");
        let mut buf = [0u8; 4];
        peer_a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"down");

        peer_a.shutdown().await.unwrap();
        peer_b.shutdown().await.unwrap();

        let transferred = session.await.unwrap().unwrap();
        assert_eq!(transferred.a_to_b, 2);
        assert_eq!(transferred.b_to_a, 4);
    }
}
