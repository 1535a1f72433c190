/// 在已有连接上原地升级 TLS
///
/// [`connect`] / [`bind`] 只重新绑定读写缓冲，握手要显式调用
/// [`Connection::handshake`]。握手完成前的读写返回 `NotConnected`。
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::{Accept, Connect, TlsAcceptor, TlsConnector};

use super::conn::{Connection, Socket};
use super::io::{Reader, Rewind, Writer};
use crate::error::{Result, TunnelError};

enum State<IO> {
    ClientHandshake(Connect<IO>),
    ServerHandshake(Accept<IO>),
    Streaming(tokio_rustls::TlsStream<IO>),
    /// The handshake failed; only the transport is left
    Failed(IO),
    /// The handshake future was dropped before finishing
    Lost,
}

/// TLS record layer over `IO`, with the handshake deferred.
pub struct TlsStream<IO> {
    state: State<IO>,
}

fn not_connected(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, msg)
}

impl<IO> TlsStream<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    fn client(connect: Connect<IO>) -> Self {
        Self {
            state: State::ClientHandshake(connect),
        }
    }

    fn server(accept: Accept<IO>) -> Self {
        Self {
            state: State::ServerHandshake(accept),
        }
    }

    /// The transport under the TLS layer.
    pub fn get_ref(&self) -> Option<&IO> {
        match &self.state {
            State::ClientHandshake(connect) => connect.get_ref(),
            State::ServerHandshake(accept) => accept.get_ref(),
            State::Streaming(stream) => Some(stream.get_ref().0),
            State::Failed(io) => Some(io),
            State::Lost => None,
        }
    }

    pub fn get_mut(&mut self) -> Option<&mut IO> {
        match &mut self.state {
            State::ClientHandshake(connect) => connect.get_mut(),
            State::ServerHandshake(accept) => accept.get_mut(),
            State::Streaming(stream) => Some(stream.get_mut().0),
            State::Failed(io) => Some(io),
            State::Lost => None,
        }
    }

    pub fn is_handshake_complete(&self) -> bool {
        matches!(self.state, State::Streaming(_))
    }

    /// Whether the peer presented a certificate chain during the handshake.
    pub fn has_peer_certificate(&self) -> bool {
        match &self.state {
            State::Streaming(stream) => stream
                .get_ref()
                .1
                .peer_certificates()
                .is_some_and(|certs| !certs.is_empty()),
            _ => false,
        }
    }

    /// Runs the handshake. Calling it again after success is a no-op.
    pub async fn handshake(&mut self) -> io::Result<()> {
        let result = match std::mem::replace(&mut self.state, State::Lost) {
            State::ClientHandshake(connect) => connect
                .into_fallible()
                .await
                .map(tokio_rustls::TlsStream::from),
            State::ServerHandshake(accept) => accept
                .into_fallible()
                .await
                .map(tokio_rustls::TlsStream::from),
            State::Streaming(stream) => Ok(stream),
            State::Failed(io) => {
                self.state = State::Failed(io);
                return Err(not_connected("TLS handshake already failed"));
            }
            State::Lost => return Err(not_connected("TLS handshake was interrupted")),
        };

        match result {
            Ok(stream) => {
                self.state = State::Streaming(stream);
                Ok(())
            }
            Err((err, io)) => {
                self.state = State::Failed(io);
                Err(err)
            }
        }
    }
}

impl<IO: Socket> Socket for TlsStream<IO> {
    fn set_abortive_close(&self) -> io::Result<()> {
        match self.get_ref() {
            Some(io) => io.set_abortive_close(),
            None => Err(not_connected("TLS transport lost")),
        }
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self.get_ref() {
            Some(io) => io.peer_addr(),
            None => Err(not_connected("TLS transport lost")),
        }
    }
}

impl<IO> AsyncRead for TlsStream<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().state {
            State::Streaming(stream) => Pin::new(stream).poll_read(cx, buf),
            _ => Poll::Ready(Err(not_connected("TLS handshake not performed"))),
        }
    }
}

impl<IO> AsyncWrite for TlsStream<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().state {
            State::Streaming(stream) => Pin::new(stream).poll_write(cx, buf),
            _ => Poll::Ready(Err(not_connected("TLS handshake not performed"))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().state {
            State::Streaming(stream) => Pin::new(stream).poll_flush(cx),
            // nothing can be pending before the handshake
            _ => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let State::Streaming(stream) = &mut this.state {
            return Pin::new(stream).poll_shutdown(cx);
        }
        match this.get_mut() {
            Some(io) => Pin::new(io).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

/// Moves a connection onto a new transport built from the old one.
///
/// Pending writes are flushed to the old transport first, unconsumed reads are replayed
/// underneath the new one, and both buffer configurations carry over.
async fn rebind<S, T, F>(conn: Connection<S>, wrap: F) -> io::Result<Connection<T>>
where
    S: Socket,
    F: FnOnce(Rewind<S>) -> T,
{
    let mut io = conn.into_io();
    io.get_mut().flush().await?;

    let (rewind, reader_state) = io.into_parts();
    let (prefix, writer) = rewind.into_parts();
    let (stream, writer_state) = writer.into_parts();

    let upgraded = wrap(Rewind::new(prefix, stream));
    Ok(Connection::from_io(Reader::from_parts(
        Writer::from_parts(upgraded, writer_state),
        reader_state,
    )))
}

/// Client role: prepares a TLS session towards `server_name`.
pub async fn connect<S: Socket>(
    conn: Connection<S>,
    config: Arc<rustls::ClientConfig>,
    server_name: ServerName<'static>,
) -> io::Result<Connection<TlsStream<Rewind<S>>>> {
    let connector = TlsConnector::from(config);
    rebind(conn, |io| TlsStream::client(connector.connect(server_name, io))).await
}

/// Server role: prepares a TLS session answering with `config`.
pub async fn bind<S: Socket>(
    conn: Connection<S>,
    config: Arc<rustls::ServerConfig>,
) -> io::Result<Connection<TlsStream<Rewind<S>>>> {
    let acceptor = TlsAcceptor::from(config);
    rebind(conn, |io| TlsStream::server(acceptor.accept(io))).await
}

impl<S: Socket> Connection<TlsStream<S>> {
    /// Performs the TLS handshake; failures are reported as [`TunnelError::Tls`].
    pub async fn handshake(&mut self) -> Result<()> {
        self.get_mut().handshake().await.map_err(TunnelError::Tls)
    }

    pub fn is_handshake_complete(&self) -> bool {
        self.get_ref().is_handshake_complete()
    }

    pub fn has_peer_certificate(&self) -> bool {
        self.get_ref().has_peer_certificate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::{build_client_config, build_server_config, ClientAuth, TlsVersion};
    use rustls::pki_types::{CertificateDer, PrivateKeyDer};
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::sync::oneshot;

    struct TestPki {
        cert: CertificateDer<'static>,
        key: PrivateKeyDer<'static>,
    }

    impl TestPki {
        fn new() -> Self {
            let generated =
                rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
            Self {
                cert: generated.cert.der().clone(),
                key: PrivateKeyDer::Pkcs8(generated.signing_key.serialize_der().into()),
            }
        }

        fn roots(&self) -> rustls::RootCertStore {
            let mut roots = rustls::RootCertStore::empty();
            roots.add(self.cert.clone()).unwrap();
            roots
        }

        fn server_config(&self, client_auth: ClientAuth) -> Arc<rustls::ServerConfig> {
            build_server_config(
                vec![self.cert.clone()],
                self.key.clone_key(),
                Some(self.roots()),
                client_auth,
                TlsVersion::Tls13,
            )
            .unwrap()
        }

        fn client_config(&self, with_identity: bool) -> Arc<rustls::ClientConfig> {
            let identity = with_identity.then(|| (vec![self.cert.clone()], self.key.clone_key()));
            build_client_config(self.roots(), identity, TlsVersion::Tls12).unwrap()
        }
    }

    fn server_name() -> ServerName<'static> {
        ServerName::try_from("localhost").unwrap()
    }

    #[tokio::test]
    async fn test_io_before_handshake_is_not_connected() {
        let pki = TestPki::new();
        let (local, _peer) = tokio::io::duplex(4096);
        let conn = Connection::new(local, 0, 0);

        let mut tls = connect(conn, pki.client_config(false), server_name())
            .await
            .unwrap();
        assert!(!tls.is_handshake_complete());

        let err = tls.write(b"early").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);

        let mut buf = [0u8; 8];
        let err = tls.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_upgrade_replays_buffered_bytes() {
        let pki = TestPki::new();
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let client_config = pki.client_config(true);
        let (done_tx, done_rx) = oneshot::channel::<()>();

        let client = tokio::spawn(async move {
            // plaintext preamble stays in the write buffer until the upgrade flushes it
            let mut conn = Connection::new(client_io, 0, 4096);
            conn.write(b"STARTTLS\n").await.unwrap();

            let mut tls = connect(conn, client_config, server_name()).await.unwrap();
            tls.handshake().await.unwrap();
            tls.write(b"secret").await.unwrap();
            tls.close_write().await.unwrap();

            // the server still writes session tickets after our handshake ends
            let _ = done_rx.await;
        });

        // let the preamble and the ClientHello arrive together
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut conn = Connection::new(server_io, 4096, 0);
        assert_eq!(conn.read_slice(b'\n').await.unwrap(), b"STARTTLS\n");
        assert!(!conn.reader().buffer().is_empty());

        let mut tls = bind(conn, pki.server_config(ClientAuth::Required))
            .await
            .unwrap();
        tls.handshake().await.unwrap();
        assert!(tls.has_peer_certificate());

        let mut received = Vec::new();
        tls.read_all(&mut received).await.unwrap();
        assert_eq!(received, b"secret");

        done_tx.send(()).unwrap();
        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_optional_client_auth_accepts_anonymous() {
        let pki = TestPki::new();
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let client_config = pki.client_config(false);
        let (done_tx, done_rx) = oneshot::channel::<()>();

        let client = tokio::spawn(async move {
            let conn = Connection::new(client_io, 0, 0);
            let mut tls = connect(conn, client_config, server_name()).await.unwrap();
            tls.handshake().await.unwrap();
            tls.write(b"hi").await.unwrap();
            tls.flush().await.unwrap();

            let _ = done_rx.await;
            tls.close().await.unwrap();
        });

        let conn = Connection::new(server_io, 0, 0);
        let mut tls = bind(conn, pki.server_config(ClientAuth::Optional))
            .await
            .unwrap();
        tls.handshake().await.unwrap();
        assert!(!tls.has_peer_certificate());

        let mut buf = [0u8; 2];
        tls.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");

        done_tx.send(()).unwrap();
        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_untrusted_server_fails_handshake() {
        let server_pki = TestPki::new();
        let client_pki = TestPki::new();
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let server_config = server_pki.server_config(ClientAuth::None);

        tokio::spawn(async move {
            let conn = Connection::new(server_io, 0, 0);
            let mut tls = bind(conn, server_config).await.unwrap();
            let _ = tls.handshake().await;
        });

        let conn = Connection::new(client_io, 0, 0);
        let mut tls = connect(conn, client_pki.client_config(false), server_name())
            .await
            .unwrap();
        let err = tls.handshake().await.unwrap_err();
        assert!(err.is_tls());

        // the transport survives for teardown
        assert!(tls.get_ref().get_ref().is_some());
        assert!(tls.handshake().await.is_err());
    }
}
