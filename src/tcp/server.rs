/// TCP 监听服务
///
/// 每个接入的连接包装成 [`TcpConn`]，在独立任务中交给回调处理。
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::conn::{Connection, TcpConn};
use crate::error::{Result, TunnelError};

/// Settings applied to every accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerOptions {
    pub tcp_nodelay: bool,
    pub reader_buf_size: usize,
    pub writer_buf_size: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            reader_buf_size: 8192,
            writer_buf_size: 8192,
        }
    }
}

type AcceptErrorHandler = Arc<dyn Fn(&io::Error) -> bool + Send + Sync>;

/// Accept loop with cooperative shutdown.
pub struct TcpServer {
    options: ServerOptions,
    on_accept_error: AcceptErrorHandler,
    shutdown: CancellationToken,
    local_addr: Option<SocketAddr>,
    accept_loop: Option<JoinHandle<()>>,
}

impl TcpServer {
    /// `on_accept_error` sees every failed accept; returning `true` ends the loop.
    pub fn new<E>(options: ServerOptions, on_accept_error: E) -> Self
    where
        E: Fn(&io::Error) -> bool + Send + Sync + 'static,
    {
        Self {
            options,
            on_accept_error: Arc::new(on_accept_error),
            shutdown: CancellationToken::new(),
            local_addr: None,
            accept_loop: None,
        }
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Binds `addr` and starts accepting in the background.
    ///
    /// A server starts at most once; later calls fail with a configuration error.
    pub async fn start<F, Fut>(&mut self, addr: &str, on_connect: F) -> Result<SocketAddr>
    where
        F: Fn(TcpConn) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.local_addr.is_some() {
            return Err(TunnelError::config_error("server already started"));
        }

        let listener = TcpListener::bind(addr).await.map_err(|e| {
            TunnelError::Io(io::Error::new(
                e.kind(),
                format!("failed to listen on {}: {}", addr, e),
            ))
        })?;
        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);

        info!("Listening on {}", local_addr);

        self.accept_loop = Some(tokio::spawn(accept_loop(
            listener,
            self.options,
            Arc::new(on_connect),
            self.on_accept_error.clone(),
            self.shutdown.clone(),
        )));

        Ok(local_addr)
    }

    /// Asks the accept loop to exit. Connections already handed out keep running.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Stops the accept loop and waits up to `grace` for it to finish; after that the
    /// loop task is aborted. The listener is released either way.
    pub async fn close(&mut self, grace: Duration) -> Result<()> {
        self.stop();

        let Some(mut handle) = self.accept_loop.take() else {
            return Ok(());
        };

        match tokio::time::timeout(grace, &mut handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TunnelError::Io(io::Error::other(e))),
            Err(_) => {
                handle.abort();
                Err(TunnelError::timeout(grace))
            }
        }
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop<F, Fut>(
    listener: TcpListener,
    options: ServerOptions,
    on_connect: Arc<F>,
    on_accept_error: AcceptErrorHandler,
    shutdown: CancellationToken,
) where
    F: Fn(TcpConn) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                debug!("Accept loop stopped");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        if let Err(e) = stream.set_nodelay(options.tcp_nodelay) {
                            warn!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
                        }

                        debug!("Accepted connection from {}", peer_addr);
                        let conn = Connection::new(
                            stream,
                            options.reader_buf_size,
                            options.writer_buf_size,
                        );
                        let on_connect = on_connect.clone();
                        tokio::spawn(async move { on_connect(conn).await });
                    }
                    Err(e) => {
                        if on_accept_error(&e) {
                            break;
                        }
                    }
                }
            }
        }
    }
}
