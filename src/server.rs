/// 服务端：TLS 接入 → CONNECT 隧道 → 连接目标 → 双向转发
use std::future::Future;
use std::sync::Arc;

use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::ServerConfig;
use crate::error::{Result, TunnelError};
use crate::tcp::{self, splice, tunnel, Connection, Dialer, Socket, TcpConn, TcpServer, Transferred};
use crate::tls;

/// Tears `conn` down with a reset and hands `err` back.
pub(crate) fn abort<S: Socket>(conn: Connection<S>, err: TunnelError) -> TunnelError {
    if let Err(e) = conn.reset() {
        debug!("Failed to reset connection: {}", e);
    }
    err
}

pub(crate) fn peer_label<S: Socket>(conn: &Connection<S>) -> String {
    conn.peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// 加载服务器 TLS 配置
pub fn load_tls_config(config: &ServerConfig) -> Result<Arc<rustls::ServerConfig>> {
    tls::load_server_config(
        &config.server_cert,
        &config.server_key,
        config.client_root_ca.as_deref(),
        config.client_auth,
        config.min_tls_version,
    )
    .map_err(|e| TunnelError::config_error(format!("{:#}", e)))
}

/// Starts accepting tunnel connections; the returned server keeps running until closed.
pub async fn start_server(config: &ServerConfig) -> Result<TcpServer> {
    let tls_config = load_tls_config(config)?;
    let dialer = config.dialer();

    let mut server = TcpServer::new(config.server_options(), |e| {
        error!("Failed to accept connection: {}", e);
        false
    });

    server
        .start(&config.listen_addr, move |conn| {
            handle_connection(conn, tls_config.clone(), dialer)
        })
        .await?;

    info!(
        "Server listening on {} (client auth: {}, min TLS {})",
        config.listen_addr, config.client_auth, config.min_tls_version
    );
    Ok(server)
}

/// Runs the server until `shutdown` resolves.
pub async fn run_server<F>(config: ServerConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let mut server = start_server(&config).await?;

    shutdown.await;
    info!("Received shutdown signal, stopping server...");

    if let Err(e) = server.close(config.shutdown_grace()).await {
        warn!("Accept loop did not stop cleanly: {}", e);
    }

    info!("Server stopped");
    Ok(())
}

async fn handle_connection(conn: TcpConn, tls_config: Arc<rustls::ServerConfig>, dialer: Dialer) {
    let span = info_span!("conn", client_ip = %peer_label(&conn));

    async move {
        match serve(conn, tls_config, dialer).await {
            Ok(transferred) => debug!(
                "Tunnel closed ({} bytes up, {} bytes down)",
                transferred.a_to_b, transferred.b_to_a
            ),
            Err(e) => error!("Connection error: {}", e),
        }
    }
    .instrument(span)
    .await
}

async fn serve(
    conn: TcpConn,
    tls_config: Arc<rustls::ServerConfig>,
    dialer: Dialer,
) -> Result<Transferred> {
    let mut conn = tcp::tls::bind(conn, tls_config).await?;

    if let Err(e) = conn.handshake().await {
        return Err(abort(conn, e));
    }
    debug!(
        client_cert = conn.has_peer_certificate(),
        "TLS handshake complete"
    );

    let request = match tunnel::accept(&mut conn).await {
        Ok(request) => request,
        Err(e) => return Err(abort(conn, e)),
    };

    let upstream = match dialer.dial(&request.target).await {
        Ok(upstream) => upstream,
        Err(e) => return Err(abort(conn, e)),
    };

    info!("Tunnel established to {}", request.target);
    splice(conn, upstream).await
}
