/// 客户端：明文接入 → TLS 连接隧道服务器 → 双向转发
use std::future::Future;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::ClientConfig;
use crate::error::{Result, TunnelError};
use crate::server::{abort, peer_label};
use crate::tcp::{self, splice, Dialer, NetworkAddress, TcpConn, TcpServer, Transferred};
use crate::tls;

/// Everything a client connection needs to reach the tunnel server.
#[derive(Clone)]
struct Upstream {
    address: Arc<NetworkAddress>,
    server_name: ServerName<'static>,
    tls_config: Arc<rustls::ClientConfig>,
    dialer: Dialer,
}

/// 加载客户端 TLS 配置
pub fn load_tls_config(config: &ClientConfig) -> Result<Arc<rustls::ClientConfig>> {
    tls::load_client_config(
        config.root_ca.as_deref(),
        config.identity(),
        config.min_tls_version,
    )
    .map_err(|e| TunnelError::config_error(format!("{:#}", e)))
}

/// Starts accepting plaintext connections; the returned server keeps running until
/// closed.
pub async fn start_client(config: &ClientConfig) -> Result<TcpServer> {
    let address = config.remote_address()?;
    let server_name = ServerName::try_from(address.host.clone()).map_err(|e| {
        TunnelError::config_error(format!("Invalid server name '{}': {}", address.host, e))
    })?;

    let upstream = Upstream {
        address: Arc::new(address),
        server_name,
        tls_config: load_tls_config(config)?,
        dialer: config.dialer(),
    };
    let remote = upstream.address.address.clone();

    let mut server = TcpServer::new(config.server_options(), |e| {
        error!("Failed to accept connection: {}", e);
        false
    });

    server
        .start(&config.listen_addr, move |conn| {
            handle_connection(conn, upstream.clone())
        })
        .await?;

    info!(
        "Client listening on {}, tunnelling to {}",
        config.listen_addr, remote
    );
    Ok(server)
}

/// Runs the client until `shutdown` resolves.
pub async fn run_client<F>(config: ClientConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let mut server = start_client(&config).await?;

    shutdown.await;
    info!("Received shutdown signal, stopping client...");

    if let Err(e) = server.close(config.shutdown_grace()).await {
        warn!("Accept loop did not stop cleanly: {}", e);
    }

    info!("Client stopped");
    Ok(())
}

async fn handle_connection(conn: TcpConn, upstream: Upstream) {
    let span = info_span!("conn", client_ip = %peer_label(&conn));

    async move {
        match serve(conn, upstream).await {
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

async fn serve(conn: TcpConn, upstream: Upstream) -> Result<Transferred> {
    let remote = match upstream.dialer.dial(&upstream.address.address).await {
        Ok(remote) => remote,
        Err(e) => return Err(abort(conn, e)),
    };

    let mut remote =
        match tcp::tls::connect(remote, upstream.tls_config, upstream.server_name).await {
            Ok(remote) => remote,
            Err(e) => return Err(abort(conn, e.into())),
        };

    if let Err(e) = remote.handshake().await {
        return Err(abort(conn, abort(remote, e)));
    }
    debug!("TLS session to {} established", upstream.address.address);

    splice(conn, remote).await
}
