/// buggy 命令行入口
use anyhow::{Context, Result};
use buggy::cli::{Cli, Commands};
use buggy::config::{self, ClientConfig, ServerConfig};
use buggy::{client, server, tls};
use clap::Parser;
use std::path::Path;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // -v 指定级别；未指定时使用 RUST_LOG，默认 info
    let filter = match cli.verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    match cli.command {
        Commands::Server { config } => {
            info!("buggy server v{}", env!("CARGO_PKG_VERSION"));
            let config = ServerConfig::load(config.as_deref())
                .context("Failed to load server configuration")?;
            server::run_server(config, shutdown_signal()).await?;
        }
        Commands::Client { config } => {
            info!("buggy client v{}", env!("CARGO_PKG_VERSION"));
            let config = ClientConfig::load(config.as_deref())
                .context("Failed to load client configuration")?;
            client::run_client(config, shutdown_signal()).await?;
        }
        Commands::Check { config } => check_config(&config)?,
        Commands::Cert {
            cert_out,
            key_out,
            common_name,
            alt_names,
        } => {
            tls::generate_self_signed_cert(&common_name, &alt_names, &cert_out, &key_out)?;
            println!("Generated self-signed certificate: {}", cert_out.display());
            println!("Generated private key: {}", key_out.display());
        }
    }

    Ok(())
}

/// Check configuration file format
fn check_config(path: &Path) -> Result<()> {
    println!("Checking configuration file: {}\n", path.display());

    let (server, client) = config::check_config_file(path)?;

    if let Some(server) = server {
        println!("✓ [server]");
        println!("  Listen address:  {}", server.listen_addr);
        println!("  Certificate:     {}", server.server_cert.display());
        println!("  Private key:     {}", server.server_key.display());
        println!("  Client auth:     {}", server.client_auth);
        if let Some(ca) = &server.client_root_ca {
            println!("  Client root CA:  {}", ca.display());
        }
        println!("  Min TLS version: {}", server.min_tls_version);
    }

    if let Some(client) = client {
        println!("✓ [client]");
        println!("  Listen address:  {}", client.listen_addr);
        println!("  Remote URL:      {}", client.remote_url);
        match &client.root_ca {
            Some(ca) => println!("  Root CA:         {}", ca.display()),
            None => println!("  Root CA:         (system)"),
        }
        if let Some((cert, _)) = client.identity() {
            println!("  Client cert:     {}", cert.display());
        }
        println!("  Min TLS version: {}", client.min_tls_version);
    }

    println!("\nConfiguration is valid");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C"),
        () = terminate => info!("Received SIGTERM"),
    }
}
