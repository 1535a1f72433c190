/// TLS 配置
///
/// 证书和私钥加载、客户端证书策略、最低协议版本以及自签名证书生成
use anyhow::{bail, Context, Result};
use rcgen::generate_simple_self_signed;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

/// 客户端证书校验策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientAuth {
    /// 不请求客户端证书
    None,
    /// 客户端提供证书时校验，不提供也允许连接
    #[default]
    Optional,
    /// 必须提供有效的客户端证书
    Required,
}

impl FromStr for ClientAuth {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "optional" => Ok(Self::Optional),
            "required" => Ok(Self::Required),
            other => Err(format!(
                "invalid client auth policy '{}', expected none, optional or required",
                other
            )),
        }
    }
}

impl fmt::Display for ClientAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Optional => f.write_str("optional"),
            Self::Required => f.write_str("required"),
        }
    }
}

/// 最低 TLS 版本
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TlsVersion {
    #[serde(rename = "1.2")]
    Tls12,
    #[serde(rename = "1.3")]
    Tls13,
}

impl TlsVersion {
    fn protocol_versions(self) -> &'static [&'static rustls::SupportedProtocolVersion] {
        static TLS12_AND_UP: &[&rustls::SupportedProtocolVersion] =
            &[&rustls::version::TLS13, &rustls::version::TLS12];
        static TLS13_ONLY: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS13];

        match self {
            Self::Tls12 => TLS12_AND_UP,
            Self::Tls13 => TLS13_ONLY,
        }
    }
}

impl FromStr for TlsVersion {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().trim_start_matches(['v', 'V']) {
            "1.2" => Ok(Self::Tls12),
            "1.3" => Ok(Self::Tls13),
            other => Err(format!(
                "unsupported TLS version '{}', expected 1.2 or 1.3",
                other
            )),
        }
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tls12 => f.write_str("1.2"),
            Self::Tls13 => f.write_str("1.3"),
        }
    }
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// 读取 PEM 证书链
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let cert_file =
        File::open(path).with_context(|| format!("Failed to open cert file: {:?}", path))?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs: Vec<CertificateDer> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse certificates in {:?}", path))?;

    if certs.is_empty() {
        bail!("No certificate found in {:?}", path);
    }
    Ok(certs)
}

/// 读取 PEM 私钥
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let key_file =
        File::open(path).with_context(|| format!("Failed to open key file: {:?}", path))?;
    let mut key_reader = BufReader::new(key_file);

    rustls_pemfile::private_key(&mut key_reader)
        .with_context(|| format!("Failed to parse private key in {:?}", path))?
        .with_context(|| format!("No private key found in {:?}", path))
}

/// 读取 CA 证书作为信任根
pub fn load_root_store(path: &Path) -> Result<rustls::RootCertStore> {
    let mut root_store = rustls::RootCertStore::empty();
    for cert in load_certs(path)? {
        root_store
            .add(cert)
            .context("Failed to add CA certificate")?;
    }
    Ok(root_store)
}

/// 系统 CA 证书
fn native_root_store() -> rustls::RootCertStore {
    let mut root_store = rustls::RootCertStore::empty();
    let native_certs = rustls_native_certs::load_native_certs();
    for err in &native_certs.errors {
        tracing::warn!("Failed to load a native certificate: {}", err);
    }
    for cert in native_certs.certs {
        root_store.add(cert).ok();
    }
    root_store
}

/// 加载服务器 TLS 配置
pub fn load_server_config(
    cert_path: &Path,
    key_path: &Path,
    client_ca_path: Option<&Path>,
    client_auth: ClientAuth,
    min_version: TlsVersion,
) -> Result<Arc<rustls::ServerConfig>> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;
    let client_roots = client_ca_path.map(load_root_store).transpose()?;

    build_server_config(certs, key, client_roots, client_auth, min_version)
}

/// 用已解析的证书和私钥创建服务器 TLS 配置
pub fn build_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    client_roots: Option<rustls::RootCertStore>,
    client_auth: ClientAuth,
    min_version: TlsVersion,
) -> Result<Arc<rustls::ServerConfig>> {
    let builder = rustls::ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(min_version.protocol_versions())
        .context("Failed to select TLS protocol versions")?;

    let builder = match (client_auth, client_roots) {
        (ClientAuth::None, _) => builder.with_no_client_auth(),
        (policy, Some(roots)) => {
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider());
            let verifier = if policy == ClientAuth::Optional {
                verifier.allow_unauthenticated()
            } else {
                verifier
            };
            builder.with_client_cert_verifier(
                verifier
                    .build()
                    .context("Failed to create client certificate verifier")?,
            )
        }
        (policy, None) => bail!("Client auth policy '{}' requires a client root CA", policy),
    };

    let config = builder
        .with_single_cert(certs, key)
        .context("Failed to create server config")?;

    Ok(Arc::new(config))
}

/// 加载客户端 TLS 配置
///
/// 未指定 CA 时使用系统证书；`identity` 为 `(证书, 私钥)` 路径，用于双向认证。
pub fn load_client_config(
    ca_cert_path: Option<&Path>,
    identity: Option<(&Path, &Path)>,
    min_version: TlsVersion,
) -> Result<Arc<rustls::ClientConfig>> {
    let root_store = match ca_cert_path {
        Some(path) => load_root_store(path)?,
        None => native_root_store(),
    };

    let identity = match identity {
        Some((cert_path, key_path)) => {
            Some((load_certs(cert_path)?, load_private_key(key_path)?))
        }
        None => None,
    };

    build_client_config(root_store, identity, min_version)
}

/// 用已解析的信任根和客户端证书创建客户端 TLS 配置
pub fn build_client_config(
    root_store: rustls::RootCertStore,
    identity: Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>,
    min_version: TlsVersion,
) -> Result<Arc<rustls::ClientConfig>> {
    let builder = rustls::ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(min_version.protocol_versions())
        .context("Failed to select TLS protocol versions")?
        .with_root_certificates(root_store);

    let config = match identity {
        Some((certs, key)) => builder
            .with_client_auth_cert(certs, key)
            .context("Failed to load client certificate")?,
        None => builder.with_no_client_auth(),
    };

    Ok(Arc::new(config))
}

/// 生成自签名证书和私钥并写入指定路径
pub fn generate_self_signed_cert(
    common_name: &str,
    alt_names: &[String],
    cert_out: &Path,
    key_out: &Path,
) -> Result<()> {
    // rcgen 至少需要一个 SAN；确保包含 CN
    let mut names: Vec<String> = if alt_names.is_empty() {
        vec![common_name.to_string()]
    } else {
        alt_names.to_vec()
    };

    if !names.iter().any(|n| n == common_name) {
        names.push(common_name.to_string());
    }

    let cert =
        generate_simple_self_signed(names).context("Failed to generate self-signed certificate")?;
    let cert_pem = cert.cert.pem();
    let key_pem = cert.signing_key.serialize_pem();

    std::fs::write(cert_out, cert_pem)
        .with_context(|| format!("Failed to write certificate to {:?}", cert_out))?;
    std::fs::write(key_out, key_pem)
        .with_context(|| format!("Failed to write private key to {:?}", key_out))?;

    Ok(())
}
