/// 配置模块
///
/// `[server]` / `[client]` 两张 TOML 表，环境变量覆盖，路径展开和校验
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, TunnelError};
use crate::tcp::{url_to_address, Dialer, NetworkAddress, ServerOptions};
use crate::tls::{ClientAuth, TlsVersion};

/// 默认缓冲区大小
pub const DEFAULT_BUF_SIZE: usize = 8192;

/// 服务器端配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TLS 监听地址
    pub listen_addr: String,
    /// 用于校验客户端证书的 CA
    pub client_root_ca: Option<PathBuf>,
    /// 服务器证书
    pub server_cert: PathBuf,
    /// 服务器私钥
    pub server_key: PathBuf,
    /// 客户端证书策略
    pub client_auth: ClientAuth,
    pub min_tls_version: TlsVersion,
    pub tcp_nodelay: bool,
    /// 接入连接的读缓冲；0 表示不缓冲，隧道头解析不会多读
    pub reader_buf_size: usize,
    pub writer_buf_size: usize,
    /// 目标连接的读写缓冲
    pub dial_reader_buf_size: usize,
    pub dial_writer_buf_size: usize,
    /// 退出时等待监听循环结束的秒数
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8443".to_string(),
            client_root_ca: None,
            server_cert: PathBuf::from("/etc/buggy/server.pem"),
            server_key: PathBuf::from("/etc/buggy/server.key"),
            client_auth: ClientAuth::Optional,
            min_tls_version: TlsVersion::Tls13,
            tcp_nodelay: true,
            reader_buf_size: 0,
            writer_buf_size: DEFAULT_BUF_SIZE,
            dial_reader_buf_size: DEFAULT_BUF_SIZE,
            dial_writer_buf_size: 0,
            shutdown_grace_secs: 5,
        }
    }
}

/// 客户端配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// 明文监听地址
    pub listen_addr: String,
    /// 隧道服务器，如 `https://tunnel.example.com:8443`
    pub remote_url: String,
    /// 校验服务器证书的 CA；缺省使用系统证书
    pub root_ca: Option<PathBuf>,
    /// 客户端证书和私钥，需成对配置
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub min_tls_version: TlsVersion,
    pub tcp_nodelay: bool,
    pub reader_buf_size: usize,
    pub writer_buf_size: usize,
    pub dial_reader_buf_size: usize,
    pub dial_writer_buf_size: usize,
    pub shutdown_grace_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            remote_url: String::new(),
            root_ca: None,
            client_cert: None,
            client_key: None,
            min_tls_version: TlsVersion::Tls12,
            tcp_nodelay: true,
            reader_buf_size: DEFAULT_BUF_SIZE,
            writer_buf_size: 0,
            dial_reader_buf_size: DEFAULT_BUF_SIZE,
            dial_writer_buf_size: DEFAULT_BUF_SIZE,
            shutdown_grace_secs: 5,
        }
    }
}

/// 配置文件，`[server]` 和 `[client]` 两张表都可省略
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    server: Option<ServerConfig>,
    #[serde(default)]
    client: Option<ClientConfig>,
}

fn read_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        TunnelError::config_error(format!("Failed to read config file {:?}: {}", path, e))
    })?;
    toml::from_str(&content).map_err(|e| {
        TunnelError::config_error(format!("Failed to parse config file {:?}: {}", path, e))
    })
}

/// 环境变量，空值视为未设置
fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Expands a leading `~` in a configured path
pub fn expand_path(path: &Path) -> PathBuf {
    match path.to_str() {
        Some(s) => PathBuf::from(shellexpand::tilde(s).as_ref()),
        None => path.to_path_buf(),
    }
}

fn parse_env<T: std::str::FromStr<Err = String>>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|e| TunnelError::config_error(format!("{}: {}", key, e)))
}

fn validate_listen_addr(addr: &str) -> Result<()> {
    let valid = addr
        .rsplit_once(':')
        .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
    if !valid {
        return Err(TunnelError::config_error(format!(
            "listen_addr '{}' must be host:port",
            addr
        )));
    }
    Ok(())
}

impl ServerConfig {
    /// Loads the `[server]` table (or defaults without a file), applies environment
    /// overrides and validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => read_config_file(path)?.server.unwrap_or_default(),
            None => Self::default(),
        };
        config.apply_env(env_lookup)?;
        config.expand_paths();
        config.validate()?;
        Ok(config)
    }

    /// Overrides fields from `LISTEN_ADDR`, `CLIENT_ROOT_CA`, `SERVER_CERT`,
    /// `SERVER_KEY`, `CLIENT_AUTH` and `MIN_TLS_VERSION`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("LISTEN_ADDR") {
            self.listen_addr = v;
        }
        if let Some(v) = lookup("CLIENT_ROOT_CA") {
            self.client_root_ca = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("SERVER_CERT") {
            self.server_cert = PathBuf::from(v);
        }
        if let Some(v) = lookup("SERVER_KEY") {
            self.server_key = PathBuf::from(v);
        }
        if let Some(v) = lookup("CLIENT_AUTH") {
            self.client_auth = parse_env("CLIENT_AUTH", &v)?;
        }
        if let Some(v) = lookup("MIN_TLS_VERSION") {
            self.min_tls_version = parse_env("MIN_TLS_VERSION", &v)?;
        }
        Ok(())
    }

    fn expand_paths(&mut self) {
        self.server_cert = expand_path(&self.server_cert);
        self.server_key = expand_path(&self.server_key);
        self.client_root_ca = self.client_root_ca.as_deref().map(expand_path);
    }

    pub fn validate(&self) -> Result<()> {
        validate_listen_addr(&self.listen_addr)?;

        if self.client_auth != ClientAuth::None && self.client_root_ca.is_none() {
            return Err(TunnelError::config_error(format!(
                "client_auth = \"{}\" requires client_root_ca",
                self.client_auth
            )));
        }
        Ok(())
    }

    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            tcp_nodelay: self.tcp_nodelay,
            reader_buf_size: self.reader_buf_size,
            writer_buf_size: self.writer_buf_size,
        }
    }

    pub fn dialer(&self) -> Dialer {
        Dialer::new(
            self.tcp_nodelay,
            self.dial_reader_buf_size,
            self.dial_writer_buf_size,
        )
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl ClientConfig {
    /// Loads the `[client]` table (or defaults without a file), applies environment
    /// overrides and validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => read_config_file(path)?.client.unwrap_or_default(),
            None => Self::default(),
        };
        config.apply_env(env_lookup)?;
        config.expand_paths();
        config.validate()?;
        Ok(config)
    }

    /// Overrides fields from `LISTEN_ADDR`, `REMOTE_URL`, `ROOT_CA`, `CLIENT_CERT`,
    /// `CLIENT_KEY` and `MIN_TLS_VERSION`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("LISTEN_ADDR") {
            self.listen_addr = v;
        }
        if let Some(v) = lookup("REMOTE_URL") {
            self.remote_url = v;
        }
        if let Some(v) = lookup("ROOT_CA") {
            self.root_ca = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("CLIENT_CERT") {
            self.client_cert = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("CLIENT_KEY") {
            self.client_key = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("MIN_TLS_VERSION") {
            self.min_tls_version = parse_env("MIN_TLS_VERSION", &v)?;
        }
        Ok(())
    }

    fn expand_paths(&mut self) {
        self.root_ca = self.root_ca.as_deref().map(expand_path);
        self.client_cert = self.client_cert.as_deref().map(expand_path);
        self.client_key = self.client_key.as_deref().map(expand_path);
    }

    pub fn validate(&self) -> Result<()> {
        validate_listen_addr(&self.listen_addr)?;

        if self.remote_url.trim().is_empty() {
            return Err(TunnelError::config_error("remote_url is required"));
        }
        self.remote_address()?;

        if self.client_cert.is_some() != self.client_key.is_some() {
            return Err(TunnelError::config_error(
                "client_cert and client_key must be set together",
            ));
        }
        Ok(())
    }

    /// The tunnel server to dial.
    pub fn remote_address(&self) -> Result<NetworkAddress> {
        url_to_address(&self.remote_url)
    }

    /// `(certificate, key)` when a client identity is configured.
    pub fn identity(&self) -> Option<(&Path, &Path)> {
        match (&self.client_cert, &self.client_key) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            _ => None,
        }
    }

    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            tcp_nodelay: self.tcp_nodelay,
            reader_buf_size: self.reader_buf_size,
            writer_buf_size: self.writer_buf_size,
        }
    }

    pub fn dialer(&self) -> Dialer {
        Dialer::new(
            self.tcp_nodelay,
            self.dial_reader_buf_size,
            self.dial_writer_buf_size,
        )
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Parses and validates every table in a config file without applying environment
/// overrides. Absent tables come back as `None`.
pub fn check_config_file(path: &Path) -> Result<(Option<ServerConfig>, Option<ClientConfig>)> {
    let file = read_config_file(path)?;

    let server = file
        .server
        .map(|mut server| {
            server.expand_paths();
            server.validate().map(|_| server)
        })
        .transpose()?;
    let client = file
        .client
        .map(|mut client| {
            client.expand_paths();
            client.validate().map(|_| client)
        })
        .transpose()?;

    if server.is_none() && client.is_none() {
        return Err(TunnelError::config_error(format!(
            "{:?} has neither a [server] nor a [client] table",
            path
        )));
    }
    Ok((server, client))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_server_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.listen_addr, "0.0.0.0:8443");
        assert_eq!(config.client_auth, ClientAuth::Optional);
        assert_eq!(config.min_tls_version, TlsVersion::Tls13);
        assert_eq!(config.reader_buf_size, 0);
        assert_eq!(config.writer_buf_size, 8192);
        assert_eq!(config.dialer(), Dialer::new(true, 8192, 0));

        // optional client auth needs a CA
        assert!(config.validate().unwrap_err().is_config_error());
    }

    #[test]
    fn test_client_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.listen_addr, "127.0.0.1:8080");
        assert_eq!(config.min_tls_version, TlsVersion::Tls12);
        assert_eq!(config.server_options().reader_buf_size, 8192);
        assert_eq!(config.server_options().writer_buf_size, 0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_server_env_overrides() {
        let mut config = ServerConfig::default();
        config
            .apply_env(lookup(&[
                ("LISTEN_ADDR", "127.0.0.1:9443"),
                ("CLIENT_ROOT_CA", "/tmp/ca.pem"),
                ("SERVER_CERT", "/tmp/server.pem"),
                ("CLIENT_AUTH", "required"),
                ("MIN_TLS_VERSION", "1.2"),
            ]))
            .unwrap();

        assert_eq!(config.listen_addr, "127.0.0.1:9443");
        assert_eq!(config.client_root_ca, Some(PathBuf::from("/tmp/ca.pem")));
        assert_eq!(config.server_cert, PathBuf::from("/tmp/server.pem"));
        assert_eq!(config.server_key, PathBuf::from("/etc/buggy/server.key"));
        assert_eq!(config.client_auth, ClientAuth::Required);
        assert_eq!(config.min_tls_version, TlsVersion::Tls12);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_env_value() {
        let mut config = ServerConfig::default();
        let err = config
            .apply_env(lookup(&[("CLIENT_AUTH", "maybe")]))
            .unwrap_err();
        assert!(err.is_config_error());
        assert!(err.to_string().contains("CLIENT_AUTH"));
    }

    #[test]
    fn test_client_env_and_validation() {
        let mut config = ClientConfig::default();
        config
            .apply_env(lookup(&[
                ("REMOTE_URL", "https://tunnel.example.com"),
                ("CLIENT_CERT", "/tmp/client.pem"),
            ]))
            .unwrap();
        assert_eq!(
            config.remote_address().unwrap().address,
            "tunnel.example.com:443"
        );

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("client_cert and client_key"));

        config.client_key = Some(PathBuf::from("/tmp/client.key"));
        assert!(config.validate().is_ok());
        assert!(config.identity().is_some());
    }

    #[test]
    fn test_client_rejects_bad_remote_url() {
        let config = ClientConfig {
            remote_url: "tunnel.example.com".to_string(),
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().is_config_error());
    }

    #[test]
    fn test_listen_addr_validation() {
        for addr in ["8443", ":8443", "localhost:http", "0.0.0.0:70000"] {
            assert!(validate_listen_addr(addr).is_err(), "{}", addr);
        }
        for addr in ["0.0.0.0:8443", "localhost:0", "[::]:443"] {
            assert!(validate_listen_addr(addr).is_ok(), "{}", addr);
        }
    }

    #[test]
    fn test_toml_tables() {
        let file: ConfigFile = toml::from_str(
            r#"
            [server]
            listen_addr = "127.0.0.1:7443"
            client_auth = "none"
            min_tls_version = "1.2"
            writer_buf_size = 4096

            [client]
            remote_url = "https://127.0.0.1:7443"
            root_ca = "~/ca.pem"
            "#,
        )
        .unwrap();

        let server = file.server.unwrap();
        assert_eq!(server.listen_addr, "127.0.0.1:7443");
        assert_eq!(server.client_auth, ClientAuth::None);
        assert_eq!(server.min_tls_version, TlsVersion::Tls12);
        assert_eq!(server.writer_buf_size, 4096);
        assert_eq!(server.reader_buf_size, 0);
        assert!(server.validate().is_ok());

        let mut client = file.client.unwrap();
        client.expand_paths();
        assert!(!client.root_ca.unwrap().starts_with("~"));
    }

    #[test]
    fn test_check_config_file() {
        let path =
            std::env::temp_dir().join(format!("buggy-check-{}.toml", std::process::id()));

        std::fs::write(&path, "[server]\nclient_auth = \"none\"\n").unwrap();
        let (server, client) = check_config_file(&path).unwrap();
        assert_eq!(server.unwrap().client_auth, ClientAuth::None);
        assert!(client.is_none());

        std::fs::write(&path, "[client]\nlisten_addr = \"127.0.0.1:8080\"\n").unwrap();
        let err = check_config_file(&path).unwrap_err();
        assert!(err.to_string().contains("remote_url"));

        std::fs::write(&path, "# nothing\n").unwrap();
        assert!(check_config_file(&path).is_err());

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_missing_config_file() {
        let err = ServerConfig::load(Some(Path::new("/nonexistent/buggy.toml"))).unwrap_err();
        assert!(err.is_config_error());
    }
}
