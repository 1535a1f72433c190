/// URL 到网络地址的转换
use std::fmt;
use std::str::FromStr;

use url::{Host, Url};

use crate::error::{Result, TunnelError};

/// Dial target derived from a URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAddress {
    pub scheme: String,
    /// Host name or IP, without IPv6 brackets
    pub host: String,
    pub port: u16,
    /// `host:port`, ready to dial
    pub address: String,
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" => Some(80),
        "https" => Some(443),
        _ => None,
    }
}

impl NetworkAddress {
    /// Parses `scheme://host[:port]`. Without a port, `http` means 80 and `https` 443;
    /// other schemes need an explicit port.
    pub fn parse(input: &str) -> Result<Self> {
        let url = Url::parse(input)
            .map_err(|e| TunnelError::config_error(format!("Invalid URL '{}': {}", input, e)))?;

        let (host, authority) = match url.host() {
            Some(Host::Ipv6(ip)) => (ip.to_string(), format!("[{}]", ip)),
            Some(host) => (host.to_string(), host.to_string()),
            None => {
                return Err(TunnelError::config_error(format!(
                    "URL '{}' has no host",
                    input
                )))
            }
        };

        let port = url
            .port()
            .or_else(|| default_port(url.scheme()))
            .ok_or_else(|| {
                TunnelError::config_error(format!(
                    "URL '{}' has no port and scheme '{}' has no default",
                    input,
                    url.scheme()
                ))
            })?;

        Ok(Self {
            scheme: url.scheme().to_string(),
            host,
            port,
            address: format!("{}:{}", authority, port),
        })
    }
}

impl FromStr for NetworkAddress {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.address)
    }
}

/// Shorthand for [`NetworkAddress::parse`].
pub fn url_to_address(url: &str) -> Result<NetworkAddress> {
    NetworkAddress::parse(url)
}
