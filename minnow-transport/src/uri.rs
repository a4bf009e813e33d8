//! Proxy addresses.

use std::fmt;
use std::str::FromStr;

use crate::error::TransportError;

/// URI schemes accepted for a proxy.
const SCHEMES: [&str; 2] = ["calvinip://", "tcp://"];

/// Address of a proxy runtime, parsed from `calvinip://host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyUri {
    host: String,
    port: u16,
}

impl ProxyUri {
    /// Build from parts.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Host name or address.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// TCP port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` form passed to the network provider.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl FromStr for ProxyUri {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = SCHEMES
            .iter()
            .find_map(|scheme| s.strip_prefix(scheme))
            .ok_or_else(|| TransportError::InvalidUri(s.to_string()))?;
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| TransportError::InvalidUri(s.to_string()))?;
        if host.is_empty() {
            return Err(TransportError::InvalidUri(s.to_string()));
        }
        let port = port
            .trim_end_matches('/')
            .parse::<u16>()
            .map_err(|_| TransportError::InvalidUri(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for ProxyUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "calvinip://{}:{}", self.host, self.port)
    }
}
