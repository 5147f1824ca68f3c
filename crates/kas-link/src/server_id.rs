//! Server identifier type

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ServerIdParseError;

/// Identifies a KAS server by host and port.
///
/// Totally ordered (host lexicographically, then port) so it can key the
/// ordered per-server maps throughout the crate.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServerId {
    /// Hostname or address of the server
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl ServerId {
    /// Create a new server identifier
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ServerId {
    type Err = ServerIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ServerIdParseError::MissingPort(s.to_string()))?;
        if host.is_empty() {
            return Err(ServerIdParseError::MissingHost(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| ServerIdParseError::InvalidPort(port.to_string()))?;
        Ok(Self::new(host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_host_then_port() {
        let a = ServerId::new("alpha.example.com", 9000);
        let b = ServerId::new("alpha.example.com", 9001);
        let c = ServerId::new("beta.example.com", 80);

        assert!(a < b);
        assert!(b < c);
        assert_eq!(a, ServerId::new("alpha.example.com", 9000));
    }

    #[test]
    fn test_display() {
        assert_eq!(
            format!("{}", ServerId::new("kas.example.com", 8471)),
            "kas.example.com:8471"
        );
    }

    #[test]
    fn test_parse() {
        let id: ServerId = "kas.example.com:8471".parse().unwrap();
        assert_eq!(id, ServerId::new("kas.example.com", 8471));

        assert!("no-port".parse::<ServerId>().is_err());
        assert!(":8471".parse::<ServerId>().is_err());
        assert!("host:notaport".parse::<ServerId>().is_err());
    }
}
