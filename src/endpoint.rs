//! Endpoint strings of the form `HOST[:PORT]`.
//!
//! Either side may be omitted (`:PORT`, `HOST`, or the empty string) and is
//! filled in from role-specific defaults when the endpoint is used to listen
//! or dial.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Port workers connect to (on a controller or on a proxy's worker side).
pub const DEFAULT_WORKER_PORT: u16 = 1120;

/// Port controllers connect to on a proxy.
pub const DEFAULT_CONTROLLER_PORT: u16 = 1121;

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("invalid port in endpoint {0:?}")]
    BadPort(String),
}

/// A host/port pair where either half may be left to a default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Endpoint {
    pub host: Option<String>,
    pub port: Option<u16>,
}

impl Endpoint {
    /// Address string for binding a listener. An omitted host means all
    /// interfaces.
    pub fn listen_addr(&self, default_port: u16) -> String {
        format!(
            "{}:{}",
            self.host.as_deref().unwrap_or("0.0.0.0"),
            self.port.unwrap_or(default_port)
        )
    }

    /// Address string for dialing out. An omitted host means the local
    /// machine.
    pub fn dial_addr(&self, default_port: u16) -> String {
        format!(
            "{}:{}",
            self.host.as_deref().unwrap_or("127.0.0.1"),
            self.port.unwrap_or(default_port)
        )
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Endpoint::default());
        }

        let (host, port) = match s.split_once(':') {
            Some((h, p)) => {
                let port = p
                    .parse::<u16>()
                    .map_err(|_| EndpointError::BadPort(s.to_string()))?;
                (h, Some(port))
            }
            None => (s, None),
        };

        Ok(Endpoint {
            host: (!host.is_empty()).then(|| host.to_string()),
            port,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.host, self.port) {
            (Some(host), Some(port)) => write!(f, "{host}:{port}"),
            (Some(host), None) => write!(f, "{host}"),
            (None, Some(port)) => write!(f, ":{port}"),
            (None, None) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_and_port() {
        let ep: Endpoint = "render1:9000".parse().unwrap();
        assert_eq!(ep.host.as_deref(), Some("render1"));
        assert_eq!(ep.port, Some(9000));
    }

    #[test]
    fn parses_host_only() {
        let ep: Endpoint = "render1".parse().unwrap();
        assert_eq!(ep.host.as_deref(), Some("render1"));
        assert_eq!(ep.port, None);
        assert_eq!(ep.dial_addr(DEFAULT_WORKER_PORT), "render1:1120");
    }

    #[test]
    fn parses_port_only() {
        let ep: Endpoint = ":9000".parse().unwrap();
        assert_eq!(ep.host, None);
        assert_eq!(ep.port, Some(9000));
        assert_eq!(ep.listen_addr(DEFAULT_WORKER_PORT), "0.0.0.0:9000");
    }

    #[test]
    fn empty_uses_defaults() {
        let ep: Endpoint = "".parse().unwrap();
        assert_eq!(ep.listen_addr(DEFAULT_CONTROLLER_PORT), "0.0.0.0:1121");
        assert_eq!(ep.dial_addr(DEFAULT_CONTROLLER_PORT), "127.0.0.1:1121");
    }

    #[test]
    fn rejects_bad_port() {
        assert!("host:".parse::<Endpoint>().is_err());
        assert!("host:http".parse::<Endpoint>().is_err());
        assert!("host:99999".parse::<Endpoint>().is_err());
    }
}
