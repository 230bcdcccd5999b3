//! Endpoint URIs of the form `tcp://host:port`

use std::fmt;
use std::str::FromStr;

use super::TransportError;

/// Port used when an endpoint omits one
pub const DEFAULT_PORT: u16 = 5000;

/// A parsed TCP endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let authority = match s.split_once("://") {
            Some((scheme, rest)) => {
                match scheme.to_ascii_lowercase().as_str() {
                    "tcp" => rest,
                    "pipe" | "http" | "https" => {
                        return Err(TransportError::UnsupportedScheme(scheme.to_string()))
                    }
                    _ => {
                        return Err(TransportError::InvalidEndpoint(format!(
                            "unknown scheme in '{s}'"
                        )))
                    }
                }
            }
            // Bare host:port is treated as TCP
            None => s,
        };
        let authority = authority.trim_end_matches('/');
        if authority.is_empty() {
            return Err(TransportError::InvalidEndpoint(format!("missing host in '{s}'")));
        }

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, rest) = bracketed.split_once(']').ok_or_else(|| {
                TransportError::InvalidEndpoint(format!("unterminated IPv6 address in '{s}'"))
            })?;
            match rest.strip_prefix(':') {
                Some(port) => (host, parse_port(port, s)?),
                None if rest.is_empty() => (host, DEFAULT_PORT),
                None => {
                    return Err(TransportError::InvalidEndpoint(format!(
                        "unexpected '{rest}' after IPv6 address in '{s}'"
                    )))
                }
            }
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, parse_port(port, s)?),
                None => (authority, DEFAULT_PORT),
            }
        };

        if host.is_empty() {
            return Err(TransportError::InvalidEndpoint(format!("missing host in '{s}'")));
        }

        Ok(Self::new(host, port))
    }
}

fn parse_port(port: &str, input: &str) -> Result<u16, TransportError> {
    if port.is_empty() {
        return Ok(DEFAULT_PORT);
    }
    port.parse::<u16>()
        .map_err(|_| TransportError::InvalidEndpoint(format!("invalid port '{port}' in '{input}'")))
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "tcp://[{}]:{}", self.host, self.port)
        } else {
            write!(f, "tcp://{}:{}", self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp_endpoint() {
        let ep: Endpoint = "tcp://127.0.0.1:6100".parse().unwrap();
        assert_eq!(ep.host(), "127.0.0.1");
        assert_eq!(ep.port(), 6100);
    }

    #[test]
    fn test_default_port() {
        let ep: Endpoint = "tcp://localhost".parse().unwrap();
        assert_eq!(ep.port(), DEFAULT_PORT);

        let ep: Endpoint = "tcp://localhost/".parse().unwrap();
        assert_eq!(ep, Endpoint::new("localhost", 5000));
    }

    #[test]
    fn test_bare_authority_is_tcp() {
        let ep: Endpoint = "example.com:7000".parse().unwrap();
        assert_eq!(ep, Endpoint::new("example.com", 7000));
    }

    #[test]
    fn test_ipv6() {
        let ep: Endpoint = "tcp://[::1]:5001".parse().unwrap();
        assert_eq!(ep.host(), "::1");
        assert_eq!(ep.port(), 5001);
        assert_eq!(ep.to_string(), "tcp://[::1]:5001");
    }

    #[test]
    fn test_unsupported_schemes() {
        assert!(matches!(
            "pipe://toolbridge".parse::<Endpoint>(),
            Err(TransportError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            "http://localhost:5000".parse::<Endpoint>(),
            Err(TransportError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn test_invalid_endpoints() {
        assert!("tcp://".parse::<Endpoint>().is_err());
        assert!("tcp://:5000".parse::<Endpoint>().is_err());
        assert!("tcp://host:notaport".parse::<Endpoint>().is_err());
        assert!("tcp://host:70000".parse::<Endpoint>().is_err());
        assert!("ftp://host".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_display_roundtrip() {
        let ep: Endpoint = "tcp://10.0.0.2:5000".parse().unwrap();
        assert_eq!(ep.to_string(), "tcp://10.0.0.2:5000");
        assert_eq!(ep.to_string().parse::<Endpoint>().unwrap(), ep);
    }
}
