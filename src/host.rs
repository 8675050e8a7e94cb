use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Default port when a host identifier carries none.
pub(crate) const DEFAULT_PORT: u16 = 80;

/// A `host[:port]` endpoint identifier.
///
/// Host identifiers are supplied as strings at construction time, e.g.
/// `"search1"` or `"search1:8080"`, and are immutable thereafter. The
/// port defaults to 80.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostAddr {
    host: String,
    port: u16,
}

impl HostAddr {
    /// Parse a `host[:port]` string.
    pub fn parse(s: &str) -> Result<HostAddr, Error> {
        let (host, port) = match s.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| Error::BadHost(s.to_string()))?;
                (host, port)
            }
            None => (s, DEFAULT_PORT),
        };

        if host.is_empty() {
            return Err(Error::BadHost(s.to_string()));
        }

        Ok(HostAddr {
            host: host.to_string(),
            port,
        })
    }

    /// The host part, without port.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port, defaulted to 80 when the identifier had none.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Value for the `host` request header.
    ///
    /// This appends the port only if it differs from the scheme default.
    pub(crate) fn authority(&self) -> String {
        if self.port == DEFAULT_PORT {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for HostAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.authority())
    }
}

impl FromStr for HostAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HostAddr::parse(s)
    }
}
