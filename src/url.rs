//! Address notation for [`Listen`](crate::Listen) and
//! [`Connect`](crate::Connect):
//!
//! - `tcp://host:port`, `host:port`, or a bare `port`
//! - `unix:///path/to.sock`, or any string containing a `/`
//! - bracketed IPv6 hosts: `tcp://[::1]:8080`
//!
//! An empty host (or `0.0.0.0`) binds every interface. When no address
//! is given at all, the `PORT` and `ADDRESS` environment variables are
//! consulted before falling back to port 3000.

use std::env;
use std::fmt;
use std::path::PathBuf;

use crate::error::{Error, Result};

const DEFAULT_PORT: u16 = 3000;

/// A parsed listen/connect address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Addr {
    Tcp { host: Option<String>, port: u16 },
    Unix { path: PathBuf },
}

impl Addr {
    /// Parses the URL notation described in the module docs.
    pub fn parse(url: &str) -> Result<Addr> {
        let url = url.trim();
        if url.is_empty() {
            return Ok(Addr::Tcp {
                host: None,
                port: DEFAULT_PORT,
            });
        }

        if let Some(rest) = url.strip_prefix("unix://") {
            if rest.is_empty() {
                return Err(invalid(url, "empty unix socket path"));
            }
            return Ok(Addr::Unix { path: rest.into() });
        }

        let rest = url.strip_prefix("tcp://").unwrap_or(url);

        if rest.contains('/') {
            if url.starts_with("tcp://") {
                return Err(invalid(url, "path in tcp address"));
            }
            return Ok(Addr::Unix { path: rest.into() });
        }

        // bare port
        if let Ok(port) = rest.parse::<u16>() {
            return Ok(Addr::Tcp { host: None, port });
        }

        // bracketed IPv6: [::1]:8080
        if let Some(rest) = rest.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| invalid(url, "unterminated `[`"))?;
            let port = match tail.strip_prefix(':') {
                Some(p) => p
                    .parse::<u16>()
                    .map_err(|_| invalid(url, "bad port number"))?,
                None if tail.is_empty() => DEFAULT_PORT,
                None => return Err(invalid(url, "garbage after `]`")),
            };
            return Ok(Addr::Tcp {
                host: Some(host.to_string()),
                port,
            });
        }

        let (host, port) = match rest.rsplit_once(':') {
            Some((h, p)) => (
                h,
                p.parse::<u16>().map_err(|_| invalid(url, "bad port number"))?,
            ),
            None => (rest, DEFAULT_PORT),
        };

        let host = match host {
            "" | "0.0.0.0" => None,
            h => Some(h.to_string()),
        };

        Ok(Addr::Tcp { host, port })
    }

    /// The default address when none was given: `PORT` / `ADDRESS`
    /// environment variables, then `0.0.0.0:3000`.
    pub fn from_env() -> Addr {
        let port = env::var("PORT")
            .ok()
            .and_then(|p| p.parse::<u16>().ok())
            .unwrap_or(DEFAULT_PORT);
        let host = env::var("ADDRESS").ok().filter(|h| !h.is_empty());
        Addr::Tcp { host, port }
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Addr::Tcp { host: Some(h), port } if h.contains(':') => {
                write!(f, "tcp://[{}]:{}", h, port)
            }
            Addr::Tcp { host: Some(h), port } => write!(f, "tcp://{}:{}", h, port),
            Addr::Tcp { host: None, port } => write!(f, "tcp://0.0.0.0:{}", port),
            Addr::Unix { path } => write!(f, "unix://{}", path.display()),
        }
    }
}

fn invalid(url: &str, reason: &str) -> Error {
    Error::InvalidUrl {
        url: url.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::{Addr, DEFAULT_PORT};

    fn tcp(host: Option<&str>, port: u16) -> Addr {
        Addr::Tcp {
            host: host.map(str::to_string),
            port,
        }
    }

    #[test]
    fn bare_port() {
        assert_eq!(Addr::parse("3000").unwrap(), tcp(None, 3000));
    }

    #[test]
    fn scheme_and_host() {
        assert_eq!(
            Addr::parse("tcp://localhost:8080").unwrap(),
            tcp(Some("localhost"), 8080)
        );
        assert_eq!(Addr::parse("tcp://0.0.0.0:80").unwrap(), tcp(None, 80));
        assert_eq!(Addr::parse("example.com:443").unwrap(), tcp(Some("example.com"), 443));
    }

    #[test]
    fn host_without_port_gets_default() {
        assert_eq!(
            Addr::parse("localhost").unwrap(),
            tcp(Some("localhost"), DEFAULT_PORT)
        );
    }

    #[test]
    fn bracketed_ipv6() {
        assert_eq!(Addr::parse("[::1]:9000").unwrap(), tcp(Some("::1"), 9000));
        assert_eq!(
            Addr::parse("tcp://[fe80::1]:80").unwrap(),
            tcp(Some("fe80::1"), 80)
        );
    }

    #[test]
    fn unix_paths() {
        assert_eq!(
            Addr::parse("unix:///tmp/app.sock").unwrap(),
            Addr::Unix {
                path: "/tmp/app.sock".into()
            }
        );
        assert_eq!(
            Addr::parse("/tmp/app.sock").unwrap(),
            Addr::Unix {
                path: "/tmp/app.sock".into()
            }
        );
    }

    #[test]
    fn empty_is_default() {
        assert_eq!(Addr::parse("").unwrap(), tcp(None, DEFAULT_PORT));
    }

    #[test]
    fn rejects_garbage() {
        assert!(Addr::parse("tcp://host:notaport").is_err());
        assert!(Addr::parse("[::1").is_err());
        assert!(Addr::parse("unix://").is_err());
    }

    #[test]
    fn display_round_trip() {
        for url in ["tcp://127.0.0.1:80", "tcp://[::1]:90", "unix:///tmp/x.sock"] {
            let addr = Addr::parse(url).unwrap();
            assert_eq!(Addr::parse(&addr.to_string()).unwrap(), addr);
        }
    }
}
