//! Data types for addresses of nodes in DICOM networks.

use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

/// An address to a target application entity:
/// a socket address (or `host:port` name pair),
/// optionally preceded by an application entity title.
///
/// These addresses can be serialized and parsed
/// with the syntax `{ae_title}@{host}:{port}`.
///
/// # Example
///
/// ```
/// # use dicom_dul::AeAddr;
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let addr: AeAddr = "SCP-STORAGE@127.0.0.1:104".parse()?;
/// assert_eq!(addr.ae_title(), Some("SCP-STORAGE"));
/// assert_eq!(addr.socket_address(), "127.0.0.1:104");
///
/// // the AE title part may be missing
/// let addr: AeAddr = "pacs.example.com:1045".parse()?;
/// assert_eq!(addr.ae_title(), None);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AeAddr {
    ae_title: Option<String>,
    socket_address: String,
}

impl AeAddr {
    /// Create an AE address from its bare constituent parts.
    pub fn new(ae_title: impl Into<String>, socket_address: impl Into<String>) -> Self {
        AeAddr {
            ae_title: Some(ae_title.into()),
            socket_address: socket_address.into(),
        }
    }

    /// Retrieve the application entity title portion, if present.
    pub fn ae_title(&self) -> Option<&str> {
        self.ae_title.as_deref()
    }

    /// Retrieve the AE title if present, or the given default.
    pub fn ae_title_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.ae_title.as_deref().unwrap_or(default)
    }

    /// Retrieve the socket address portion.
    pub fn socket_address(&self) -> &str {
        &self.socket_address
    }
}

/// This conversion provides an address without an AE title.
impl From<SocketAddr> for AeAddr {
    fn from(socket_addr: SocketAddr) -> Self {
        AeAddr {
            ae_title: None,
            socket_address: socket_addr.to_string(),
        }
    }
}

impl FromStr for AeAddr {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some((ae_title, address)) = s.split_once('@') {
            Ok(AeAddr {
                ae_title: Some(ae_title.to_string()),
                socket_address: address.to_string(),
            })
        } else {
            Ok(AeAddr {
                ae_title: None,
                socket_address: s.to_string(),
            })
        }
    }
}

impl ToSocketAddrs for AeAddr {
    type Iter = std::vec::IntoIter<SocketAddr>;

    fn to_socket_addrs(&self) -> std::io::Result<Self::Iter> {
        self.socket_address.as_str().to_socket_addrs()
    }
}

impl std::fmt::Display for AeAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ae_title) = &self.ae_title {
            f.write_str(ae_title)?;
            f.write_str("@")?;
        }
        f.write_str(&self.socket_address)
    }
}

#[cfg(test)]
mod tests {
    use super::AeAddr;

    #[test]
    fn parse_with_and_without_ae_title() {
        let addr: AeAddr = "SCP-STORAGE@10.0.0.7:104".parse().unwrap();
        assert_eq!(addr.ae_title(), Some("SCP-STORAGE"));
        assert_eq!(addr.socket_address(), "10.0.0.7:104");
        assert_eq!(addr.to_string(), "SCP-STORAGE@10.0.0.7:104");

        let addr: AeAddr = "pacs.example.org:11112".parse().unwrap();
        assert_eq!(addr.ae_title(), None);
        assert_eq!(addr.ae_title_or("ANY-SCP"), "ANY-SCP");
        assert_eq!(addr.to_string(), "pacs.example.org:11112");
    }
}
