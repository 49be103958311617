//! Node addresses and endpoints
//!
//! A `NodeAddress` is the user/config-facing peer locator: a URL carrying the
//! peer's identity plus an optional hostname, port and path. An `Endpoint` is
//! a concrete dial target, produced by resolving an address. One address can
//! resolve to several endpoints when its hostname has multiple DNS records.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use url::Url;

// =============================================================================
// Node ID
// =============================================================================

/// Length of a node ID in bytes; the string form is hex, twice this length.
pub const NODE_ID_BYTE_LENGTH: usize = 20;

/// An opaque, validated node identity: lowercased hex of a 20-byte address.
/// Equality is exact-string; node IDs are used as map keys everywhere.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Create a normalized (lowercased) node ID, validating the format.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = NodeId(id.into().to_lowercase());
        id.validate()?;
        Ok(id)
    }

    /// Build a node ID from its raw 20-byte form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::new(hex::encode(bytes))
    }

    /// Decode the node ID back to its binary representation.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        hex::decode(&self.0).map_err(|e| Error::InvalidNodeId(e.to_string()))
    }

    /// Validate the node ID format.
    pub fn validate(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(Error::InvalidNodeId("empty node ID".into()));
        }
        if self.0.len() != 2 * NODE_ID_BYTE_LENGTH {
            return Err(Error::InvalidNodeId(format!(
                "invalid length {}, expected {}",
                self.0.len(),
                2 * NODE_ID_BYTE_LENGTH
            )));
        }
        if !self.0.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(Error::InvalidNodeId(
                "node ID can only contain lowercased hex digits".into(),
            ));
        }
        Ok(())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for NodeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

// =============================================================================
// Protocol
// =============================================================================

/// Transport protocol identifier, the scheme part of a node address URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Protocol(Cow<'static, str>);

impl Protocol {
    /// In-process memory transport.
    pub const MEMORY: Protocol = Protocol(Cow::Borrowed("memory"));
    /// Framed TCP stream transport.
    pub const TCP: Protocol = Protocol(Cow::Borrowed("tcp"));

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Protocol {
    fn from(s: &str) -> Self {
        Protocol(Cow::Owned(s.to_lowercase()))
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Scheme applied when parsing a bare `host:port` or `id@host:port` input.
const DEFAULT_PROTOCOL: Protocol = Protocol::TCP;

// =============================================================================
// Node address
// =============================================================================

/// A node address URL. It differs from a transport [`Endpoint`] in that it
/// contains the node's ID, and that the hostname may resolve into multiple IP
/// addresses (and thus multiple endpoints).
///
/// Two forms exist: the opaque form `protocol:nodeid` used by transports
/// without a network hostname, and the networked form
/// `protocol://nodeid@host:port/path`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddress {
    pub node_id: NodeId,
    pub protocol: Protocol,
    pub hostname: String,
    pub port: u16,
    pub path: String,
}

/// Detects inputs of the form `host:80/...` where a URL parser would read the
/// hostname as a scheme.
fn scheme_looks_like_host(s: &str) -> bool {
    let Some((head, rest)) = s.split_once(':') else {
        return false;
    };
    if head.is_empty() || head.contains('/') {
        return false;
    }
    let port = rest.split('/').next().unwrap_or("");
    !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit())
}

impl NodeAddress {
    /// Build an opaque address (`protocol:nodeid`) for hostname-less
    /// transports such as the in-process memory transport.
    pub fn opaque(protocol: Protocol, node_id: NodeId) -> Self {
        NodeAddress {
            node_id,
            protocol,
            hostname: String::new(),
            port: 0,
            path: String::new(),
        }
    }

    /// Parse a node address URL, normalizing and validating it.
    ///
    /// URL parsing requires a scheme, so a scheme-less input (or one whose
    /// scheme is really a hostname, like `localhost:80/path`) is retried with
    /// the default protocol prefixed.
    pub fn parse(input: &str) -> Result<Self> {
        let retry = || {
            Url::parse(&format!("{}://{}", DEFAULT_PROTOCOL, input))
                .map_err(|e| Error::InvalidAddress(input.into(), e.to_string()))
        };
        let url = match Url::parse(input) {
            // Opaque URLs are expected to contain only a node ID. An input
            // like `host:80/path` also lands here with its hostname read as
            // the scheme, so only when the body is not a node ID is a
            // host-like input retried with the default protocol.
            Ok(url) if url.cannot_be_a_base() => match NodeId::new(url.path()) {
                Ok(node_id) => {
                    let address = NodeAddress::opaque(Protocol::from(url.scheme()), node_id);
                    address.validate()?;
                    return Ok(address);
                }
                Err(_) if scheme_looks_like_host(input) => retry()?,
                Err(e) => return Err(Error::InvalidAddress(input.into(), e.to_string())),
            },
            Ok(url) => url,
            Err(_) => retry()?,
        };

        let protocol = Protocol::from(url.scheme());

        // A normal networked URL with the node ID in the user part.
        if url.username().is_empty() {
            return Err(Error::InvalidAddress(input.into(), "no node ID".into()));
        }
        let node_id = NodeId::new(url.username())
            .map_err(|e| Error::InvalidAddress(input.into(), e.to_string()))?;

        let hostname = url.host_str().unwrap_or("").to_lowercase();
        let port = url.port().unwrap_or(0);

        let mut path = url.path().to_string();
        if path == "/" {
            path.clear();
        }
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }
        if let Some(fragment) = url.fragment() {
            path.push('#');
            path.push_str(fragment);
        }
        if !path.is_empty() && !matches!(path.as_bytes()[0], b'/' | b'?' | b'#') {
            path.insert(0, '/');
        }

        let address = NodeAddress {
            node_id,
            protocol,
            hostname,
            port,
            path,
        };
        address.validate()?;
        Ok(address)
    }

    /// Validate the node address invariants.
    pub fn validate(&self) -> Result<()> {
        if self.protocol.is_empty() {
            return Err(Error::InvalidAddress(self.to_string(), "no protocol".into()));
        }
        self.node_id.validate()?;
        if self.port > 0 && self.hostname.is_empty() {
            return Err(Error::InvalidAddress(
                self.to_string(),
                "cannot specify port without hostname".into(),
            ));
        }
        Ok(())
    }

    /// Resolve the address into a set of concrete endpoints, expanding a DNS
    /// hostname into one endpoint per resolved IP.
    ///
    /// An opaque address resolves to a single path-only endpoint keyed by the
    /// node ID.
    pub async fn resolve(&self) -> Result<Vec<Endpoint>> {
        if self.protocol.is_empty() {
            return Err(Error::InvalidEndpoint("address has no protocol".into()));
        }

        if self.hostname.is_empty() {
            self.node_id.validate()?;
            return Ok(vec![Endpoint {
                protocol: self.protocol.clone(),
                ip: None,
                port: 0,
                path: self.node_id.to_string(),
            }]);
        }

        let resolved = tokio::net::lookup_host((self.hostname.as_str(), self.port)).await?;
        let mut endpoints: Vec<Endpoint> = Vec::new();
        for addr in resolved {
            let endpoint = Endpoint {
                protocol: self.protocol.clone(),
                ip: Some(addr.ip()),
                port: self.port,
                path: self.path.clone(),
            };
            if !endpoints.contains(&endpoint) {
                endpoints.push(endpoint);
            }
        }
        Ok(endpoints)
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.hostname.is_empty() {
            write!(f, "{}://{}@{}", self.protocol, self.node_id, self.hostname)?;
            if self.port > 0 {
                write!(f, ":{}", self.port)?;
            }
            f.write_str(&self.path)
        } else if self.path.is_empty() || self.path == self.node_id.as_str() {
            write!(f, "{}:{}", self.protocol, self.node_id)
        } else if !self.path.starts_with('/') {
            write!(f, "{}://{}@/{}", self.protocol, self.node_id, self.path)
        } else {
            write!(f, "{}://{}@{}", self.protocol, self.node_id, self.path)
        }
    }
}

impl FromStr for NodeAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

// =============================================================================
// Endpoint
// =============================================================================

/// A concrete transport endpoint: a resolved, dialable target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub protocol: Protocol,
    /// Resolved IP address; `None` for path-only endpoints such as the
    /// memory transport's.
    pub ip: Option<IpAddr>,
    pub port: u16,
    pub path: String,
}

impl Endpoint {
    /// Build a networked endpoint with an IP and port.
    pub fn new(protocol: Protocol, ip: IpAddr, port: u16) -> Self {
        Endpoint {
            protocol,
            ip: Some(ip),
            port,
            path: String::new(),
        }
    }

    /// Build a path-only endpoint (no network address).
    pub fn path_only(protocol: Protocol, path: impl Into<String>) -> Self {
        Endpoint {
            protocol,
            ip: None,
            port: 0,
            path: path.into(),
        }
    }

    /// Validate the endpoint invariants.
    pub fn validate(&self) -> Result<()> {
        if self.protocol.is_empty() {
            return Err(Error::InvalidEndpoint("endpoint has no protocol".into()));
        }
        if self.ip.is_none() && self.path.is_empty() {
            return Err(Error::InvalidEndpoint(
                "endpoint has neither IP nor path".into(),
            ));
        }
        Ok(())
    }

    /// The socket address, when the endpoint is networked.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.ip.map(|ip| SocketAddr::new(ip, self.port))
    }

    /// Convert the endpoint back into a node address for a given peer,
    /// turning the IP into a hostname.
    pub fn node_address(&self, node_id: NodeId) -> NodeAddress {
        let (hostname, port) = match self.ip {
            Some(ip) => (ip.to_string(), self.port),
            None => (String::new(), 0),
        };
        let path = if self.ip.is_none() && self.path == node_id.as_str() {
            // The synthetic path of an opaque address is the node ID itself;
            // don't carry it back as a path component.
            String::new()
        } else {
            self.path.clone()
        };
        NodeAddress {
            node_id,
            protocol: self.protocol.clone(),
            hostname,
            port,
            path,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            Some(ip) => {
                write!(f, "{}://{}:{}", self.protocol, ip, self.port)?;
                f.write_str(&self.path)
            }
            None => write!(f, "{}:{}", self.protocol, self.path),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_id() -> NodeId {
        NodeId::new("00112233445566778899aabbccddeeff00112233").unwrap()
    }

    #[test]
    fn test_node_id_validation() {
        assert!(NodeId::new("00112233445566778899aabbccddeeff00112233").is_ok());
        // Uppercase input is normalized.
        let id = NodeId::new("00112233445566778899AABBCCDDEEFF00112233").unwrap();
        assert_eq!(id.as_str(), "00112233445566778899aabbccddeeff00112233");

        assert!(NodeId::new("").is_err());
        assert!(NodeId::new("00112233").is_err());
        assert!(NodeId::new("zz112233445566778899aabbccddeeff00112233").is_err());
    }

    #[test]
    fn test_node_id_bytes_roundtrip() {
        let id = test_id();
        let bytes = id.to_bytes().unwrap();
        assert_eq!(bytes.len(), NODE_ID_BYTE_LENGTH);
        assert_eq!(NodeId::from_bytes(&bytes).unwrap(), id);
    }

    #[test]
    fn test_parse_networked() {
        let id = test_id();
        let addr = NodeAddress::parse(&format!("tcp://{}@host.domain:26657", id)).unwrap();
        assert_eq!(addr.protocol, Protocol::TCP);
        assert_eq!(addr.node_id, id);
        assert_eq!(addr.hostname, "host.domain");
        assert_eq!(addr.port, 26657);
        assert_eq!(addr.path, "");
    }

    #[test]
    fn test_parse_defaults_scheme() {
        let id = test_id();
        // Bare id@host:port gets the default tcp scheme.
        let addr = NodeAddress::parse(&format!("{}@host.domain:26657/some/path", id)).unwrap();
        assert_eq!(addr.protocol, Protocol::TCP);
        assert_eq!(addr.hostname, "host.domain");
        assert_eq!(addr.port, 26657);
        assert_eq!(addr.path, "/some/path");
    }

    #[test]
    fn test_parse_opaque() {
        let id = test_id();
        let addr = NodeAddress::parse(&format!("memory:{}", id)).unwrap();
        assert_eq!(addr.protocol, Protocol::MEMORY);
        assert_eq!(addr.node_id, id);
        assert!(addr.hostname.is_empty());
        assert_eq!(addr.port, 0);
    }

    #[test]
    fn test_parse_opaque_all_digit_node_id() {
        // An all-digit node ID also matches the host:port shape; the opaque
        // reading must win over the default-scheme retry.
        let id = NodeId::new("1".repeat(40)).unwrap();
        let addr = NodeAddress::parse(&format!("memory:{}", id)).unwrap();
        assert_eq!(addr.protocol, Protocol::MEMORY);
        assert_eq!(addr.node_id, id);
        assert!(addr.hostname.is_empty());
        assert_eq!(NodeAddress::parse(&addr.to_string()).unwrap(), addr);
    }

    #[test]
    fn test_parse_invalid() {
        let id = test_id();
        // No node ID.
        assert!(NodeAddress::parse("tcp://host.domain:26657").is_err());
        // Invalid node ID.
        assert!(NodeAddress::parse("tcp://foo@host.domain:26657").is_err());
        assert!(NodeAddress::parse("memory:foo").is_err());
        // Invalid port.
        assert!(NodeAddress::parse(&format!("tcp://{}@host.domain:99999", id)).is_err());
        // Empty input.
        assert!(NodeAddress::parse("").is_err());
    }

    #[test]
    fn test_validate_port_without_hostname() {
        let addr = NodeAddress {
            node_id: test_id(),
            protocol: Protocol::TCP,
            hostname: String::new(),
            port: 26657,
            path: String::new(),
        };
        assert!(addr.validate().is_err());
    }

    #[test]
    fn test_display_roundtrip() {
        let id = test_id();
        for input in [
            format!("tcp://{}@host.domain:26657", id),
            format!("tcp://{}@host.domain:26657/path", id),
            format!("memory:{}", id),
        ] {
            let addr = NodeAddress::parse(&input).unwrap();
            let reparsed = NodeAddress::parse(&addr.to_string()).unwrap();
            assert_eq!(addr, reparsed, "{}", input);
        }
    }

    #[tokio::test]
    async fn test_resolve_opaque() {
        let id = test_id();
        let addr = NodeAddress::opaque(Protocol::MEMORY, id.clone());
        let endpoints = addr.resolve().await.unwrap();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].protocol, Protocol::MEMORY);
        assert_eq!(endpoints[0].ip, None);
        assert_eq!(endpoints[0].path, id.to_string());
    }

    #[tokio::test]
    async fn test_resolve_localhost() {
        let id = test_id();
        let addr = NodeAddress::parse(&format!("tcp://{}@localhost:26657", id)).unwrap();
        let endpoints = addr.resolve().await.unwrap();
        assert!(!endpoints.is_empty());
        for endpoint in &endpoints {
            assert!(endpoint.ip.unwrap().is_loopback());
            assert_eq!(endpoint.port, 26657);
        }
    }

    #[test]
    fn test_endpoint_validate() {
        let good = Endpoint::new(Protocol::TCP, IpAddr::from([127, 0, 0, 1]), 26657);
        assert!(good.validate().is_ok());

        let path_only = Endpoint::path_only(Protocol::MEMORY, test_id().to_string());
        assert!(path_only.validate().is_ok());

        let bad = Endpoint {
            protocol: Protocol::TCP,
            ip: None,
            port: 0,
            path: String::new(),
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_endpoint_node_address() {
        let id = test_id();
        let endpoint = Endpoint::new(Protocol::TCP, IpAddr::from([10, 0, 0, 1]), 26657);
        let addr = endpoint.node_address(id.clone());
        assert_eq!(addr.hostname, "10.0.0.1");
        assert_eq!(addr.port, 26657);
        assert!(addr.validate().is_ok());

        let opaque = Endpoint::path_only(Protocol::MEMORY, id.to_string());
        let addr = opaque.node_address(id.clone());
        assert!(addr.path.is_empty());
        assert_eq!(addr.to_string(), format!("memory:{}", id));
    }
}
