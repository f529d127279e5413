//! Server transport addresses

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Address a circuit connects to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerAddr {
    /// Direct TCP (port 445)
    Inet(SocketAddr),
    /// NetBIOS session service (port 139) with a called name
    NetBios {
        /// NetBIOS called name
        name: String,
        /// Resolved socket address
        addr: SocketAddr,
    },
}

impl From<SocketAddr> for ServerAddr {
    fn from(addr: SocketAddr) -> Self {
        Self::Inet(addr)
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inet(addr) => write!(f, "{addr}"),
            Self::NetBios { name, addr } => write!(f, "{name}@{addr}"),
        }
    }
}

/// Check whether two addresses reach the same endpoint
///
/// NetBIOS names compare case-insensitively; different transports never match.
pub fn address_equals(a: &ServerAddr, b: &ServerAddr) -> bool {
    match (a, b) {
        (ServerAddr::Inet(x), ServerAddr::Inet(y)) => x == y,
        (
            ServerAddr::NetBios { name: n1, addr: a1 },
            ServerAddr::NetBios { name: n2, addr: a2 },
        ) => a1 == a2 && n1.eq_ignore_ascii_case(n2),
        _ => false,
    }
}
