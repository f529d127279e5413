//! Network exchange seam
//!
//! The lifecycle core never frames SMB requests itself. Every protocol phase
//! is handed to an [`Exchange`] bound to the circuit, which performs the
//! round trip synchronously and reports the outcome.

use std::fmt;
use std::sync::Arc;

use crate::addr::ServerAddr;
use crate::config::SmbDialect;
use crate::error::ExchangeError;
use crate::share::Share;
use crate::vc::VirtualCircuit;

/// Protocol phase requested from the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeEvent {
    /// Dialect negotiation
    Negotiate,
    /// Authentication
    SessionSetup,
    /// Attach a share
    TreeConnect,
    /// Detach a share
    TreeDisconnect,
    /// Tear down the circuit (must tolerate never-negotiated circuits)
    Disconnect,
}

impl fmt::Display for ExchangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Negotiate => "negotiate",
            Self::SessionSetup => "session-setup",
            Self::TreeConnect => "tree-connect",
            Self::TreeDisconnect => "tree-disconnect",
            Self::Disconnect => "disconnect",
        };
        f.write_str(name)
    }
}

/// Object an exchange event applies to
#[derive(Clone, Copy)]
pub enum ExchangeTarget<'a> {
    /// Circuit-level phases
    Circuit(&'a VirtualCircuit),
    /// Share-level phases, with the owning circuit
    Share {
        /// Owning circuit
        vc: &'a VirtualCircuit,
        /// Share being attached or detached
        share: &'a Share,
    },
}

impl ExchangeTarget<'_> {
    /// Circuit the event travels over
    pub fn circuit(&self) -> &VirtualCircuit {
        match self {
            Self::Circuit(vc) => vc,
            Self::Share { vc, .. } => vc,
        }
    }
}

impl fmt::Debug for ExchangeTarget<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Circuit(vc) => f.debug_tuple("Circuit").field(&vc.id()).finish(),
            Self::Share { vc, share } => f
                .debug_struct("Share")
                .field("vc", &vc.id())
                .field("share", &share.name())
                .finish(),
        }
    }
}

/// Result of a successful exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeReply {
    /// Negotiate finished with the given dialect
    Negotiated {
        /// Dialect selected by the server
        dialect: SmbDialect,
    },
    /// Session setup finished
    SessionEstablished {
        /// Server-assigned session id
        session_id: u64,
    },
    /// Tree connect finished
    TreeConnected {
        /// Server-assigned tree id
        tree_id: u32,
    },
    /// Phase finished without data
    Done,
}

/// Exchange collaborator bound to one circuit
pub trait Exchange: Send + Sync {
    /// Perform one protocol phase synchronously
    fn perform(
        &self,
        target: ExchangeTarget<'_>,
        event: ExchangeEvent,
    ) -> Result<ExchangeReply, ExchangeError>;
}

/// Factory binding a fresh exchange to each new circuit
pub trait Connector: Send + Sync {
    /// Bind an exchange for a circuit to `server`
    fn bind(&self, server: &ServerAddr) -> Arc<dyn Exchange>;
}

impl<F> Connector for F
where
    F: Fn(&ServerAddr) -> Arc<dyn Exchange> + Send + Sync,
{
    fn bind(&self, server: &ServerAddr) -> Arc<dyn Exchange> {
        self(server)
    }
}
