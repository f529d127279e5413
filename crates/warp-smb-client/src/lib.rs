//! SMB client connection lifecycle for WARP
//!
//! This crate manages the long-lived objects of an SMB client: virtual
//! circuits (one authenticated session to one server) and the shares
//! tree-connected over them. It decides when an existing circuit or share
//! can be reused, creates them when not, drives their handshakes through a
//! pluggable [`Exchange`] and tears them down when the last reference goes.
//!
//! # Features
//!
//! - Reference-counted, recursively lockable objects with drain-on-teardown
//! - Lookup-or-create that never builds two circuits for one spec
//! - Private and single-share circuits, Unix owner/group/mode matching
//! - Failed handshakes invalidate the circuit and are replayed, not retried
//! - Serializable snapshots of every live circuit and share
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────┐
//! │ SessionManager │
//! └───────┬────────┘
//!         │ lookup-or-create
//! ┌───────▼────────────┐
//! │ ConnectionRegistry │
//! │   VirtualCircuit   │──── Exchange (negotiate, session setup, ...)
//! │     └─ Share       │
//! └────────────────────┘
//! ```

#![warn(missing_docs)]

pub mod access;
pub mod addr;
pub mod config;
pub mod connobj;
pub mod error;
pub mod exchange;
pub mod registry;
pub mod session;
pub mod share;
pub mod vc;

pub use access::{AccessMode, AccessPolicy, Credential, IdSpec, Secret, UnixAccess};
pub use addr::ServerAddr;
pub use config::{AuthLevel, ClientConfig, SmbDialect};
pub use connobj::{ConnObj, ConnObject, Level, LifecycleListener, ObjId};
pub use error::{ConnError, ConnResult, ExchangeError, NtStatus};
pub use exchange::{Connector, Exchange, ExchangeEvent, ExchangeReply, ExchangeTarget};
pub use registry::ConnectionRegistry;
pub use session::SessionManager;
pub use share::{Share, ShareHandle, ShareInfo, ShareSpec, ShareType};
pub use vc::{LockedVc, LookupScope, VcHandle, VcInfo, VcSpec, VcState, VirtualCircuit};
