//! SMB client error types
//!
//! Defines the lifecycle error taxonomy and the NTSTATUS codes a client
//! sees while negotiating, authenticating and tree-connecting.

use thiserror::Error;

/// Result type for connection lifecycle operations
pub type ConnResult<T> = Result<T, ConnError>;

/// Connection lifecycle errors
#[derive(Debug, Clone, Error)]
pub enum ConnError {
    /// No matching resource and creation was not requested
    #[error("not found: {0}")]
    NotFound(String),

    /// A matching resource already exists
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Owner, group or privilege check failed
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Object is being or has been torn down
    #[error("object is gone")]
    Gone,

    /// Lock ownership or recursion misuse
    #[error("busy: {0}")]
    Busy(String),

    /// The exchange collaborator reported a failure
    #[error("exchange failed: {0}")]
    ExchangeFailed(#[from] ExchangeError),

    /// Invalid or unreadable configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl ConnError {
    /// NT status carried by an exchange failure, if any
    pub fn status(&self) -> Option<NtStatus> {
        match self {
            Self::ExchangeFailed(e) => Some(e.status),
            _ => None,
        }
    }
}

/// Failure reported by the exchange collaborator
///
/// The cause is opaque to the lifecycle core; it is kept cloneable so a
/// failed handshake can be replayed to every later user of the same circuit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{status}: {detail}")]
pub struct ExchangeError {
    /// Status returned by the server or synthesized by the transport
    pub status: NtStatus,
    /// Human readable detail
    pub detail: String,
}

impl ExchangeError {
    /// Create a new exchange error
    pub fn new(status: NtStatus, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }
}

/// NT Status codes (subset seen by a client during connection setup)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum NtStatus {
    /// Success
    Success = 0x00000000,
    /// Pending
    Pending = 0x00000103,
    /// Invalid parameter
    InvalidParameter = 0xC000000D,
    /// More processing required (multi-leg session setup)
    MoreProcessingRequired = 0xC0000016,
    /// Access denied
    AccessDenied = 0xC0000022,
    /// Logon failure
    LogonFailure = 0xC000006D,
    /// Account restriction
    AccountRestriction = 0xC000006E,
    /// Password expired
    PasswordExpired = 0xC0000071,
    /// Insufficient resources
    InsufficientResources = 0xC000009A,
    /// IO timeout
    IoTimeout = 0xC00000B5,
    /// Not supported
    NotSupported = 0xC00000BB,
    /// Network access denied
    NetworkAccessDenied = 0xC00000CA,
    /// Bad network name (share not found)
    BadNetworkName = 0xC00000CC,
    /// Request not accepted
    RequestNotAccepted = 0xC00000D0,
    /// Connection refused
    ConnectionRefused = 0xC0000236,
    /// Connection reset
    ConnectionReset = 0xC000020D,
    /// Connection disconnected
    ConnectionDisconnected = 0xC000020C,
    /// User session deleted
    UserSessionDeleted = 0xC0000203,
    /// Network session expired
    NetworkSessionExpired = 0xC000035C,
    /// Logon type not granted
    LogonTypeNotGranted = 0xC000015B,
    /// SMB bad TID
    SmbBadTid = 0x00050002,
    /// SMB bad UID
    SmbBadUid = 0x005B0002,
}

impl std::fmt::Display for NtStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} (0x{:08X})", self, *self as u32)
    }
}
