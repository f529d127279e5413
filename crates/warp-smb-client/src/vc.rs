//! Virtual circuits
//!
//! A virtual circuit is one authenticated session to one server, shared by
//! every caller whose lookup spec it satisfies. It owns the negotiated
//! dialect, the session id, the request sequence counter and the shares
//! attached over it.
//!
//! Negotiate and session setup are serialized by a per-circuit handshake
//! mutex, separate from the object lock, so a caller that reuses a circuit
//! still in its handshake waits for the outcome instead of repeating it. A
//! failed handshake marks the circuit `INVALID` and keeps the failure, which
//! later callers get back unchanged.

use std::fmt;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::access::{
    may_assign, ownership_matches, AccessMode, AccessPolicy, Credential, IdSpec, Ownership, Secret,
};
use crate::addr::{address_equals, ServerAddr};
use crate::config::{AuthLevel, ClientConfig, SmbDialect};
use crate::connobj::{ConnObj, ConnObject, HeldLock, Level, ObjId};
use crate::error::{ConnError, ConnResult, ExchangeError};
use crate::exchange::{Connector, Exchange, ExchangeEvent, ExchangeReply, ExchangeTarget};
use crate::registry::{ConnectionRegistry, Node};
use crate::share::{Share, ShareHandle, ShareInfo, ShareSpec};

/// Circuit flag bits, stored next to the generic object flags
pub struct VcFlags;

impl VcFlags {
    /// Only the owner (or a privileged caller) may reuse the circuit
    pub const PRIVATE: u32 = 0x0100;
    /// At most one share may be attached
    pub const SINGLE_SHARE: u32 = 0x0200;
    /// A handshake failed; the circuit is never matched again
    pub const INVALID: u32 = 0x0400;
}

/// Handshake progress of a circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum VcState {
    /// Registered, nothing sent yet
    Created,
    /// Negotiate in flight
    Negotiating,
    /// Dialect agreed
    Negotiated,
    /// Session setup in flight
    AuthenticatingSession,
    /// Ready for tree connects
    SessionEstablished,
    /// Disconnect in flight
    Disconnecting,
    /// Torn down
    Gone,
}

/// Which circuits a lookup may return
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupScope {
    /// Private circuits never match
    Shared,
    /// Private circuits match their owner and privileged callers
    PrivateVisible,
}

/// Lookup-or-create request for a circuit
#[derive(Debug, Clone)]
pub struct VcSpec {
    /// Server to connect to
    pub server: ServerAddr,
    /// Local address to bind, if any
    pub local: Option<SocketAddr>,
    /// Server name used in session setup
    pub server_name: String,
    /// Account name
    pub username: String,
    /// Account domain
    pub domain: String,
    /// Account password
    pub password: Secret,
    /// Requested owner
    pub owner: IdSpec,
    /// Requested group
    pub group: IdSpec,
    /// Requested rights; the configured default applies when unset
    pub mode: Option<AccessMode>,
    /// Create a private circuit
    pub private: bool,
    /// Allow at most one share on a new circuit
    pub single_share: bool,
    /// Create when nothing matches
    pub create: bool,
    /// Per-request override of the minimum authentication level
    pub min_auth_level: Option<AuthLevel>,
}

impl VcSpec {
    /// Spec for `username` on `server`, creating on miss
    pub fn new(server: impl Into<ServerAddr>, username: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            local: None,
            server_name: String::new(),
            username: username.into(),
            domain: String::new(),
            password: Secret::default(),
            owner: IdSpec::Any,
            group: IdSpec::Any,
            mode: None,
            private: false,
            single_share: false,
            create: true,
            min_auth_level: None,
        }
    }

    /// Set the password
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Secret::new(password);
        self
    }

    /// Set the domain
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    /// Set the server name
    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    /// Bind to a local address
    pub fn local(mut self, addr: SocketAddr) -> Self {
        self.local = Some(addr);
        self
    }

    /// Set the requested owner
    pub fn owner(mut self, owner: IdSpec) -> Self {
        self.owner = owner;
        self
    }

    /// Set the requested group
    pub fn group(mut self, group: IdSpec) -> Self {
        self.group = group;
        self
    }

    /// Set the requested rights
    pub fn mode(mut self, mode: AccessMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Request a private circuit
    pub fn private(mut self, private: bool) -> Self {
        self.private = private;
        self
    }

    /// Limit a new circuit to one share
    pub fn single_share(mut self, single: bool) -> Self {
        self.single_share = single;
        self
    }

    /// Set whether a miss creates a circuit
    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    /// Override the minimum authentication level
    pub fn min_auth_level(mut self, level: AuthLevel) -> Self {
        self.min_auth_level = Some(level);
        self
    }

    /// Requested rights, falling back to `default`
    pub fn effective_mode(&self, default: AccessMode) -> AccessMode {
        self.mode.unwrap_or(default)
    }
}

struct VcParams {
    username: String,
    domain: String,
    password: Secret,
    min_auth_level: AuthLevel,
}

struct VcStatus {
    state: VcState,
    dialect: Option<SmbDialect>,
    session_id: Option<u64>,
    failure: Option<ExchangeError>,
}

/// One authenticated session to one server
pub struct VirtualCircuit {
    conn: ConnObj,
    server: ServerAddr,
    local: Option<SocketAddr>,
    server_name: String,
    ownership: Ownership,
    params: RwLock<VcParams>,
    status: Mutex<VcStatus>,
    handshake: Mutex<()>,
    sequence: AtomicU64,
    dialects: Vec<SmbDialect>,
    timeout: Duration,
    max_tx_size: u32,
    exchange: Arc<dyn Exchange>,
}

impl VirtualCircuit {
    /// Build and register a circuit under the registry root
    ///
    /// The caller must hold the registry lock. The circuit is returned
    /// locked by the current thread, holding the creator's reference; no
    /// network traffic happens here.
    pub fn create(
        registry: &Arc<ConnectionRegistry>,
        config: &ClientConfig,
        connector: &dyn Connector,
        spec: &VcSpec,
        cred: &Credential,
    ) -> ConnResult<LockedVc> {
        if !may_assign(spec.owner, spec.group, cred) {
            return Err(ConnError::PermissionDenied(format!(
                "uid {} may not create a circuit owned by {:?}:{:?}",
                cred.uid(),
                spec.owner,
                spec.group
            )));
        }

        let id = registry.allocate_id();
        let mode = spec.effective_mode(config.default_mode);
        let vc = Arc::new(Self {
            conn: ConnObj::new(id, Level::VirtualCircuit, Some(ObjId::ROOT)),
            server: spec.server.clone(),
            local: spec.local,
            server_name: spec.server_name.clone(),
            ownership: Ownership {
                uid: spec.owner.resolve(cred.uid()),
                gid: spec.group.resolve(cred.gid()),
                mode: mode.stored(),
            },
            params: RwLock::new(VcParams {
                username: spec.username.clone(),
                domain: spec.domain.clone(),
                password: spec.password.clone(),
                min_auth_level: spec.min_auth_level.unwrap_or(config.min_auth_level),
            }),
            status: Mutex::new(VcStatus {
                state: VcState::Created,
                dialect: None,
                session_id: None,
                failure: None,
            }),
            handshake: Mutex::new(()),
            sequence: AtomicU64::new(0),
            dialects: config.dialects.clone(),
            timeout: config.request_timeout(),
            max_tx_size: config.max_tx_size,
            exchange: connector.bind(&spec.server),
        });

        let mut flags = 0;
        if spec.private {
            flags |= VcFlags::PRIVATE;
        }
        if spec.single_share {
            flags |= VcFlags::SINGLE_SHARE;
        }
        vc.conn.set_flags(flags);

        // not yet published, so this cannot block
        vc.conn.lock()?;
        let lock = HeldLock::assume(vc.clone());
        registry.insert(Node::Circuit(vc.clone()))?;

        info!(
            vc = %id,
            server = %vc.server,
            user = %spec.username,
            private = spec.private,
            "virtual circuit created"
        );
        Ok(LockedVc {
            lock,
            handle: VcHandle::adopt(vc, registry.clone()),
        })
    }

    /// Object id
    pub fn id(&self) -> ObjId {
        self.conn.id()
    }

    /// Server address
    pub fn server(&self) -> &ServerAddr {
        &self.server
    }

    /// Local address, if bound
    pub fn local(&self) -> Option<SocketAddr> {
        self.local
    }

    /// Server name used in session setup
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Account name
    pub fn username(&self) -> String {
        self.params.read().username.clone()
    }

    /// Account domain
    pub fn domain(&self) -> String {
        self.params.read().domain.clone()
    }

    /// Account password, for the exchange layer
    pub fn password(&self) -> Secret {
        self.params.read().password.clone()
    }

    /// Minimum authentication level for session setup
    pub fn min_auth_level(&self) -> AuthLevel {
        self.params.read().min_auth_level
    }

    /// Stored owner, group and mode
    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    /// Dialects offered in negotiate
    pub fn dialects(&self) -> &[SmbDialect] {
        &self.dialects
    }

    /// Per-request timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Maximum transaction size
    pub fn max_tx_size(&self) -> u32 {
        self.max_tx_size
    }

    /// Handshake progress
    pub fn state(&self) -> VcState {
        self.status.lock().state
    }

    /// Negotiated dialect
    pub fn dialect(&self) -> Option<SmbDialect> {
        self.status.lock().dialect
    }

    /// Server-assigned session id
    pub fn session_id(&self) -> Option<u64> {
        self.status.lock().session_id
    }

    /// Handshake failure kept for replay
    pub fn failure(&self) -> Option<ExchangeError> {
        self.status.lock().failure.clone()
    }

    /// Check if the session is established
    pub fn is_authenticated(&self) -> bool {
        self.state() == VcState::SessionEstablished
    }

    /// Check if the circuit is private
    pub fn is_private(&self) -> bool {
        self.conn.has_flag(VcFlags::PRIVATE)
    }

    /// Check if the circuit takes at most one share
    pub fn is_single_share(&self) -> bool {
        self.conn.has_flag(VcFlags::SINGLE_SHARE)
    }

    /// Check if a handshake failed
    pub fn is_invalid(&self) -> bool {
        self.conn.has_flag(VcFlags::INVALID)
    }

    /// Next request sequence number
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    /// Copy credentials and parameters from `spec` before session setup
    ///
    /// Can be repeated until session setup starts.
    pub fn setup(&self, spec: &VcSpec) -> ConnResult<()> {
        if self.state() >= VcState::AuthenticatingSession {
            return Err(ConnError::Busy(format!(
                "{} is past session setup",
                self.id()
            )));
        }
        let mut params = self.params.write();
        params.username = spec.username.clone();
        params.domain = spec.domain.clone();
        params.password = spec.password.clone();
        if let Some(level) = spec.min_auth_level {
            params.min_auth_level = level;
        }
        Ok(())
    }

    /// Negotiate the dialect, once
    ///
    /// Returns immediately on a negotiated circuit and replays a stored
    /// failure without contacting the server.
    pub fn negotiate(&self) -> ConnResult<()> {
        let hs = self.handshake.lock();
        self.negotiate_locked(&hs)
    }

    /// Authenticate, negotiating first if needed
    pub fn session_setup(&self) -> ConnResult<()> {
        let hs = self.handshake.lock();
        self.session_setup_locked(&hs)
    }

    /// Adopt `spec`'s credentials and authenticate, unless already done
    pub(crate) fn authenticate(&self, spec: &VcSpec) -> ConnResult<()> {
        let hs = self.handshake.lock();
        if let Some(failure) = self.failure() {
            return Err(failure.into());
        }
        if self.is_authenticated() {
            return Ok(());
        }
        self.setup(spec)?;
        self.session_setup_locked(&hs)
    }

    fn negotiate_locked(&self, _hs: &MutexGuard<'_, ()>) -> ConnResult<()> {
        {
            let mut st = self.status.lock();
            if let Some(failure) = &st.failure {
                return Err(failure.clone().into());
            }
            match st.state {
                VcState::Created => st.state = VcState::Negotiating,
                VcState::Disconnecting | VcState::Gone => return Err(ConnError::Gone),
                _ => return Ok(()),
            }
        }

        debug!(vc = %self.id(), server = %self.server, "negotiating");
        let result = self
            .exchange
            .perform(ExchangeTarget::Circuit(self), ExchangeEvent::Negotiate);

        let mut st = self.status.lock();
        match result {
            Ok(reply) => {
                let dialect = match reply {
                    ExchangeReply::Negotiated { dialect } => dialect,
                    _ => self.dialects.iter().copied().max().unwrap_or_default(),
                };
                st.state = VcState::Negotiated;
                st.dialect = Some(dialect);
                info!(vc = %self.id(), ?dialect, "negotiated");
                Ok(())
            }
            Err(e) => {
                st.state = VcState::Created;
                st.failure = Some(e.clone());
                drop(st);
                self.conn.set_flags(VcFlags::INVALID);
                warn!(vc = %self.id(), error = %e, "negotiate failed");
                Err(e.into())
            }
        }
    }

    fn session_setup_locked(&self, hs: &MutexGuard<'_, ()>) -> ConnResult<()> {
        self.negotiate_locked(hs)?;
        {
            let mut st = self.status.lock();
            match st.state {
                VcState::Negotiated => st.state = VcState::AuthenticatingSession,
                VcState::SessionEstablished => return Ok(()),
                VcState::Disconnecting | VcState::Gone => return Err(ConnError::Gone),
                other => {
                    return Err(ConnError::Busy(format!(
                        "{} cannot authenticate in state {other:?}",
                        self.id()
                    )))
                }
            }
        }

        debug!(vc = %self.id(), user = %self.username(), "session setup");
        let result = self
            .exchange
            .perform(ExchangeTarget::Circuit(self), ExchangeEvent::SessionSetup);

        let mut st = self.status.lock();
        match result {
            Ok(reply) => {
                let session_id = match reply {
                    ExchangeReply::SessionEstablished { session_id } => session_id,
                    _ => 0,
                };
                st.state = VcState::SessionEstablished;
                st.session_id = Some(session_id);
                info!(vc = %self.id(), session_id, "session established");
                Ok(())
            }
            Err(e) => {
                st.state = VcState::Negotiated;
                st.failure = Some(e.clone());
                drop(st);
                self.conn.set_flags(VcFlags::INVALID);
                warn!(vc = %self.id(), error = %e, "session setup failed");
                Err(e.into())
            }
        }
    }

    /// Run a share-level phase over this circuit
    pub(crate) fn exchange_share(
        &self,
        share: &Share,
        event: ExchangeEvent,
    ) -> Result<ExchangeReply, ExchangeError> {
        self.exchange
            .perform(ExchangeTarget::Share { vc: self, share }, event)
    }

    /// Send the disconnect, whatever state the circuit reached
    fn disconnect(&self) {
        let previous = {
            let mut st = self.status.lock();
            let previous = st.state;
            st.state = VcState::Disconnecting;
            previous
        };
        if let Err(e) = self
            .exchange
            .perform(ExchangeTarget::Circuit(self), ExchangeEvent::Disconnect)
        {
            warn!(vc = %self.id(), error = %e, "disconnect failed");
        }
        let mut st = self.status.lock();
        st.state = VcState::Gone;
        st.session_id = None;
        debug!(vc = %self.id(), ?previous, "disconnected");
    }

    /// Check whether this circuit satisfies a lookup
    pub fn matches(
        &self,
        spec: &VcSpec,
        mode: AccessMode,
        cred: &Credential,
        policy: &dyn AccessPolicy,
        scope: LookupScope,
    ) -> bool {
        if self.is_invalid() || !address_equals(&self.server, &spec.server) {
            return false;
        }
        if self.params.read().username != spec.username {
            return false;
        }
        // a private request only ever reuses a private circuit
        if spec.private && !self.is_private() {
            return false;
        }
        if self.is_private() {
            let visible = match scope {
                LookupScope::Shared => false,
                LookupScope::PrivateVisible => {
                    cred.is_privileged() || cred.uid() == self.ownership.uid
                }
            };
            if !visible {
                return false;
            }
        }
        if !ownership_matches(&self.ownership, spec.owner, spec.group, mode, cred, policy) {
            return false;
        }
        // exact circuit requests still pass the access check
        !mode.is_exact() || policy.access(&self.ownership, mode, cred)
    }

    /// Find an attached share matching `spec`, returning it referenced
    ///
    /// The caller must hold this circuit's lock.
    pub fn lookup_share(
        &self,
        registry: &Arc<ConnectionRegistry>,
        spec: &ShareSpec,
        mode: AccessMode,
        cred: &Credential,
        policy: &dyn AccessPolicy,
    ) -> ConnResult<Option<ShareHandle>> {
        if !self.conn.is_locked_by_current() {
            return Err(ConnError::Busy(format!(
                "{} must be locked to scan its shares",
                self.id()
            )));
        }
        for id in self.conn.children() {
            let Some(share) = registry.share(id) else {
                continue;
            };
            // a share in teardown is skipped
            if share.conn().lock().is_err() {
                continue;
            }
            let found = share.matches(spec, mode, cred, policy) && share.conn().add_ref().is_ok();
            let _ = share.conn().unlock();
            if found {
                debug!(vc = %self.id(), share = %id, name = %spec.name, "share reused");
                return Ok(Some(ShareHandle::adopt(share, registry.clone())));
            }
        }
        Ok(None)
    }

    /// Point-in-time description
    pub fn info(&self) -> VcInfo {
        let (username, domain, min_auth_level) = {
            let params = self.params.read();
            (
                params.username.clone(),
                params.domain.clone(),
                params.min_auth_level,
            )
        };
        let (state, dialect, session_id, failure) = {
            let st = self.status.lock();
            (
                st.state,
                st.dialect,
                st.session_id,
                st.failure.as_ref().map(|e| e.to_string()),
            )
        };
        VcInfo {
            id: self.id(),
            server: self.server.to_string(),
            server_name: self.server_name.clone(),
            username,
            domain,
            owner: self.ownership.uid,
            group: self.ownership.gid,
            mode: self.ownership.mode.bits(),
            private: self.is_private(),
            single_share: self.is_single_share(),
            invalid: self.is_invalid(),
            min_auth_level,
            state,
            dialect,
            session_id,
            failure,
            usecount: self.conn.usecount(),
            shares: Vec::new(),
        }
    }
}

impl ConnObject for VirtualCircuit {
    fn conn(&self) -> &ConnObj {
        &self.conn
    }

    fn on_gone(&self, _registry: &ConnectionRegistry) {
        self.disconnect();
    }

    fn on_free(&self) {
        self.params.write().password.clear();
        debug!(vc = %self.id(), "circuit freed");
    }
}

impl fmt::Debug for VirtualCircuit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualCircuit")
            .field("id", &self.id())
            .field("server", &self.server)
            .field("state", &self.state())
            .field("usecount", &self.conn.usecount())
            .finish()
    }
}

/// Counted reference to a circuit, released on drop
pub struct VcHandle {
    vc: Arc<VirtualCircuit>,
    registry: Arc<ConnectionRegistry>,
    released: bool,
}

impl VcHandle {
    /// Wrap a reference the caller already took
    pub(crate) fn adopt(vc: Arc<VirtualCircuit>, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            vc,
            registry,
            released: false,
        }
    }

    /// Take another reference
    pub fn try_clone(&self) -> ConnResult<Self> {
        self.vc.conn.add_ref()?;
        Ok(Self::adopt(self.vc.clone(), self.registry.clone()))
    }

    /// Underlying circuit
    pub fn circuit(&self) -> &Arc<VirtualCircuit> {
        &self.vc
    }

    /// Registry the circuit lives in
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Acquire the circuit lock
    pub fn lock(self) -> ConnResult<LockedVc> {
        self.vc.conn.lock()?;
        Ok(LockedVc {
            lock: HeldLock::assume(self.vc.clone()),
            handle: self,
        })
    }

    /// Drop the reference, reporting errors
    pub fn release(mut self) -> ConnResult<()> {
        self.released = true;
        self.registry.release(&Node::Circuit(self.vc.clone()))
    }
}

impl Deref for VcHandle {
    type Target = VirtualCircuit;

    fn deref(&self) -> &VirtualCircuit {
        &self.vc
    }
}

impl Drop for VcHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.registry.release(&Node::Circuit(self.vc.clone())) {
            warn!(vc = %self.vc.id(), error = %e, "circuit release failed");
        }
    }
}

impl fmt::Debug for VcHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("VcHandle").field(&self.vc).finish()
    }
}

/// Referenced circuit whose lock the current thread holds
///
/// Dropping it unlocks, then releases the reference. The lock belongs to the
/// acquiring thread, so a `LockedVc` cannot be sent to another one:
///
/// ```compile_fail
/// fn assert_send<T: Send>() {}
/// assert_send::<warp_smb_client::LockedVc>();
/// ```
pub struct LockedVc {
    lock: HeldLock<VirtualCircuit>,
    handle: VcHandle,
}

impl LockedVc {
    /// Leave the lock, keeping the reference
    pub fn unlock(self) -> VcHandle {
        let LockedVc { lock, handle } = self;
        drop(lock);
        handle
    }

    /// Referenced handle, still locked
    pub fn handle(&self) -> &VcHandle {
        &self.handle
    }
}

impl Deref for LockedVc {
    type Target = VirtualCircuit;

    fn deref(&self) -> &VirtualCircuit {
        &self.handle
    }
}

impl fmt::Debug for LockedVc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LockedVc").field(&self.handle.vc).finish()
    }
}

/// Serializable description of a circuit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcInfo {
    /// Object id
    pub id: ObjId,
    /// Server address
    pub server: String,
    /// Server name
    pub server_name: String,
    /// Account name
    pub username: String,
    /// Account domain
    pub domain: String,
    /// Owning uid
    pub owner: u32,
    /// Owning gid
    pub group: u32,
    /// Permission bits
    pub mode: u32,
    /// Private flag
    pub private: bool,
    /// Single-share flag
    pub single_share: bool,
    /// Invalid flag
    pub invalid: bool,
    /// Minimum authentication level
    pub min_auth_level: AuthLevel,
    /// Handshake progress
    pub state: VcState,
    /// Negotiated dialect
    pub dialect: Option<SmbDialect>,
    /// Session id
    pub session_id: Option<u64>,
    /// Stored handshake failure
    pub failure: Option<String>,
    /// Use count
    pub usecount: u32,
    /// Attached shares
    pub shares: Vec<ShareInfo>,
}

impl VcInfo {
    /// Attach share descriptions
    pub fn with_shares(mut self, shares: Vec<ShareInfo>) -> Self {
        self.shares = shares;
        self
    }
}
