//! Shares attached over a circuit
//!
//! A share is one tree connection. It lives under exactly one circuit and
//! holds a reference on it until the share is freed.

use std::any::Any;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::access::{
    may_assign, ownership_matches, AccessMode, AccessPolicy, Credential, IdSpec, Ownership, Secret,
};
use crate::connobj::{ConnObj, ConnObject, Level, ObjId};
use crate::error::{ConnError, ConnResult};
use crate::exchange::{ExchangeEvent, ExchangeReply};
use crate::registry::{ConnectionRegistry, Node};
use crate::vc::VirtualCircuit;

/// Share type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[repr(u32)]
pub enum ShareType {
    /// Disk share
    #[default]
    Disk = 0x00000000,
    /// Print queue
    PrintQueue = 0x00000001,
    /// Named pipe
    NamedPipe = 0x00000002,
    /// Communication device
    CommDevice = 0x00000003,
    /// Let the server report the type
    Any = 0x000000FF,
}

/// Lookup-or-create request for a share
#[derive(Debug, Clone)]
pub struct ShareSpec {
    /// Share name
    pub name: String,
    /// Share type
    pub share_type: ShareType,
    /// Requested owner
    pub owner: IdSpec,
    /// Requested group
    pub group: IdSpec,
    /// Requested rights; the configured default applies when unset
    pub mode: Option<AccessMode>,
    /// Share-level password; the circuit password is used when unset
    pub password: Option<Secret>,
}

impl ShareSpec {
    /// Spec for a disk share named `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            share_type: ShareType::Disk,
            owner: IdSpec::Any,
            group: IdSpec::Any,
            mode: None,
            password: None,
        }
    }

    /// Set the share type
    pub fn share_type(mut self, share_type: ShareType) -> Self {
        self.share_type = share_type;
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

    /// Set a share-level password
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(Secret::new(password));
        self
    }

    /// Requested rights, falling back to `default`
    pub fn effective_mode(&self, default: AccessMode) -> AccessMode {
        self.mode.unwrap_or(default)
    }
}

/// Opaque link to whatever mounted the share
pub type MountLink = Arc<dyn Any + Send + Sync>;

#[derive(Default)]
struct TreeState {
    tree_id: Option<u32>,
}

/// One tree connection
pub struct Share {
    conn: ConnObj,
    name: String,
    share_type: ShareType,
    ownership: Ownership,
    password: Mutex<Option<Secret>>,
    tree: Mutex<TreeState>,
    connect: Mutex<()>,
    mount: Mutex<Option<MountLink>>,
}

impl Share {
    /// Build and attach a share under `vc`
    ///
    /// The caller must hold the circuit lock. Fails with `AlreadyExists`
    /// when a matching share is attached or the circuit takes a single share
    /// and already has one. The share comes back referenced and unlocked.
    pub fn create(
        registry: &Arc<ConnectionRegistry>,
        vc: &VirtualCircuit,
        spec: &ShareSpec,
        mode: AccessMode,
        cred: &Credential,
        policy: &dyn AccessPolicy,
    ) -> ConnResult<ShareHandle> {
        if !vc.conn().is_locked_by_current() {
            return Err(ConnError::Busy(format!(
                "{} must be locked to attach a share",
                vc.id()
            )));
        }
        if !may_assign(spec.owner, spec.group, cred) {
            return Err(ConnError::PermissionDenied(format!(
                "uid {} may not create share {} owned by {:?}:{:?}",
                cred.uid(),
                spec.name,
                spec.owner,
                spec.group
            )));
        }
        if let Some(existing) = vc.lookup_share(registry, spec, mode, cred, policy)? {
            existing.release()?;
            return Err(ConnError::AlreadyExists(format!(
                "share {} on {}",
                spec.name,
                vc.id()
            )));
        }
        if vc.is_single_share() && vc.conn().child_count() > 0 {
            return Err(ConnError::AlreadyExists(format!(
                "{} is limited to a single share",
                vc.id()
            )));
        }

        let id = registry.allocate_id();
        let share = Arc::new(Self {
            conn: ConnObj::new(id, Level::Share, Some(vc.id())),
            name: spec.name.clone(),
            share_type: spec.share_type,
            ownership: Ownership {
                uid: spec.owner.resolve(cred.uid()),
                gid: spec.group.resolve(cred.gid()),
                mode: mode.stored(),
            },
            password: Mutex::new(spec.password.clone()),
            tree: Mutex::new(TreeState::default()),
            connect: Mutex::new(()),
            mount: Mutex::new(None),
        });
        registry.insert(Node::Share(share.clone()))?;

        info!(share = %id, vc = %vc.id(), name = %spec.name, "share created");
        Ok(ShareHandle::adopt(share, registry.clone()))
    }

    /// Object id
    pub fn id(&self) -> ObjId {
        self.conn.id()
    }

    /// Owning circuit id
    pub fn circuit_id(&self) -> ObjId {
        self.conn.parent().unwrap_or(ObjId::ROOT)
    }

    /// Share name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Requested share type
    pub fn share_type(&self) -> ShareType {
        self.share_type
    }

    /// Stored owner, group and mode
    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    /// Server-assigned tree id, while connected
    pub fn tree_id(&self) -> Option<u32> {
        self.tree.lock().tree_id
    }

    /// Check if the tree is connected
    pub fn is_valid(&self) -> bool {
        self.tree.lock().tree_id.is_some()
    }

    /// Forget the tree connection; the next `tree_connect` redoes it
    pub fn invalidate(&self) {
        let mut tree = self.tree.lock();
        if tree.tree_id.take().is_some() {
            debug!(share = %self.id(), "tree invalidated");
        }
    }

    /// Password for tree connect, falling back to the circuit's
    pub fn password(&self, vc: &VirtualCircuit) -> Secret {
        match &*self.password.lock() {
            Some(password) => password.clone(),
            None => vc.password(),
        }
    }

    /// Record what mounted the share
    pub fn set_mount(&self, link: MountLink) {
        *self.mount.lock() = Some(link);
    }

    /// Link to whatever mounted the share
    pub fn mount(&self) -> Option<MountLink> {
        self.mount.lock().clone()
    }

    /// Check whether this share satisfies a lookup
    pub fn matches(
        &self,
        spec: &ShareSpec,
        mode: AccessMode,
        cred: &Credential,
        policy: &dyn AccessPolicy,
    ) -> bool {
        self.name == spec.name
            && ownership_matches(&self.ownership, spec.owner, spec.group, mode, cred, policy)
    }

    /// Attach the tree over `vc`, unless already attached
    pub fn tree_connect(&self, vc: &VirtualCircuit) -> ConnResult<()> {
        if vc.id() != self.circuit_id() {
            return Err(ConnError::Busy(format!(
                "share {} belongs to {}, not {}",
                self.id(),
                self.circuit_id(),
                vc.id()
            )));
        }
        let _connect = self.connect.lock();
        if self.is_valid() {
            return Ok(());
        }
        if let Some(failure) = vc.failure() {
            return Err(failure.into());
        }
        if !vc.is_authenticated() {
            return Err(ConnError::Busy(format!(
                "{} has no session for a tree connect ({:?})",
                vc.id(),
                vc.state()
            )));
        }

        debug!(share = %self.id(), vc = %vc.id(), name = %self.name, "tree connect");
        let result = vc.exchange_share(self, ExchangeEvent::TreeConnect);
        match result {
            Ok(reply) => {
                let mut tree = self.tree.lock();
                let tree_id = match reply {
                    ExchangeReply::TreeConnected { tree_id } => tree_id,
                    _ => 0,
                };
                tree.tree_id = Some(tree_id);
                info!(share = %self.id(), tree_id, "tree connected");
                Ok(())
            }
            Err(e) => {
                self.invalidate();
                warn!(share = %self.id(), error = %e, "tree connect failed");
                Err(e.into())
            }
        }
    }

    /// Point-in-time description
    pub fn info(&self) -> ShareInfo {
        ShareInfo {
            id: self.id(),
            vc: self.circuit_id(),
            name: self.name.clone(),
            share_type: self.share_type,
            owner: self.ownership.uid,
            group: self.ownership.gid,
            mode: self.ownership.mode.bits(),
            tree_id: self.tree_id(),
            usecount: self.conn.usecount(),
        }
    }
}

impl ConnObject for Share {
    fn conn(&self) -> &ConnObj {
        &self.conn
    }

    fn on_gone(&self, registry: &ConnectionRegistry) {
        let Some(vc) = registry.circuit(self.circuit_id()) else {
            warn!(share = %self.id(), "owning circuit missing at teardown");
            return;
        };
        if let Err(e) = vc.exchange_share(self, ExchangeEvent::TreeDisconnect) {
            warn!(share = %self.id(), error = %e, "tree disconnect failed");
        }
        self.invalidate();
    }

    fn on_free(&self) {
        if let Some(password) = self.password.lock().as_mut() {
            password.clear();
        }
        self.mount.lock().take();
        debug!(share = %self.id(), "share freed");
    }
}

impl fmt::Debug for Share {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Share")
            .field("id", &self.id())
            .field("vc", &self.circuit_id())
            .field("name", &self.name)
            .field("tree_id", &self.tree_id())
            .finish()
    }
}

/// Counted reference to a share, released on drop
pub struct ShareHandle {
    share: Arc<Share>,
    registry: Arc<ConnectionRegistry>,
    released: bool,
}

impl ShareHandle {
    pub(crate) fn adopt(share: Arc<Share>, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            share,
            registry,
            released: false,
        }
    }

    /// Take another reference
    pub fn try_clone(&self) -> ConnResult<Self> {
        self.share.conn.add_ref()?;
        Ok(Self::adopt(self.share.clone(), self.registry.clone()))
    }

    /// Underlying share
    pub fn share(&self) -> &Arc<Share> {
        &self.share
    }

    /// Owning circuit, while it is registered
    pub fn circuit(&self) -> Option<Arc<VirtualCircuit>> {
        self.registry.circuit(self.share.circuit_id())
    }

    /// Drop the reference, reporting errors
    pub fn release(mut self) -> ConnResult<()> {
        self.released = true;
        self.registry.release(&Node::Share(self.share.clone()))
    }
}

impl Deref for ShareHandle {
    type Target = Share;

    fn deref(&self) -> &Share {
        &self.share
    }
}

impl Drop for ShareHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.registry.release(&Node::Share(self.share.clone())) {
            warn!(share = %self.share.id(), error = %e, "share release failed");
        }
    }
}

impl fmt::Debug for ShareHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ShareHandle").field(&self.share).finish()
    }
}

/// Serializable description of a share
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareInfo {
    /// Object id
    pub id: ObjId,
    /// Owning circuit id
    pub vc: ObjId,
    /// Share name
    pub name: String,
    /// Share type
    pub share_type: ShareType,
    /// Owning uid
    pub owner: u32,
    /// Owning gid
    pub group: u32,
    /// Permission bits
    pub mode: u32,
    /// Tree id while connected
    pub tree_id: Option<u32>,
    /// Use count
    pub usecount: u32,
}
