//! Connection registry
//!
//! Owns every live circuit and share. Objects are stored in an arena keyed
//! by [`ObjId`]; parents keep child ids, children keep their parent id, and
//! memory is owned by the arena rather than by those links. The root
//! [`ConnObj`] of level `Registry` is the parent of every circuit and its
//! lock serializes lookup-or-create scans.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, error, info, warn};

use crate::connobj::{CoGuard, ConnObj, ConnObject, Level, LifecycleListener, ObjId, Release};
use crate::error::{ConnError, ConnResult};
use crate::share::{Share, ShareInfo};
use crate::vc::{VcInfo, VirtualCircuit};

/// Arena entry
#[derive(Clone)]
pub(crate) enum Node {
    Circuit(Arc<VirtualCircuit>),
    Share(Arc<Share>),
}

impl Node {
    fn object(&self) -> &dyn ConnObject {
        match self {
            Self::Circuit(vc) => vc.as_ref(),
            Self::Share(share) => share.as_ref(),
        }
    }

    fn conn(&self) -> &ConnObj {
        self.object().conn()
    }
}

/// Process-wide list of circuits
pub struct ConnectionRegistry {
    root: ConnObj,
    objects: DashMap<ObjId, Node>,
    next_id: AtomicU64,
    listener: Option<Arc<dyn LifecycleListener>>,
}

impl ConnectionRegistry {
    /// Create an empty registry holding only its own reference
    pub fn new() -> Self {
        info!("connection registry initialized");
        Self {
            root: ConnObj::new(ObjId::ROOT, Level::Registry, None),
            objects: DashMap::new(),
            next_id: AtomicU64::new(1),
            listener: None,
        }
    }

    /// Create a registry reporting teardown to `listener`
    pub fn with_listener(listener: Arc<dyn LifecycleListener>) -> Self {
        Self {
            listener: Some(listener),
            ..Self::new()
        }
    }

    /// Root object
    pub fn root(&self) -> &ConnObj {
        &self.root
    }

    /// Lock the circuit list for a scan
    pub fn lock(&self) -> ConnResult<CoGuard<'_>> {
        self.root.guard()
    }

    /// Number of registered circuits
    pub fn len(&self) -> usize {
        self.root.child_count()
    }

    /// Check if no circuit is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Circuit ids in insertion order
    pub fn circuit_ids(&self) -> Vec<ObjId> {
        self.root.children()
    }

    /// Check if an object is still in the arena
    pub fn contains(&self, id: ObjId) -> bool {
        self.objects.contains_key(&id)
    }

    /// Look up a circuit by id
    pub fn circuit(&self, id: ObjId) -> Option<Arc<VirtualCircuit>> {
        match self.objects.get(&id).map(|e| e.value().clone()) {
            Some(Node::Circuit(vc)) => Some(vc),
            _ => None,
        }
    }

    /// Look up a share by id
    pub fn share(&self, id: ObjId) -> Option<Arc<Share>> {
        match self.objects.get(&id).map(|e| e.value().clone()) {
            Some(Node::Share(share)) => Some(share),
            _ => None,
        }
    }

    /// Info for every circuit and its shares, in insertion order
    pub fn snapshot(&self) -> Vec<VcInfo> {
        self.circuit_ids()
            .into_iter()
            .filter_map(|id| self.circuit(id))
            .map(|vc| {
                let shares: Vec<ShareInfo> = vc
                    .conn()
                    .children()
                    .into_iter()
                    .filter_map(|sid| self.share(sid))
                    .map(|s| s.info())
                    .collect();
                vc.info().with_shares(shares)
            })
            .collect()
    }

    /// Tear the registry down
    ///
    /// Fails with `Busy` while any circuit holds a reference on the root.
    pub fn shutdown(&self) -> ConnResult<()> {
        self.root.lock()?;
        let usecount = self.root.usecount();
        if usecount > 1 || self.root.child_count() > 0 {
            self.root.unlock()?;
            warn!(usecount, "connection registry still in use");
            return Err(ConnError::Busy(format!(
                "registry has {} outstanding references",
                usecount - 1
            )));
        }
        match self.root.rele() {
            // the root stays locked by this thread; nobody else can enter it now
            Ok(Release::Last) => {
                info!("connection registry shut down");
                Ok(())
            }
            Ok(Release::Retained(n)) => {
                self.root.unlock()?;
                Err(ConnError::Busy(format!("registry has {n} outstanding references")))
            }
            Err(e) => {
                self.root.unlock()?;
                Err(e)
            }
        }
    }

    pub(crate) fn allocate_id(&self) -> ObjId {
        ObjId::new(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Publish a freshly built object under its parent
    ///
    /// The caller must hold the parent's lock. The parent gains one
    /// reference, owned by the child until its teardown.
    pub(crate) fn insert(&self, node: Node) -> ConnResult<()> {
        let conn = node.conn();
        let parent_id = conn
            .parent()
            .ok_or_else(|| ConnError::Busy("root cannot be inserted".to_string()))?;
        let parent = self
            .parent_of(parent_id)
            .ok_or_else(|| ConnError::NotFound(format!("parent {parent_id}")))?;
        let parent_conn = parent.conn(&self.root);

        if !parent_conn.is_locked_by_current() {
            return Err(ConnError::Busy(format!(
                "{parent_id} must be locked to attach {}",
                conn.id()
            )));
        }
        parent_conn.attach_child(conn.id())?;
        if let Err(e) = parent_conn.add_ref() {
            parent_conn.detach_child(conn.id());
            warn!(obj = %conn.id(), parent = %parent_id, error = %e, "parent went away during attach");
            return Err(e);
        }
        debug!(obj = %conn.id(), parent = %parent_id, level = ?conn.level(), "attached");
        self.objects.insert(conn.id(), node);
        Ok(())
    }

    /// Drop one reference on an arena object, tearing it down on the last
    pub(crate) fn release(&self, node: &Node) -> ConnResult<()> {
        match node.conn().rele()? {
            Release::Retained(_) => Ok(()),
            Release::Last => {
                self.teardown(node);
                Ok(())
            }
        }
    }

    fn teardown(&self, node: &Node) {
        let conn = node.conn();
        let id = conn.id();
        let level = conn.level();

        conn.drain();
        node.object().on_gone(self);
        if let Some(listener) = &self.listener {
            listener.on_gone(id, level);
        }

        let parent_id = conn.parent();
        let parent = parent_id.and_then(|pid| self.parent_of(pid));
        if let Some(parent) = &parent {
            let parent_conn = parent.conn(&self.root);
            match parent_conn.lock() {
                Ok(()) => {
                    parent_conn.detach_child(id);
                    if let Err(e) = parent_conn.unlock() {
                        error!(obj = %id, error = %e, "failed to unlock parent during teardown");
                    }
                }
                Err(e) => {
                    error!(obj = %id, error = %e, "parent unavailable during teardown");
                    parent_conn.detach_child(id);
                }
            }
        }

        self.objects.remove(&id);
        node.object().on_free();
        if let Some(listener) = &self.listener {
            listener.on_free(id, level);
        }
        debug!(obj = %id, ?level, "freed");

        if let Some(parent) = parent {
            if let Err(e) = self.release_parent(&parent) {
                error!(obj = %id, error = %e, "failed to release parent reference");
            }
        }
    }

    fn release_parent(&self, parent: &Parent) -> ConnResult<()> {
        match parent {
            Parent::Root => match self.root.rele()? {
                Release::Retained(_) => Ok(()),
                Release::Last => {
                    // the root only goes away through shutdown()
                    error!("registry root lost its last reference");
                    Err(ConnError::Gone)
                }
            },
            Parent::Node(node) => self.release(node),
        }
    }

    fn parent_of(&self, id: ObjId) -> Option<Parent> {
        if id == ObjId::ROOT {
            return Some(Parent::Root);
        }
        self.objects
            .get(&id)
            .map(|e| Parent::Node(e.value().clone()))
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("root", &self.root)
            .field("objects", &self.objects.len())
            .finish()
    }
}

enum Parent {
    Root,
    Node(Node),
}

impl Parent {
    fn conn<'a>(&'a self, root: &'a ConnObj) -> &'a ConnObj {
        match self {
            Self::Root => root,
            Self::Node(node) => node.conn(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_registry() {
        let reg = ConnectionRegistry::new();
        assert!(reg.is_empty());
        assert_eq!(reg.root().usecount(), 1);
        assert_eq!(reg.root().level(), Level::Registry);
        assert!(reg.snapshot().is_empty());
    }

    #[test]
    fn test_ids_are_unique() {
        let reg = ConnectionRegistry::new();
        let a = reg.allocate_id();
        let b = reg.allocate_id();
        assert_ne!(a, b);
        assert_ne!(a, ObjId::ROOT);
    }

    #[test]
    fn test_shutdown_empty() {
        let reg = ConnectionRegistry::new();
        reg.shutdown().unwrap();
        assert!(reg.root().is_gone());
        assert!(matches!(reg.lock(), Err(ConnError::Gone)));
    }

    #[test]
    fn test_insert_under_gone_parent_leaves_no_child() {
        use crate::access::Credential;
        use crate::addr::ServerAddr;
        use crate::config::ClientConfig;
        use crate::error::ExchangeError;
        use crate::exchange::{Exchange, ExchangeEvent, ExchangeReply, ExchangeTarget};
        use crate::vc::VcSpec;

        struct Silent;

        impl Exchange for Silent {
            fn perform(
                &self,
                _target: ExchangeTarget<'_>,
                _event: ExchangeEvent,
            ) -> Result<ExchangeReply, ExchangeError> {
                Ok(ExchangeReply::Done)
            }
        }

        let reg = Arc::new(ConnectionRegistry::new());
        reg.shutdown().unwrap();
        // shutdown leaves the root locked by this thread
        assert!(reg.root().is_locked_by_current());

        let connector = |_: &ServerAddr| -> Arc<dyn Exchange> { Arc::new(Silent) };
        let spec = VcSpec::new(ServerAddr::Inet("192.0.2.40:445".parse().unwrap()), "erin");
        let result = VirtualCircuit::create(
            &reg,
            &ClientConfig::default(),
            &connector,
            &spec,
            &Credential::new(1000, 100),
        );
        assert!(matches!(result, Err(ConnError::Gone)));
        assert!(reg.is_empty());
        assert_eq!(reg.root().usecount(), 0);
    }

    #[test]
    fn test_shutdown_busy_with_extra_reference() {
        let reg = ConnectionRegistry::new();
        reg.root().add_ref().unwrap();
        assert!(matches!(reg.shutdown(), Err(ConnError::Busy(_))));
        assert!(!reg.root().is_locked());
        reg.root().rele().unwrap();
        reg.shutdown().unwrap();
    }
}
