//! Reference-counted, recursively lockable connection objects
//!
//! Every circuit and share starts with a [`ConnObj`] head. The head carries
//! the use count, the `GONE` flag, the ids of its children and a lock that
//! the owning thread may re-enter.
//!
//! Two locks live here:
//!
//! - an interlock (`parking_lot::Mutex`) guarding the counters, held only
//!   for a few instructions, and
//! - the object lock proper, modelled as an owner thread plus recursion
//!   depth inside the interlocked state, with a condvar for waiters.
//!
//! Releasing the last reference sets `GONE`, which makes every later
//! `add_ref`/`lock` from another thread fail, then drains the object lock
//! before the hooks in [`ConnObject`] run.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{error, trace};

use crate::error::{ConnError, ConnResult};
use crate::registry::ConnectionRegistry;

/// Opaque object identifier, unique within one registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjId(u64);

impl ObjId {
    /// Id of the registry root
    pub const ROOT: ObjId = ObjId(0);

    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the ID value
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Position of an object in the hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Level {
    /// The process-wide list of circuits
    Registry,
    /// An authenticated server connection
    VirtualCircuit,
    /// A tree connection inside a circuit
    Share,
}

/// Object flag bits
///
/// `GONE` is owned by this module; higher bits are free for the object kinds
/// (see `VcFlags`).
pub struct CoFlags;

impl CoFlags {
    /// Object is being or has been torn down
    pub const GONE: u32 = 0x0001;
}

/// Outcome of dropping one reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Other references remain
    Retained(u32),
    /// This was the last reference; the caller must tear the object down
    Last,
}

#[derive(Debug)]
struct CoState {
    usecount: u32,
    flags: u32,
    owner: Option<ThreadId>,
    depth: u32,
    waiters: u32,
    children: Vec<ObjId>,
}

/// Hierarchical, reference-counted, recursively lockable object head
pub struct ConnObj {
    id: ObjId,
    level: Level,
    parent: Option<ObjId>,
    state: Mutex<CoState>,
    wakeup: Condvar,
}

impl ConnObj {
    /// Create a head holding the creator's reference, unlocked
    pub fn new(id: ObjId, level: Level, parent: Option<ObjId>) -> Self {
        Self {
            id,
            level,
            parent,
            state: Mutex::new(CoState {
                usecount: 1,
                flags: 0,
                owner: None,
                depth: 0,
                waiters: 0,
                children: Vec::new(),
            }),
            wakeup: Condvar::new(),
        }
    }

    /// Object id
    pub fn id(&self) -> ObjId {
        self.id
    }

    /// Hierarchy level
    pub fn level(&self) -> Level {
        self.level
    }

    /// Parent id, `None` only for the registry root
    pub fn parent(&self) -> Option<ObjId> {
        self.parent
    }

    /// Current use count
    pub fn usecount(&self) -> u32 {
        self.state.lock().usecount
    }

    /// Check if teardown has started
    pub fn is_gone(&self) -> bool {
        self.state.lock().flags & CoFlags::GONE != 0
    }

    /// All flag bits
    pub fn flags(&self) -> u32 {
        self.state.lock().flags
    }

    /// Check a flag bit
    pub fn has_flag(&self, flag: u32) -> bool {
        self.state.lock().flags & flag != 0
    }

    /// Set kind-specific flag bits
    pub fn set_flags(&self, flags: u32) {
        self.state.lock().flags |= flags & !CoFlags::GONE;
    }

    /// Clear kind-specific flag bits
    pub fn clear_flags(&self, flags: u32) {
        self.state.lock().flags &= !(flags & !CoFlags::GONE);
    }

    /// Take one more reference
    pub fn add_ref(&self) -> ConnResult<u32> {
        let mut st = self.state.lock();
        if st.flags & CoFlags::GONE != 0 {
            return Err(ConnError::Gone);
        }
        st.usecount += 1;
        trace!(obj = %self.id, usecount = st.usecount, "ref");
        Ok(st.usecount)
    }

    /// Drop one reference
    ///
    /// On [`Release::Last`] the object is already marked `GONE`; the caller
    /// owns the teardown.
    pub fn rele(&self) -> ConnResult<Release> {
        let mut st = self.state.lock();
        match st.usecount {
            0 => {
                error!(obj = %self.id, level = ?self.level, "release of object with zero use count");
                Err(ConnError::Gone)
            }
            1 => {
                st.usecount = 0;
                st.flags |= CoFlags::GONE;
                // waiters must observe GONE instead of queueing behind the drain
                self.wakeup.notify_all();
                trace!(obj = %self.id, "last reference released");
                Ok(Release::Last)
            }
            n => {
                st.usecount = n - 1;
                trace!(obj = %self.id, usecount = n - 1, "rele");
                Ok(Release::Retained(n - 1))
            }
        }
    }

    /// Acquire the object lock, re-entering if the current thread owns it
    pub fn lock(&self) -> ConnResult<()> {
        let me = thread::current().id();
        let mut st = self.state.lock();
        loop {
            if st.flags & CoFlags::GONE != 0 && st.owner != Some(me) {
                return Err(ConnError::Gone);
            }
            match st.owner {
                None => {
                    st.owner = Some(me);
                    st.depth = 1;
                    return Ok(());
                }
                Some(owner) if owner == me => {
                    st.depth += 1;
                    return Ok(());
                }
                Some(_) => {
                    st.waiters += 1;
                    self.wakeup.wait(&mut st);
                    st.waiters -= 1;
                }
            }
        }
    }

    /// Leave one level of the object lock
    pub fn unlock(&self) -> ConnResult<()> {
        let me = thread::current().id();
        let mut st = self.state.lock();
        if st.owner != Some(me) {
            error!(obj = %self.id, level = ?self.level, "unlock of object not held by this thread");
            debug_assert!(false, "unlock of {} not held by this thread", self.id);
            return Err(ConnError::Busy(format!(
                "unlock of {} not held by this thread",
                self.id
            )));
        }
        st.depth -= 1;
        if st.depth == 0 {
            st.owner = None;
            if st.waiters > 0 {
                self.wakeup.notify_all();
            }
        }
        Ok(())
    }

    /// Acquire the lock, returning a guard that unlocks on drop
    pub fn guard(&self) -> ConnResult<CoGuard<'_>> {
        self.lock()?;
        Ok(CoGuard {
            obj: self,
            _thread: PhantomData,
        })
    }

    /// Check if the current thread holds the lock
    pub fn is_locked_by_current(&self) -> bool {
        self.state.lock().owner == Some(thread::current().id())
    }

    /// Check if any thread holds the lock
    pub fn is_locked(&self) -> bool {
        self.state.lock().owner.is_some()
    }

    /// Recursion depth of the current holder
    pub fn lock_depth(&self) -> u32 {
        self.state.lock().depth
    }

    /// Wait until no other thread holds the lock, then take it
    ///
    /// Used only on the teardown path, after [`Release::Last`].
    pub fn drain(&self) {
        let me = thread::current().id();
        let mut st = self.state.lock();
        while matches!(st.owner, Some(owner) if owner != me) {
            st.waiters += 1;
            self.wakeup.wait(&mut st);
            st.waiters -= 1;
        }
        st.owner = Some(me);
        st.depth += 1;
    }

    /// Record a child; the current thread must hold this object's lock
    pub(crate) fn attach_child(&self, child: ObjId) -> ConnResult<()> {
        let mut st = self.state.lock();
        if st.owner != Some(thread::current().id()) {
            error!(obj = %self.id, %child, "attach to object not held by this thread");
            debug_assert!(false, "attach to {} not held by this thread", self.id);
            return Err(ConnError::Busy(format!(
                "{} must be locked to attach {}",
                self.id, child
            )));
        }
        if st.flags & CoFlags::GONE != 0 {
            return Err(ConnError::Gone);
        }
        st.children.push(child);
        Ok(())
    }

    /// Forget a child, returning whether it was present
    pub(crate) fn detach_child(&self, child: ObjId) -> bool {
        let mut st = self.state.lock();
        match st.children.iter().position(|c| *c == child) {
            Some(pos) => {
                st.children.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Child ids in insertion order
    pub fn children(&self) -> Vec<ObjId> {
        self.state.lock().children.clone()
    }

    /// Number of attached children
    pub fn child_count(&self) -> usize {
        self.state.lock().children.len()
    }

    /// Check if `child` is attached
    pub fn has_child(&self, child: ObjId) -> bool {
        self.state.lock().children.contains(&child)
    }
}

impl fmt::Debug for ConnObj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.lock();
        f.debug_struct("ConnObj")
            .field("id", &self.id)
            .field("level", &self.level)
            .field("usecount", &st.usecount)
            .field("flags", &st.flags)
            .field("depth", &st.depth)
            .field("children", &st.children.len())
            .finish()
    }
}

/// Scoped hold on a [`ConnObj`] lock
#[must_use = "the lock is released when the guard is dropped"]
pub struct CoGuard<'a> {
    obj: &'a ConnObj,
    // the lock belongs to the acquiring thread
    _thread: PhantomData<*const ()>,
}

impl CoGuard<'_> {
    /// Locked object
    pub fn object(&self) -> &ConnObj {
        self.obj
    }
}

impl Drop for CoGuard<'_> {
    fn drop(&mut self) {
        let _ = self.obj.unlock();
    }
}

/// Owned hold on an object lock, for handles that outlive a borrow
///
/// Not `Send`: only the acquiring thread may unlock.
pub(crate) struct HeldLock<T: ConnObject> {
    obj: Arc<T>,
    _thread: PhantomData<*const ()>,
}

impl<T: ConnObject> HeldLock<T> {
    /// Wrap a lock the current thread already acquired
    pub(crate) fn assume(obj: Arc<T>) -> Self {
        Self {
            obj,
            _thread: PhantomData,
        }
    }
}

impl<T: ConnObject> Drop for HeldLock<T> {
    fn drop(&mut self) {
        let _ = self.obj.conn().unlock();
    }
}

/// Teardown hooks of a concrete object kind
pub trait ConnObject: Send + Sync {
    /// Embedded head
    fn conn(&self) -> &ConnObj;

    /// Undo network state; runs once, after the drain
    fn on_gone(&self, registry: &ConnectionRegistry);

    /// Release resources; runs once, after `on_gone` and detach
    fn on_free(&self);
}

/// Observer of object teardown
pub trait LifecycleListener: Send + Sync {
    /// An object finished `on_gone`
    fn on_gone(&self, _id: ObjId, _level: Level) {}

    /// An object finished `on_free`
    fn on_free(&self, _id: ObjId, _level: Level) {}
}
