//! Lookup-or-create orchestration
//!
//! [`SessionManager`] is the front door of the crate. Each entry point scans
//! the registry under its lock, reuses or creates a circuit, then drives the
//! handshake with the registry unlocked.

use std::sync::Arc;

use tracing::{debug, info};

use crate::access::{AccessPolicy, Credential, UnixAccess};
use crate::config::ClientConfig;
use crate::connobj::{ConnObject, ObjId};
use crate::error::{ConnError, ConnResult};
use crate::exchange::Connector;
use crate::registry::ConnectionRegistry;
use crate::share::{Share, ShareHandle, ShareSpec};
use crate::vc::{LookupScope, VcHandle, VcSpec, VirtualCircuit};

/// Drives circuits and shares through their handshakes
pub struct SessionManager {
    registry: Arc<ConnectionRegistry>,
    connector: Arc<dyn Connector>,
    policy: Arc<dyn AccessPolicy>,
    config: ClientConfig,
}

impl SessionManager {
    /// Create a manager with a fresh registry and Unix access checks
    pub fn new(config: ClientConfig, connector: Arc<dyn Connector>) -> ConnResult<Self> {
        config.validate()?;
        Ok(Self {
            registry: Arc::new(ConnectionRegistry::new()),
            connector,
            policy: Arc::new(UnixAccess),
            config,
        })
    }

    /// Replace the access-check collaborator
    pub fn with_policy(mut self, policy: Arc<dyn AccessPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Use an existing registry
    pub fn with_registry(mut self, registry: Arc<ConnectionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Registry of live circuits
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Active configuration
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Find or create a circuit for `spec` and negotiate it
    ///
    /// Scans in insertion order and takes the first match. A negotiate
    /// failure releases the reference taken here.
    pub fn negotiate(&self, spec: &VcSpec, cred: &Credential) -> ConnResult<VcHandle> {
        let vc = self.find_or_create(spec, cred)?;
        vc.negotiate()?;
        Ok(vc)
    }

    /// Authenticate a circuit obtained from [`negotiate`](Self::negotiate)
    ///
    /// Returns a new reference; the caller's own handle is untouched.
    pub fn session_setup(
        &self,
        spec: &VcSpec,
        vc: &VirtualCircuit,
        cred: &Credential,
    ) -> ConnResult<VcHandle> {
        let resolved = {
            let _guard = self.registry.lock()?;
            self.resolve(vc, spec, cred)?
        };
        resolved.authenticate(spec)?;
        Ok(resolved)
    }

    /// Attach and tree-connect a share over an established circuit
    ///
    /// A circuit that has not finished session setup gives `Busy` and no
    /// share is attached.
    ///
    /// On failure every reference taken here is released, the share's
    /// included.
    pub fn tree_connect(
        &self,
        spec: &VcSpec,
        share_spec: &ShareSpec,
        vc: &VirtualCircuit,
        cred: &Credential,
    ) -> ConnResult<(VcHandle, ShareHandle)> {
        let resolved = {
            let _guard = self.registry.lock()?;
            self.resolve(vc, spec, cred)?
        };
        if !resolved.is_authenticated() {
            return Err(ConnError::Busy(format!(
                "{} is not ready for shares ({:?})",
                resolved.id(),
                resolved.state()
            )));
        }
        let share = self.attach_share(&resolved, share_spec, cred)?;
        share.tree_connect(&resolved)?;
        Ok((resolved, share))
    }

    /// Negotiate, authenticate and optionally tree-connect in one call
    pub fn lookup(
        &self,
        spec: &VcSpec,
        share_spec: Option<&ShareSpec>,
        cred: &Credential,
    ) -> ConnResult<(VcHandle, Option<ShareHandle>)> {
        let vc = self.negotiate(spec, cred)?;
        vc.authenticate(spec)?;
        let share = match share_spec {
            Some(share_spec) => {
                let share = self.attach_share(&vc, share_spec, cred)?;
                share.tree_connect(&vc)?;
                Some(share)
            }
            None => None,
        };
        Ok((vc, share))
    }

    /// Shut the registry down; fails while circuits are alive
    pub fn shutdown(&self) -> ConnResult<()> {
        self.registry.shutdown()
    }

    fn find_or_create(&self, spec: &VcSpec, cred: &Credential) -> ConnResult<VcHandle> {
        let mode = spec.effective_mode(self.config.default_mode);
        let guard = self.registry.lock()?;

        if !spec.private {
            if let Some(vc) = self.scan(spec, cred, LookupScope::Shared)? {
                return Ok(vc);
            }
        }
        if !spec.create {
            return Err(ConnError::NotFound(format!(
                "no circuit to {} for {}",
                spec.server, spec.username
            )));
        }
        if let Some(vc) = self.scan(spec, cred, LookupScope::PrivateVisible)? {
            return Ok(vc);
        }

        let locked = VirtualCircuit::create(
            &self.registry,
            &self.config,
            self.connector.as_ref(),
            spec,
            cred,
        )?;
        let vc = locked.unlock();
        drop(guard);
        debug!(vc = %vc.id(), mode = mode.raw(), "new circuit ready for negotiate");
        Ok(vc)
    }

    /// First circuit in insertion order matching `spec`, referenced
    ///
    /// The caller must hold the registry lock.
    fn scan(
        &self,
        spec: &VcSpec,
        cred: &Credential,
        scope: LookupScope,
    ) -> ConnResult<Option<VcHandle>> {
        let mode = spec.effective_mode(self.config.default_mode);
        for id in self.registry.circuit_ids() {
            if let Some(vc) = self.reference_if(id, |vc| {
                vc.matches(spec, mode, cred, self.policy.as_ref(), scope)
            })? {
                debug!(vc = %id, ?scope, "circuit reused");
                return Ok(Some(vc));
            }
        }
        Ok(None)
    }

    /// Re-acquire `vc` through the registry, checking it still serves `spec`
    fn resolve(
        &self,
        vc: &VirtualCircuit,
        spec: &VcSpec,
        cred: &Credential,
    ) -> ConnResult<VcHandle> {
        if let Some(failure) = vc.failure() {
            return Err(failure.into());
        }
        let mode = spec.effective_mode(self.config.default_mode);
        let found = self.reference_if(vc.id(), |candidate| {
            candidate.matches(spec, mode, cred, self.policy.as_ref(), LookupScope::PrivateVisible)
        })?;
        found.ok_or_else(|| {
            ConnError::NotFound(format!("circuit {} no longer matches", vc.id()))
        })
    }

    /// Lock circuit `id` and take a reference if `pred` holds
    fn reference_if(
        &self,
        id: ObjId,
        pred: impl FnOnce(&VirtualCircuit) -> bool,
    ) -> ConnResult<Option<VcHandle>> {
        let Some(vc) = self.registry.circuit(id) else {
            return Ok(None);
        };
        let conn = vc.conn();
        // a circuit in teardown is treated as absent
        if conn.lock().is_err() {
            return Ok(None);
        }
        let referenced = pred(vc.as_ref()) && conn.add_ref().is_ok();
        conn.unlock()?;
        Ok(referenced.then(|| VcHandle::adopt(vc, self.registry.clone())))
    }

    fn attach_share(
        &self,
        vc: &VcHandle,
        spec: &ShareSpec,
        cred: &Credential,
    ) -> ConnResult<ShareHandle> {
        let mode = spec.effective_mode(self.config.default_mode);
        let locked = vc.try_clone()?.lock()?;
        let policy = self.policy.as_ref();
        if let Some(share) = locked.lookup_share(&self.registry, spec, mode, cred, policy)? {
            return Ok(share);
        }
        let share = Share::create(&self.registry, &locked, spec, mode, cred, policy)?;
        info!(vc = %vc.id(), share = %share.id(), name = %spec.name, "share attached");
        Ok(share)
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AccessMode;
    use crate::addr::ServerAddr;
    use crate::error::{ExchangeError, NtStatus};
    use crate::exchange::{Exchange, ExchangeEvent, ExchangeReply, ExchangeTarget};
    use crate::vc::VcState;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<ExchangeEvent>>,
        fail_on: Mutex<Option<ExchangeEvent>>,
    }

    impl Exchange for Recorder {
        fn perform(
            &self,
            _target: ExchangeTarget<'_>,
            event: ExchangeEvent,
        ) -> Result<ExchangeReply, ExchangeError> {
            self.events.lock().push(event);
            if *self.fail_on.lock() == Some(event) {
                return Err(ExchangeError::new(NtStatus::LogonFailure, "scripted"));
            }
            Ok(match event {
                ExchangeEvent::SessionSetup => ExchangeReply::SessionEstablished { session_id: 9 },
                ExchangeEvent::TreeConnect => ExchangeReply::TreeConnected { tree_id: 3 },
                _ => ExchangeReply::Done,
            })
        }
    }

    fn manager() -> (SessionManager, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let bound: Arc<dyn Exchange> = recorder.clone();
        let connector: Arc<dyn Connector> = Arc::new(move |_: &ServerAddr| bound.clone());
        (
            SessionManager::new(ClientConfig::default(), connector).unwrap(),
            recorder,
        )
    }

    fn spec() -> VcSpec {
        VcSpec::new(ServerAddr::Inet("192.0.2.30:445".parse().unwrap()), "carol")
    }

    #[test]
    fn test_negotiate_reuses_circuit() {
        let (mgr, recorder) = manager();
        let cred = Credential::new(1000, 100);
        let a = mgr.negotiate(&spec(), &cred).unwrap();
        let b = mgr.negotiate(&spec(), &cred).unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(a.conn().usecount(), 2);
        assert_eq!(*recorder.events.lock(), vec![ExchangeEvent::Negotiate]);
    }

    #[test]
    fn test_negotiate_without_create() {
        let (mgr, _recorder) = manager();
        let result = mgr.negotiate(&spec().create(false), &Credential::new(1000, 100));
        assert!(matches!(result, Err(ConnError::NotFound(_))));
        assert!(mgr.registry().is_empty());
    }

    #[test]
    fn test_private_circuit_visibility() {
        let (mgr, _recorder) = manager();
        let owner = Credential::new(1000, 100);
        let other = Credential::new(2000, 100);
        let private_spec = spec().private(true).mode(AccessMode::new(0o777));
        let private = mgr.negotiate(&private_spec, &owner).unwrap();

        let theirs = mgr.negotiate(&spec(), &other).unwrap();
        assert_ne!(theirs.id(), private.id());

        // the owner's own follow-up finds its private circuit
        let mine = mgr.negotiate(&spec(), &owner).unwrap();
        assert_eq!(mine.id(), private.id());
        assert_eq!(mgr.registry().len(), 2);
    }

    #[test]
    fn test_private_request_never_takes_shared_circuit() {
        let (mgr, recorder) = manager();
        let cred = Credential::new(1000, 100);
        let shared = mgr.negotiate(&spec(), &cred).unwrap();

        let private = mgr.negotiate(&spec().private(true), &cred).unwrap();
        assert_ne!(private.id(), shared.id());
        assert!(private.is_private());
        assert!(!shared.is_private());
        assert_eq!(shared.conn().usecount(), 1);
        assert_eq!(recorder.events.lock().len(), 2);

        // a second private request may take the caller's own private circuit
        let again = mgr.negotiate(&spec().private(true), &cred).unwrap();
        assert_eq!(again.id(), private.id());
        assert_eq!(mgr.registry().len(), 2);
    }

    #[test]
    fn test_tree_connect_needs_session() {
        let (mgr, recorder) = manager();
        let cred = Credential::new(1000, 100);
        let vc = mgr.negotiate(&spec(), &cred).unwrap();
        let err = mgr
            .tree_connect(&spec(), &ShareSpec::new("home"), &vc, &cred)
            .unwrap_err();
        assert!(matches!(err, ConnError::Busy(_)));
        assert_eq!(vc.state(), VcState::Negotiated);
        assert_eq!(vc.conn().child_count(), 0);
        assert_eq!(vc.conn().usecount(), 1);
        assert_eq!(*recorder.events.lock(), vec![ExchangeEvent::Negotiate]);
    }

    #[test]
    fn test_lookup_full_sequence() {
        let (mgr, recorder) = manager();
        let cred = Credential::new(1000, 100);
        let (vc, share) = mgr
            .lookup(&spec(), Some(&ShareSpec::new("home")), &cred)
            .unwrap();
        let share = share.unwrap();
        assert!(vc.is_authenticated());
        assert_eq!(share.tree_id(), Some(3));
        assert_eq!(
            *recorder.events.lock(),
            vec![
                ExchangeEvent::Negotiate,
                ExchangeEvent::SessionSetup,
                ExchangeEvent::TreeConnect
            ]
        );

        drop(share);
        drop(vc);
        assert!(mgr.registry().is_empty());
        mgr.shutdown().unwrap();
    }

    #[test]
    fn test_session_setup_failure_releases() {
        let (mgr, recorder) = manager();
        *recorder.fail_on.lock() = Some(ExchangeEvent::SessionSetup);
        let cred = Credential::new(1000, 100);
        let vc = mgr.negotiate(&spec(), &cred).unwrap();
        let err = mgr.session_setup(&spec(), &vc, &cred).unwrap_err();
        assert_eq!(err.status(), Some(NtStatus::LogonFailure));
        assert_eq!(vc.conn().usecount(), 1);
        assert!(vc.is_invalid());

        let circuit = vc.circuit().clone();
        drop(vc);
        assert!(!mgr.registry().contains(circuit.id()));
        assert_eq!(recorder.events.lock().last(), Some(&ExchangeEvent::Disconnect));
    }

    #[test]
    fn test_tree_connect_failure_releases_share() {
        let (mgr, recorder) = manager();
        let cred = Credential::new(1000, 100);
        let (vc, _) = mgr.lookup(&spec(), None, &cred).unwrap();
        *recorder.fail_on.lock() = Some(ExchangeEvent::TreeConnect);
        let err = mgr
            .tree_connect(&spec(), &ShareSpec::new("missing"), &vc, &cred)
            .unwrap_err();
        assert!(matches!(err, ConnError::ExchangeFailed(_)));
        assert_eq!(vc.conn().child_count(), 0);
        assert_eq!(vc.conn().usecount(), 1);
        assert_eq!(recorder.events.lock().last(), Some(&ExchangeEvent::TreeDisconnect));
    }

    #[test]
    fn test_shutdown_busy_while_circuits_live() {
        let (mgr, _recorder) = manager();
        let vc = mgr.negotiate(&spec(), &Credential::new(1000, 100)).unwrap();
        assert!(matches!(mgr.shutdown(), Err(ConnError::Busy(_))));
        drop(vc);
        mgr.shutdown().unwrap();
    }
}
