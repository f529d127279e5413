//! Ownership and access checks
//!
//! Circuits and shares carry a Unix-style owner, group and permission mode.
//! Lookups use these to decide whether a caller may reuse an existing
//! object, and creation uses them to decide whether a caller may ask for an
//! owner or group other than its own.

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Requested or stored access rights
///
/// The low nine bits are rwx triplets for owner, group and other. `EXACT`
/// is a request-only flag: the stored mode must equal the requested bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessMode(u32);

impl AccessMode {
    /// Owner read
    pub const READ: u32 = 0o400;
    /// Owner write
    pub const WRITE: u32 = 0o200;
    /// Owner execute (used as "may look up")
    pub const EXEC: u32 = 0o100;
    /// All permission bits
    pub const MASK: u32 = 0o777;
    /// Require an exact mode match instead of an access check
    pub const EXACT: u32 = 0o10000;

    /// Create from raw bits
    pub fn new(bits: u32) -> Self {
        Self(bits)
    }

    /// Permission bits only
    pub fn bits(&self) -> u32 {
        self.0 & Self::MASK
    }

    /// Raw value including request flags
    pub fn raw(&self) -> u32 {
        self.0
    }

    /// Check if an exact match is requested
    pub fn is_exact(&self) -> bool {
        self.0 & Self::EXACT != 0
    }

    /// Same bits with the exact flag set
    pub fn exact(self) -> Self {
        Self(self.0 | Self::EXACT)
    }

    /// Strip request flags, keeping what gets stored on an object
    pub fn stored(self) -> Self {
        Self(self.bits())
    }
}

impl Default for AccessMode {
    fn default() -> Self {
        Self(0o700)
    }
}

/// Owner or group selector in a lookup spec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum IdSpec {
    /// Any identity matches; the match is no longer exact
    #[default]
    Any,
    /// A specific uid or gid
    Id(u32),
}

impl IdSpec {
    /// Compare against a stored id
    ///
    /// Returns `None` when the spec is a wildcard, otherwise whether the ids
    /// are equal.
    pub fn compare(&self, stored: u32) -> Option<bool> {
        match self {
            Self::Any => None,
            Self::Id(id) => Some(*id == stored),
        }
    }

    /// Resolve a wildcard to a concrete id
    pub fn resolve(&self, fallback: u32) -> u32 {
        match self {
            Self::Any => fallback,
            Self::Id(id) => *id,
        }
    }
}

/// Identity of the calling context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    uid: u32,
    gid: u32,
    groups: Vec<u32>,
    privileged: bool,
}

impl Credential {
    /// Create an unprivileged credential
    pub fn new(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            groups: Vec::new(),
            privileged: false,
        }
    }

    /// The superuser
    pub fn root() -> Self {
        Self {
            uid: 0,
            gid: 0,
            groups: Vec::new(),
            privileged: true,
        }
    }

    /// Add supplementary groups
    pub fn with_groups(mut self, groups: impl IntoIterator<Item = u32>) -> Self {
        self.groups.extend(groups);
        self
    }

    /// Mark as privileged
    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    /// Effective uid
    pub fn uid(&self) -> u32 {
        self.uid
    }

    /// Effective (primary) gid
    pub fn gid(&self) -> u32 {
        self.gid
    }

    /// Check if the caller bypasses ownership checks
    pub fn is_privileged(&self) -> bool {
        self.privileged
    }

    /// Check primary and supplementary group membership
    pub fn is_group_member(&self, gid: u32) -> bool {
        self.gid == gid || self.groups.contains(&gid)
    }
}

/// Ownership attributes of a circuit or share
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ownership {
    /// Owning uid
    pub uid: u32,
    /// Owning gid
    pub gid: u32,
    /// Stored permission bits
    pub mode: AccessMode,
}

/// Access-check collaborator
pub trait AccessPolicy: Send + Sync {
    /// Check whether `cred` may use an object with `ownership` for `requested`
    fn access(&self, ownership: &Ownership, requested: AccessMode, cred: &Credential) -> bool;
}

/// Unix permission-bit access check
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixAccess;

impl AccessPolicy for UnixAccess {
    fn access(&self, ownership: &Ownership, requested: AccessMode, cred: &Credential) -> bool {
        if cred.is_privileged() || cred.uid() == ownership.uid {
            return true;
        }
        // requested rights are expressed in the owner triplet
        let mut want = requested.bits() >> 3;
        if !cred.is_group_member(ownership.gid) {
            want >>= 3;
        }
        ownership.mode.bits() & want == want
    }
}

/// Check that `cred` may create an object owned by `owner`/`group`
pub fn may_assign(owner: IdSpec, group: IdSpec, cred: &Credential) -> bool {
    if cred.is_privileged() {
        return true;
    }
    let owner_ok = owner.compare(cred.uid()).unwrap_or(true);
    let group_ok = match group {
        IdSpec::Any => true,
        IdSpec::Id(gid) => cred.is_group_member(gid),
    };
    owner_ok && group_ok
}

/// Owner, group and mode comparison shared by circuit and share lookups
///
/// Identity exactness (no wildcard on owner or group) and mode exactness
/// are decided separately and only combined for `EXACT` requests. Without
/// `EXACT` the access policy decides.
pub fn ownership_matches(
    stored: &Ownership,
    owner: IdSpec,
    group: IdSpec,
    mode: AccessMode,
    cred: &Credential,
    policy: &dyn AccessPolicy,
) -> bool {
    let owner_exact = match owner.compare(stored.uid) {
        Some(false) => return false,
        Some(true) => true,
        None => false,
    };
    let group_exact = match group.compare(stored.gid) {
        Some(false) => return false,
        Some(true) => true,
        None => false,
    };
    if mode.is_exact() {
        let identity_exact = owner_exact && group_exact;
        let mode_exact = mode.bits() == stored.mode.bits();
        return identity_exact && mode_exact;
    }
    policy.access(stored, mode, cred)
}

/// Password or other secret, wiped on drop and redacted in `Debug`
#[derive(Clone, Default, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Secret(String);

impl Secret {
    /// Wrap a secret value
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the secret to the exchange layer
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Check if no secret is set
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Wipe the secret in place
    pub fn clear(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owned(uid: u32, gid: u32, mode: u32) -> Ownership {
        Ownership {
            uid,
            gid,
            mode: AccessMode::new(mode),
        }
    }

    #[test]
    fn test_mode_flags() {
        let mode = AccessMode::new(0o750).exact();
        assert!(mode.is_exact());
        assert_eq!(mode.bits(), 0o750);
        assert_eq!(mode.stored(), AccessMode::new(0o750));
    }

    #[test]
    fn test_owner_always_allowed() {
        let cred = Credential::new(1000, 1000);
        assert!(UnixAccess.access(&owned(1000, 5, 0o000), AccessMode::new(0o700), &cred));
    }

    #[test]
    fn test_privileged_always_allowed() {
        let cred = Credential::root();
        assert!(UnixAccess.access(&owned(1000, 5, 0o000), AccessMode::new(0o700), &cred));
    }

    #[test]
    fn test_group_and_other_bits() {
        let member = Credential::new(2000, 5);
        let outsider = Credential::new(3000, 6);
        let share = owned(1000, 5, 0o750);
        let want = AccessMode::new(AccessMode::READ | AccessMode::EXEC);

        assert!(UnixAccess.access(&share, want, &member));
        assert!(!UnixAccess.access(&share, want, &outsider));

        let world = owned(1000, 5, 0o755);
        assert!(UnixAccess.access(&world, want, &outsider));
        assert!(!UnixAccess.access(&world, AccessMode::new(AccessMode::WRITE), &outsider));
    }

    #[test]
    fn test_supplementary_groups() {
        let cred = Credential::new(2000, 9).with_groups([5]);
        assert!(cred.is_group_member(5));
        assert!(UnixAccess.access(&owned(1000, 5, 0o070), AccessMode::new(0o700), &cred));
    }

    #[test]
    fn test_may_assign() {
        let cred = Credential::new(1000, 100).with_groups([200]);
        assert!(may_assign(IdSpec::Any, IdSpec::Any, &cred));
        assert!(may_assign(IdSpec::Id(1000), IdSpec::Id(200), &cred));
        assert!(!may_assign(IdSpec::Id(0), IdSpec::Any, &cred));
        assert!(!may_assign(IdSpec::Any, IdSpec::Id(300), &cred));
        assert!(may_assign(IdSpec::Id(0), IdSpec::Id(300), &Credential::root()));
    }

    #[test]
    fn test_exact_requires_identity_and_mode() {
        let stored = owned(1000, 100, 0o700);
        let cred = Credential::new(1000, 100);
        let exact = AccessMode::new(0o700).exact();

        assert!(ownership_matches(&stored, IdSpec::Id(1000), IdSpec::Id(100), exact, &cred, &UnixAccess));
        // same bits, but wildcarded owner
        assert!(!ownership_matches(&stored, IdSpec::Any, IdSpec::Id(100), exact, &cred, &UnixAccess));
        // same bits, but wildcarded group
        assert!(!ownership_matches(&stored, IdSpec::Id(1000), IdSpec::Any, exact, &cred, &UnixAccess));
        // identity exact, bits differ
        let other_bits = AccessMode::new(0o755).exact();
        assert!(!ownership_matches(&stored, IdSpec::Id(1000), IdSpec::Id(100), other_bits, &cred, &UnixAccess));
    }

    #[test]
    fn test_non_exact_uses_policy() {
        let stored = owned(1000, 100, 0o700);
        let stranger = Credential::new(2000, 200);
        let mode = AccessMode::new(AccessMode::READ);

        assert!(ownership_matches(&stored, IdSpec::Any, IdSpec::Any, mode, &Credential::new(1000, 1), &UnixAccess));
        assert!(!ownership_matches(&stored, IdSpec::Any, IdSpec::Any, mode, &stranger, &UnixAccess));
        assert!(!ownership_matches(&stored, IdSpec::Id(5), IdSpec::Any, mode, &Credential::root(), &UnixAccess));
    }

    #[test]
    fn test_secret_redacted() {
        let mut secret = Secret::new("hunter2");
        assert_eq!(format!("{secret:?}"), "Secret(***)");
        assert_eq!(secret.expose(), "hunter2");
        secret.clear();
        assert!(secret.is_empty());
    }

    #[test]
    fn test_idspec() {
        assert_eq!(IdSpec::Any.compare(5), None);
        assert_eq!(IdSpec::Id(5).compare(5), Some(true));
        assert_eq!(IdSpec::Id(4).compare(5), Some(false));
        assert_eq!(IdSpec::Any.resolve(7), 7);
    }
}
