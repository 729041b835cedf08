//! Scoped effective-identity switching.
//!
//! The agent itself runs with elevated privileges, but every file it creates
//! for results must belong to an unprivileged user. [`PrivilegeScope`]
//! switches the effective gid/uid for the duration of a single synchronous
//! operation and restores the previous identity when dropped.
//!
//! The switch is process-wide, so no `.await` may happen while a scope is
//! alive.

use anyhow::{anyhow, Context, Result};
use nix::unistd::{getegid, geteuid, setegid, seteuid, Gid, Group, Uid, User};
use tracing::{debug, error};

use crate::config::Privilege;

impl Privilege {
    /// A privilege that keeps the current identity.
    pub fn current() -> Self {
        Self::default()
    }

    /// Build a privilege from user and group names.
    pub fn new(user: &str, group: &str) -> Self {
        Self {
            user: user.to_string(),
            group: group.to_string(),
        }
    }

    /// Resolve user and group names to ids.
    ///
    /// An empty user keeps the current euid. An empty group falls back to the
    /// user's primary group, or the current egid if no user is set.
    pub fn resolve(&self) -> Result<(Uid, Gid)> {
        let user = if self.user.is_empty() {
            None
        } else {
            let user = User::from_name(&self.user)
                .with_context(|| format!("looking up user {}", self.user))?
                .ok_or_else(|| anyhow!("unknown user: {}", self.user))?;
            Some(user)
        };

        let gid = if !self.group.is_empty() {
            Group::from_name(&self.group)
                .with_context(|| format!("looking up group {}", self.group))?
                .ok_or_else(|| anyhow!("unknown group: {}", self.group))?
                .gid
        } else if let Some(user) = &user {
            user.gid
        } else {
            getegid()
        };

        let uid = user.map(|u| u.uid).unwrap_or_else(geteuid);

        Ok((uid, gid))
    }
}

/// Guard holding a temporarily assumed effective identity.
#[derive(Debug)]
pub struct PrivilegeScope {
    prev_uid: Uid,
    prev_gid: Gid,
    switched: bool,
}

impl PrivilegeScope {
    /// Switch to `privilege` until the returned guard is dropped.
    pub fn acquire(privilege: &Privilege) -> Result<Self> {
        let prev_uid = geteuid();
        let prev_gid = getegid();
        let (uid, gid) = privilege.resolve()?;

        if uid == prev_uid && gid == prev_gid {
            return Ok(Self {
                prev_uid,
                prev_gid,
                switched: false,
            });
        }

        // The group must change first: after seteuid the process may no
        // longer be allowed to change it.
        setegid(gid).with_context(|| format!("setegid({gid})"))?;
        if let Err(e) = seteuid(uid) {
            if let Err(restore) = setegid(prev_gid) {
                error!(error = %restore, gid = %prev_gid, "failed to restore egid");
            }
            return Err(e).with_context(|| format!("seteuid({uid})"));
        }

        debug!(%uid, %gid, "privilege dropped");

        Ok(Self {
            prev_uid,
            prev_gid,
            switched: true,
        })
    }

    /// Whether acquiring the scope actually changed the identity.
    pub fn is_switched(&self) -> bool {
        self.switched
    }
}

impl Drop for PrivilegeScope {
    fn drop(&mut self) {
        if !self.switched {
            return;
        }

        // Regain the uid first, it is what allows restoring the group.
        if let Err(e) = seteuid(self.prev_uid) {
            error!(error = %e, uid = %self.prev_uid, "failed to restore euid");
        }
        if let Err(e) = setegid(self.prev_gid) {
            error!(error = %e, gid = %self.prev_gid, "failed to restore egid");
        }

        debug!(uid = %self.prev_uid, gid = %self.prev_gid, "privilege restored");
    }
}

/// Run `f` under `privilege`, restoring the previous identity afterwards
/// whether or not `f` succeeded.
pub fn with_privilege<T, E, F>(privilege: &Privilege, f: F) -> Result<T>
where
    F: FnOnce() -> std::result::Result<T, E>,
    E: Into<anyhow::Error>,
{
    let _scope = PrivilegeScope::acquire(privilege)?;
    f().map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use std::io;

    use serial_test::serial;

    use super::*;

    fn current_names() -> Privilege {
        let user = User::from_uid(geteuid())
            .expect("lookup current user")
            .expect("current user exists");
        let group = Group::from_gid(getegid())
            .expect("lookup current group")
            .expect("current group exists");
        Privilege::new(&user.name, &group.name)
    }

    #[test]
    fn test_resolve_current() {
        let (uid, gid) = Privilege::current().resolve().expect("resolve");
        assert_eq!(uid, geteuid());
        assert_eq!(gid, getegid());
    }

    #[test]
    fn test_resolve_by_name() {
        let (uid, gid) = current_names().resolve().expect("resolve");
        assert_eq!(uid, geteuid());
        assert_eq!(gid, getegid());
    }

    #[test]
    fn test_resolve_unknown_user() {
        let err = Privilege::new("benchmon-no-such-user", "")
            .resolve()
            .expect_err("should fail");
        assert!(err.to_string().contains("unknown user"));
    }

    #[test]
    fn test_resolve_unknown_group() {
        let err = Privilege::new("", "benchmon-no-such-group")
            .resolve()
            .expect_err("should fail");
        assert!(err.to_string().contains("unknown group"));
    }

    #[test]
    #[serial]
    fn test_scope_same_identity_is_noop() {
        let uid = geteuid();
        let scope = PrivilegeScope::acquire(&current_names()).expect("acquire");
        assert!(!scope.is_switched());
        drop(scope);
        assert_eq!(geteuid(), uid);
    }

    #[test]
    #[serial]
    fn test_with_privilege_propagates_error_and_restores() {
        let uid = geteuid();
        let gid = getegid();

        let result: Result<()> = with_privilege(&Privilege::current(), || {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"))
        });

        assert!(result.is_err());
        assert_eq!(geteuid(), uid);
        assert_eq!(getegid(), gid);
    }

    #[test]
    #[serial]
    fn test_with_privilege_returns_value() {
        let value = with_privilege(&Privilege::current(), || Ok::<_, io::Error>(42))
            .expect("closure succeeds");
        assert_eq!(value, 42);
    }
}
