//! Privilege Drop
//!
//! Switches a root process to an unprivileged account once the listener is
//! bound. The group used is the one named like the user.

use tracing::info;

use crate::error::RelayError;

/// What a privilege drop did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivilegeOutcome {
    /// Switched to the given identity
    Dropped { uid: u32, gid: u32 },
    /// Not running as root, nothing to drop
    NotRoot,
}

/// Drop root privileges to `user`. Failure leaves the caller expected to exit.
#[cfg(unix)]
pub fn drop_privileges(user: &str) -> Result<PrivilegeOutcome, RelayError> {
    use nix::unistd::{geteuid, setgid, setuid, Group, User};

    if !geteuid().is_root() {
        info!(
            "Not running as root (euid {}), keeping current identity",
            geteuid()
        );
        return Ok(PrivilegeOutcome::NotRoot);
    }

    let pwd = User::from_name(user)
        .map_err(|e| RelayError::privilege(user, format!("unable to get UID: {}", e)))?
        .ok_or_else(|| RelayError::privilege(user, "unable to get UID: no such user"))?;

    let grp = Group::from_name(user)
        .map_err(|e| RelayError::privilege(user, format!("unable to get GID: {}", e)))?
        .ok_or_else(|| RelayError::privilege(user, "unable to get GID: no such group"))?;

    // Supplementary groups inherited from root must go before the gid switch
    #[cfg(target_os = "linux")]
    nix::unistd::setgroups(&[grp.gid])
        .map_err(|e| RelayError::privilege(user, format!("unable to clear groups: {}", e)))?;

    setgid(grp.gid)
        .map_err(|e| RelayError::privilege(user, format!("unable to set new group: {}", e)))?;

    setuid(pwd.uid)
        .map_err(|e| RelayError::privilege(user, format!("unable to set new user: {}", e)))?;

    info!(
        uid = pwd.uid.as_raw(),
        gid = grp.gid.as_raw(),
        "Dropped privileges to '{}'",
        user
    );

    Ok(PrivilegeOutcome::Dropped {
        uid: pwd.uid.as_raw(),
        gid: grp.gid.as_raw(),
    })
}

#[cfg(not(unix))]
pub fn drop_privileges(user: &str) -> Result<PrivilegeOutcome, RelayError> {
    info!(
        "Privilege drop to '{}' is not applicable on this platform",
        user
    );
    Ok(PrivilegeOutcome::NotRoot)
}
