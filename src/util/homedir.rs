//! Current-user lookup: login shell, home directory, username.
//!
//! The spec treats "the user-shell discovery helper" as an external
//! collaborator specified only at its interface; this is that interface's
//! one concrete implementation, reading directly from the passwd database
//! the way a systems daemon normally does (no extra crate needed — `libc`
//! is already on the dependency list).

use std::ffi::CStr;

use anyhow::{anyhow, Result};

/// Passwd-derived facts about the user the agent process is running as.
#[derive(Debug, Clone)]
pub struct UserInfo {
    /// Login name.
    pub name: String,
    /// Home directory, e.g. `/home/coder`.
    pub home_dir: String,
    /// Login shell, e.g. `/bin/bash`.
    pub shell: String,
}

/// Look up the current process's owning user via `getpwuid(getuid())`.
///
/// # Errors
///
/// Returns an error if no passwd entry exists for the current uid.
pub fn current_user() -> Result<UserInfo> {
    // SAFETY: the returned `passwd*` is a pointer into a static buffer owned
    // by libc; we copy every field we need into owned `String`s before
    // returning, so nothing escapes with a borrow on that buffer.
    unsafe {
        *libc::__errno_location() = 0;
        let passwd = libc::getpwuid(libc::getuid());
        if passwd.is_null() {
            let errno = *libc::__errno_location();
            return Err(anyhow!("getpwuid failed for current uid (errno {errno})"));
        }

        let name = CStr::from_ptr((*passwd).pw_name).to_string_lossy().into_owned();
        let home_dir = CStr::from_ptr((*passwd).pw_dir).to_string_lossy().into_owned();
        let mut shell = CStr::from_ptr((*passwd).pw_shell).to_string_lossy().into_owned();
        if shell.is_empty() {
            shell = "/bin/sh".to_string();
        }

        Ok(UserInfo { name, home_dir, shell })
    }
}

/// True if `<home>/.hushlogin` exists, suppressing the MOTD at login.
pub fn has_hushlogin(home_dir: &str) -> bool {
    std::path::Path::new(home_dir).join(".hushlogin").exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_user_resolves() {
        let info = current_user().expect("current process always has a passwd entry");
        assert!(!info.name.is_empty());
        assert!(!info.home_dir.is_empty());
        assert!(!info.shell.is_empty());
    }

    #[test]
    fn test_hushlogin_absent_by_default() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(!has_hushlogin(tmp.path().to_str().unwrap()));
    }

    #[test]
    fn test_hushlogin_detected() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(".hushlogin"), "").unwrap();
        assert!(has_hushlogin(tmp.path().to_str().unwrap()));
    }
}
