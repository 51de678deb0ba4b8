//! Message-of-the-day rendering for interactive login shells.

use anyhow::Result;
use tokio::io::AsyncWriteExt;

/// Decide which MOTD path (if any) a session should show, per §4.3: only a
/// login shell (empty raw command) ever sees one, and only if the user
/// hasn't suppressed it with `~/.hushlogin`.
#[must_use]
pub fn resolve_motd_path(is_login_shell: bool, home_dir: &str, metadata_motd_path: &str) -> String {
    if is_login_shell && !super::homedir::has_hushlogin(home_dir) {
        metadata_motd_path.to_string()
    } else {
        String::new()
    }
}

/// Write the MOTD file's contents to `out`, if one is configured and exists.
///
/// Callers are expected to have already checked [`super::homedir::has_hushlogin`]
/// and the "is this a login shell" condition; this function only handles the
/// file-read-and-write mechanics.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read, or the write to
/// `out` fails. A missing MOTD path is not an error — it is simply skipped.
pub async fn write_motd<W>(motd_path: &str, out: &mut W) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    if motd_path.is_empty() {
        return Ok(());
    }
    let contents = match tokio::fs::read(motd_path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    out.write_all(&contents).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_motd_path_skipped_for_non_login_shell() {
        assert_eq!(resolve_motd_path(false, "/home/coder", "/etc/motd"), "");
    }

    #[test]
    fn test_resolve_motd_path_skipped_when_hushlogin_present() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(".hushlogin"), "").unwrap();
        let home = tmp.path().to_str().unwrap();
        assert_eq!(resolve_motd_path(true, home, "/etc/motd"), "");
    }

    #[test]
    fn test_resolve_motd_path_shown_for_login_shell_without_hushlogin() {
        let tmp = tempfile::tempdir().unwrap();
        let home = tmp.path().to_str().unwrap();
        assert_eq!(resolve_motd_path(true, home, "/etc/motd"), "/etc/motd");
    }

    #[tokio::test]
    async fn test_missing_motd_is_noop() {
        let mut out = Vec::new();
        write_motd("/nonexistent/motd", &mut out).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_empty_path_is_noop() {
        let mut out = Vec::new();
        write_motd("", &mut out).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_motd_contents_written() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("motd");
        std::fs::write(&path, "welcome to the workspace\n").unwrap();

        let mut out = Vec::new();
        write_motd(path.to_str().unwrap(), &mut out).await.unwrap();
        assert_eq!(out, b"welcome to the workspace\n");
    }
}
