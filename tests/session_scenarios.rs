//! Integration tests for the command factory and MOTD/login-shell decision
//! (§4.3, §4.4, §8 scenarios S1, S2), driven through the public
//! `wsagent_core` API.

use std::collections::HashMap;
use std::process::Stdio;

use wsagent_core::command;
use wsagent_core::config::AgentConfig;
use wsagent_core::metadata::WorkspaceMetadata;
use wsagent_core::util::{homedir, motd};

fn metadata_with(dir: &str, motd_path: &str) -> WorkspaceMetadata {
    WorkspaceMetadata { directory: dir.to_string(), motd_path: motd_path.to_string(), ..Default::default() }
}

/// S1: a login shell (empty raw command) with `~/.hushlogin` present skips
/// the MOTD entirely, even though a MOTD file exists and is configured.
#[tokio::test]
async fn test_login_shell_with_hushlogin_skips_motd() {
    let home = tempfile::tempdir().unwrap();
    std::fs::write(home.path().join(".hushlogin"), "").unwrap();
    let motd_file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(motd_file.path(), "welcome\n").unwrap();

    let home_dir = home.path().to_str().unwrap();
    let metadata = metadata_with("", motd_file.path().to_str().unwrap());

    let is_login_shell = true;
    let resolved = motd::resolve_motd_path(is_login_shell, home_dir, &metadata.motd_path);
    assert_eq!(resolved, "", "hushlogin must suppress the MOTD on a login shell");

    let mut out = Vec::new();
    motd::write_motd(&resolved, &mut out).await.unwrap();
    assert!(out.is_empty(), "no MOTD bytes should reach the session when hushlogin is present");

    let config = AgentConfig::for_test();
    let spec = command::build("", &HashMap::new(), Some(&metadata), "tok", &config).unwrap();
    if !cfg!(windows) {
        assert_eq!(spec.args, vec!["-l".to_string()], "empty raw command must build a login-shell invocation");
    }
}

/// Companion case: the same setup without `.hushlogin` does show the MOTD,
/// so the suppression above is actually exercising the hushlogin branch and
/// not some other reason the MOTD might be empty.
#[tokio::test]
async fn test_login_shell_without_hushlogin_shows_motd() {
    let home = tempfile::tempdir().unwrap();
    let motd_file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(motd_file.path(), "welcome\n").unwrap();

    let home_dir = home.path().to_str().unwrap();
    let metadata = metadata_with("", motd_file.path().to_str().unwrap());

    let resolved = motd::resolve_motd_path(true, home_dir, &metadata.motd_path);
    assert_eq!(resolved, metadata.motd_path);

    let mut out = Vec::new();
    motd::write_motd(&resolved, &mut out).await.unwrap();
    assert_eq!(out, b"welcome\n");
}

/// S2: a non-PTY command session runs the raw command through the shell's
/// `-c` flag and exits with the child's own exit code.
#[tokio::test]
async fn test_non_pty_command_runs_and_reports_exit_code() {
    let config = AgentConfig::for_test();
    let metadata = metadata_with("", "");
    let spec = command::build("echo hi", &HashMap::new(), Some(&metadata), "tok", &config).unwrap();

    if cfg!(windows) {
        return;
    }
    assert_eq!(spec.args, vec!["-c".to_string(), "echo hi".to_string()]);

    let user = homedir::current_user().unwrap();
    assert_eq!(spec.program, user.shell);

    let mut cmd = tokio::process::Command::new(&spec.program);
    cmd.args(&spec.args).env_clear().envs(&spec.env);
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    let output = cmd.output().await.unwrap();

    assert!(output.status.success(), "echo hi must exit 0");
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(String::from_utf8_lossy(&output.stdout), "hi\n");
}
