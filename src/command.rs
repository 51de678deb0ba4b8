//! Command factory (C3): builds child-process invocations for both the SSH
//! session handler and the reconnecting-PTY engine.
//!
//! Grounded on the teacher's `agent::spawn::build_command`, generalized from
//! a fixed `bash` invocation to the full rule set in spec.md §4.4: shell
//! discovery, login-vs-raw-command argv shape, working directory fallback,
//! and a five-layer environment assembly order.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Result;

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::metadata::WorkspaceMetadata;
use crate::util::homedir;

/// A fully-resolved child-process invocation, independent of whichever
/// process-spawning API the caller uses (`portable_pty::CommandBuilder` for
/// PTY-hosted children, `tokio::process::Command` for pipe-hosted ones).
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Program to execute (the resolved login shell, or `cmd.exe` on Windows).
    pub program: String,
    /// Argument vector.
    pub args: Vec<String>,
    /// Working directory.
    pub cwd: PathBuf,
    /// Fully assembled environment, in final-value form (no more expansion
    /// needed by the caller).
    pub env: HashMap<String, String>,
}

/// Build a [`CommandSpec`] for `raw_command` per spec.md §4.4.
///
/// `raw_command` empty means "start the user's login shell"; non-empty means
/// "run this one command through the shell's `-c` flag".
///
/// # Errors
///
/// Returns [`AgentError::MetadataNotReady`] if `metadata` is `None` — the
/// factory needs the current working directory and env-var overrides from
/// the control plane before it can build anything.
pub fn build(
    raw_command: &str,
    session_env: &HashMap<String, String>,
    metadata: Option<&WorkspaceMetadata>,
    session_token: &str,
    config: &AgentConfig,
) -> Result<CommandSpec> {
    let metadata = metadata.ok_or(AgentError::MetadataNotReady)?;
    let user = homedir::current_user()?;

    let (program, args) = if cfg!(windows) {
        let program = "cmd.exe".to_string();
        let args = if raw_command.is_empty() {
            Vec::new()
        } else {
            vec!["/c".to_string(), raw_command.to_string()]
        };
        (program, args)
    } else {
        let args = if raw_command.is_empty() {
            vec!["-l".to_string()]
        } else {
            vec!["-c".to_string(), raw_command.to_string()]
        };
        (user.shell.clone(), args)
    };

    let cwd = if metadata.directory.is_empty() {
        PathBuf::from(&user.home_dir)
    } else {
        PathBuf::from(&metadata.directory)
    };

    let mut env: HashMap<String, String> = std::env::vars().collect();

    for (k, v) in session_env {
        env.insert(k.clone(), v.clone());
    }

    let agent_exe = std::env::current_exe()
        .map(|p| p.to_string_lossy().replace('\\', "/"))
        .unwrap_or_else(|_| "wsagentd".to_string());
    env.insert("CODER".to_string(), "true".to_string());
    env.insert("USER".to_string(), user.name.clone());
    env.insert("GIT_SSH_COMMAND".to_string(), format!("{agent_exe} gitssh --"));
    env.insert("CODER_AGENT_TOKEN".to_string(), session_token.to_string());
    env.insert("SSH_CLIENT".to_string(), "0.0.0.0 0 0".to_string());
    env.insert(
        "SSH_CONNECTION".to_string(),
        "0.0.0.0 0 0.0.0.0 0".to_string(),
    );
    env.insert(
        "VSCODE_PROXY_URI".to_string(),
        metadata.vscode_proxy_uri.clone(),
    );
    env.insert(
        "CS_DISABLE_GETTING_STARTED_OVERRIDE".to_string(),
        "true".to_string(),
    );

    for (k, v) in &metadata.env {
        let expanded = shellexpand::env(v).map(|s| s.into_owned()).unwrap_or_else(|_| v.clone());
        env.insert(k.clone(), expanded);
    }

    for (k, v) in &config.env_overrides {
        env.insert(k.clone(), v.clone());
    }

    Ok(CommandSpec { program, args, cwd, env })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::metadata::WorkspaceMetadata;

    fn metadata_with_dir(dir: &str) -> WorkspaceMetadata {
        WorkspaceMetadata {
            directory: dir.to_string(),
            env: HashMap::new(),
            motd_path: String::new(),
            startup_script: String::new(),
            vscode_proxy_uri: String::new(),
            git_auth_config_count: 0,
        }
    }

    #[test]
    fn test_missing_metadata_is_not_ready() {
        let config = AgentConfig::for_test();
        let err = build("", &HashMap::new(), None, "tok", &config).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AgentError>(),
            Some(AgentError::MetadataNotReady)
        ));
    }

    #[test]
    fn test_empty_command_is_login_shell() {
        let config = AgentConfig::for_test();
        let metadata = metadata_with_dir("");
        let spec = build("", &HashMap::new(), Some(&metadata), "tok", &config).unwrap();
        if !cfg!(windows) {
            assert_eq!(spec.args, vec!["-l".to_string()]);
        }
    }

    #[test]
    fn test_raw_command_uses_dash_c() {
        let config = AgentConfig::for_test();
        let metadata = metadata_with_dir("");
        let spec = build("echo hi", &HashMap::new(), Some(&metadata), "tok", &config).unwrap();
        if !cfg!(windows) {
            assert_eq!(spec.args, vec!["-c".to_string(), "echo hi".to_string()]);
        }
    }

    #[test]
    fn test_working_directory_falls_back_to_home() {
        let config = AgentConfig::for_test();
        let metadata = metadata_with_dir("");
        let spec = build("", &HashMap::new(), Some(&metadata), "tok", &config).unwrap();
        let home = homedir::current_user().unwrap().home_dir;
        assert_eq!(spec.cwd, PathBuf::from(home));
    }

    #[test]
    fn test_working_directory_uses_metadata_when_set() {
        let config = AgentConfig::for_test();
        let metadata = metadata_with_dir("/workspace/project");
        let spec = build("", &HashMap::new(), Some(&metadata), "tok", &config).unwrap();
        assert_eq!(spec.cwd, PathBuf::from("/workspace/project"));
    }

    #[test]
    fn test_env_assembly_order_overrides_are_highest_precedence() {
        let mut config = AgentConfig::for_test();
        config.env_overrides.insert("CODER".to_string(), "false".to_string());
        let metadata = metadata_with_dir("");
        let spec = build("", &HashMap::new(), Some(&metadata), "tok", &config).unwrap();
        assert_eq!(spec.env.get("CODER"), Some(&"false".to_string()));
    }

    #[test]
    fn test_session_token_injected() {
        let config = AgentConfig::for_test();
        let metadata = metadata_with_dir("");
        let spec = build("", &HashMap::new(), Some(&metadata), "secret-tok", &config).unwrap();
        assert_eq!(spec.env.get("CODER_AGENT_TOKEN"), Some(&"secret-tok".to_string()));
    }

    #[test]
    fn test_metadata_env_expansion_against_process_env() {
        std::env::set_var("WSAGENT_TEST_PATH_PREFIX", "/opt/custom/bin");
        let config = AgentConfig::for_test();
        let mut metadata = metadata_with_dir("");
        metadata.env.insert(
            "PATH".to_string(),
            "$WSAGENT_TEST_PATH_PREFIX:$PATH".to_string(),
        );
        let spec = build("", &HashMap::new(), Some(&metadata), "tok", &config).unwrap();
        let path = spec.env.get("PATH").unwrap();
        assert!(path.starts_with("/opt/custom/bin:"));
    }

    #[test]
    fn test_session_env_overrides_inherited_but_not_fixed_injections() {
        let config = AgentConfig::for_test();
        let metadata = metadata_with_dir("");
        let mut session_env = HashMap::new();
        session_env.insert("CODER".to_string(), "session-value".to_string());
        let spec = build("", &session_env, Some(&metadata), "tok", &config).unwrap();
        // Fixed injection (layer 3) overrides per-session env (layer 2).
        assert_eq!(spec.env.get("CODER"), Some(&"true".to_string()));
    }
}
