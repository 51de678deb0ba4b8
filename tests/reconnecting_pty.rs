//! Integration tests for the reconnecting-PTY engine (§4.5, §8 scenarios
//! S3, S4, S5) driven entirely through the public `wsagent_core` API over
//! in-memory duplex streams, the same harness shape as the unit test in
//! `reconnect::mod`'s own test module.

use std::collections::HashMap;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use wsagent_core::config::AgentConfig;
use wsagent_core::metadata::{MetadataSlot, SessionTokenSlot, WorkspaceMetadata};
use wsagent_core::reconnect::registry::PtyRegistry;
use wsagent_core::reconnect::wire::{encode_init_frame, ReconnectingPtyInit};
use wsagent_core::reconnect::{handle_connection, run_idle_sweeper};

fn ready_metadata_and_token() -> (MetadataSlot, SessionTokenSlot) {
    let metadata = MetadataSlot::new();
    metadata.swap(WorkspaceMetadata { directory: "/tmp".to_string(), ..Default::default() });
    let token = SessionTokenSlot::new();
    token.set("tok".to_string());
    (metadata, token)
}

/// S3: attach, detach, reattach within the idle timeout reuses the same
/// child process and replays scrollback produced before the reattach.
#[tokio::test]
async fn test_attach_detach_reattach_same_pid_with_scrollback() {
    let registry = PtyRegistry::new();
    let (metadata, token) = ready_metadata_and_token();
    let config = AgentConfig::for_test();

    // First connection: spawn the session, write some input, then hang up.
    let (mut client, server) = tokio::io::duplex(8192);
    let init = ReconnectingPtyInit { id: "A".to_string(), command: "cat".to_string(), height: 24, width: 80 };
    client.write_all(&encode_init_frame(&init)).await.unwrap();
    client.write_all(b"{\"data\":\"ls\\n\"}\n").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    client.shutdown().await.unwrap();
    handle_connection(server, &registry, &metadata, &token, &config).await.unwrap();

    let first_pid = registry.get("A").unwrap().pid();

    // Reattach with the same id before the idle timeout elapses.
    let (mut client2, server2) = tokio::io::duplex(8192);
    client2.write_all(&encode_init_frame(&init)).await.unwrap();
    client2.shutdown().await.unwrap();

    let handle = tokio::spawn(async move {
        let mut replay_buf = Vec::new();
        let mut scratch = [0u8; 4096];
        // Drain whatever the session writes before the connection tears down
        // (replay is written immediately by `handle_connection`).
        loop {
            match tokio::time::timeout(Duration::from_millis(300), client2.read(&mut scratch)).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(n)) => replay_buf.extend_from_slice(&scratch[..n]),
                Ok(Err(_)) => break,
            }
        }
        replay_buf
    });

    handle_connection(server2, &registry, &metadata, &token, &config).await.ok();
    let replay = handle.await.unwrap();
    assert!(replay.windows(2).any(|w| w == b"ls"), "reattach replay must include prior scrollback");

    let second_pid = registry.get("A").unwrap().pid();
    assert_eq!(first_pid, second_pid, "reattach within the idle timeout must reuse the same child process");
}

/// S4: once a session has been idle past the timeout, the sweeper kills it
/// and a subsequent attach with the same id starts a fresh process.
#[tokio::test]
async fn test_idle_expiry_spawns_new_pid() {
    let registry = std::sync::Arc::new(PtyRegistry::new());
    let (metadata, token) = ready_metadata_and_token();
    let mut config = AgentConfig::for_test();
    config.idle_timeout = Duration::from_millis(100);

    let (mut client, server) = tokio::io::duplex(8192);
    let init = ReconnectingPtyInit { id: "B".to_string(), command: "cat".to_string(), height: 24, width: 80 };
    client.write_all(&encode_init_frame(&init)).await.unwrap();
    client.shutdown().await.unwrap();
    handle_connection(server, &registry, &metadata, &token, &config).await.unwrap();

    let first_pid = registry.get("B").unwrap().pid();

    // Let the idle timer elapse, then sweep once directly (the background
    // sweeper task runs on a 10s tick; sweeping inline keeps this test fast).
    tokio::time::sleep(Duration::from_millis(150)).await;
    registry.sweep(config.idle_timeout);
    assert!(registry.get("B").is_none(), "expired session must be evicted from the registry");

    let (mut client2, server2) = tokio::io::duplex(8192);
    client2.write_all(&encode_init_frame(&init)).await.unwrap();
    client2.shutdown().await.unwrap();
    handle_connection(server2, &registry, &metadata, &token, &config).await.unwrap();

    let second_session = registry.get("B").unwrap();
    let second_pid = second_session.pid();
    assert_ne!(first_pid, second_pid, "attach after idle eviction must start a new child process");

    second_session.kill_and_reap();

    // run_idle_sweeper itself should be cancellable without hanging, since
    // the supervisor relies on this to unwind cleanly on shutdown.
    let cancel = tokio_util::sync::CancellationToken::new();
    let sweeper_registry = std::sync::Arc::clone(&registry);
    let sweeper_config = config.clone();
    let sweeper_cancel = cancel.clone();
    let sweeper = tokio::spawn(run_idle_sweeper(sweeper_registry, sweeper_config, sweeper_cancel));
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), sweeper).await.unwrap().unwrap();
}

/// S5: two concurrent subscribers to the same session id both observe
/// output produced after they attach.
#[tokio::test]
async fn test_multiple_subscribers_both_see_output() {
    let registry = PtyRegistry::new();
    let (metadata, token) = ready_metadata_and_token();
    let config = AgentConfig::for_test();

    // Pre-create the session so both connections below attach to the same
    // one via `registry.get` rather than racing each other through the
    // get-or-spawn path in `handle_connection`.
    let spec = wsagent_core::CommandSpec {
        program: "/bin/sh".to_string(),
        args: vec!["-c".to_string(), "cat".to_string()],
        cwd: std::path::PathBuf::from("/"),
        env: HashMap::new(),
    };
    let session = wsagent_core::reconnect::registry::PtySession::spawn("C".to_string(), &spec, 24, 80).unwrap();
    registry.insert("C".to_string(), session);

    let (mut client1, server1) = tokio::io::duplex(8192);
    let init = ReconnectingPtyInit { id: "C".to_string(), command: "cat".to_string(), height: 24, width: 80 };
    client1.write_all(&encode_init_frame(&init)).await.unwrap();

    let (mut client2, server2) = tokio::io::duplex(8192);
    client2.write_all(&encode_init_frame(&init)).await.unwrap();

    let conn1 = {
        let registry = &registry;
        let metadata = &metadata;
        let token = &token;
        let config = &config;
        async move { handle_connection(server1, registry, metadata, token, config).await }
    };
    let conn2 = {
        let registry = &registry;
        let metadata = &metadata;
        let token = &token;
        let config = &config;
        async move { handle_connection(server2, registry, metadata, token, config).await }
    };

    let driver = async {
        // Give both connections a moment to attach, then write through the
        // first subscriber and read the echo from both.
        tokio::time::sleep(Duration::from_millis(150)).await;
        client1.write_all(b"{\"data\":\"x\"}\n").await.unwrap();

        let mut buf1 = [0u8; 64];
        let mut buf2 = [0u8; 64];
        let n1 = tokio::time::timeout(Duration::from_secs(2), client1.read(&mut buf1)).await.unwrap().unwrap();
        let n2 = tokio::time::timeout(Duration::from_secs(2), client2.read(&mut buf2)).await.unwrap().unwrap();
        assert!(buf1[..n1].contains(&b'x'));
        assert!(buf2[..n2].contains(&b'x'));

        client1.shutdown().await.unwrap();
        client2.shutdown().await.unwrap();
    };

    tokio::select! {
        _ = conn1 => {}
        _ = conn2 => {}
        () = driver => {}
    }
}
