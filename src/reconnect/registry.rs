//! Reconnecting-PTY session registry (C1, §4.5).
//!
//! A [`PtySession`] bundles a `portable_pty` child together with a
//! [`RingBuffer`] scrollback and a fan-out list of attached subscribers,
//! generalizing the teacher's `agent::pty::PtySession` from a VT100-parsed,
//! single-owner session into a multi-subscriber one keyed by a client-chosen
//! id that survives reconnects. The reader thread is spawned exactly the way
//! `agent::spawn::spawn_server_reader_thread` does (blocking `Read` loop on a
//! dedicated OS thread, since `portable_pty` has no async API), but instead
//! of feeding a VT100 parser it appends to the scrollback ring buffer and
//! fans bytes out to every attached subscriber channel.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::command::CommandSpec;
use crate::error::AgentError;
use crate::reconnect::ringbuffer::RingBuffer;

/// One subscriber's output channel: raw PTY bytes pushed as they arrive.
pub type SubscriberTx = mpsc::UnboundedSender<Vec<u8>>;

/// A single reconnecting-PTY session: one child process, any number of
/// concurrently or sequentially attached clients.
pub struct PtySession {
    id: String,
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    child: Mutex<Box<dyn Child + Send>>,
    scrollback: Mutex<RingBuffer>,
    subscribers: Mutex<Vec<SubscriberTx>>,
    /// When the subscriber count last dropped to zero; cleared the moment a
    /// new subscriber attaches. `None` while at least one subscriber is
    /// attached, or before the first one ever was.
    idle_since: Mutex<Option<Instant>>,
    /// Cancelled when the idle timer fires with zero subscribers attached,
    /// or when the process exits on its own. Both the reader thread and the
    /// idle-timer task race against this to decide who tears the session
    /// down.
    pub closed: CancellationToken,
}

impl PtySession {
    /// Open a PTY, spawn `spec` inside it, and start the background reader
    /// thread that feeds the scrollback buffer and all current/future
    /// subscribers.
    pub fn spawn(id: String, spec: &CommandSpec, height: u16, width: u16) -> Result<Arc<Self>> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize { rows: height.max(1), cols: width.max(1), pixel_width: 0, pixel_height: 0 })
            .context("opening pty")?;

        let mut cmd = CommandBuilder::new(&spec.program);
        for arg in &spec.args {
            cmd.arg(arg);
        }
        cmd.cwd(&spec.cwd);
        cmd.env_clear();
        for (k, v) in &spec.env {
            cmd.env(k, v);
        }

        let child = pair.slave.spawn_command(cmd).context("spawning pty child")?;
        drop(pair.slave);

        let writer = pair.master.take_writer().context("taking pty writer")?;
        let reader = pair.master.try_clone_reader().context("cloning pty reader")?;

        let session = Arc::new(Self {
            id,
            master: Mutex::new(pair.master),
            writer: Mutex::new(writer),
            child: Mutex::new(child),
            scrollback: Mutex::new(RingBuffer::with_scrollback_capacity()),
            subscribers: Mutex::new(Vec::new()),
            idle_since: Mutex::new(Some(Instant::now())),
            closed: CancellationToken::new(),
        });

        spawn_reader_thread(Arc::clone(&session), reader);

        Ok(session)
    }

    /// Session id, as chosen by the first client and reused on reconnect.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// OS pid of the child process, for asserting a reattach reused the
    /// same process rather than restarting one (§8 invariant 2).
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.child.lock().expect("child lock poisoned").process_id()
    }

    /// Write input bytes to the child's stdin (PTY master).
    pub fn write_input(&self, data: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().expect("pty writer lock poisoned");
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    /// Resize the PTY. A zero dimension is rejected by `portable_pty`, so
    /// callers must only call this when
    /// [`ReconnectingPtyStreamMessage::wants_resize`](crate::reconnect::wire::ReconnectingPtyStreamMessage::wants_resize)
    /// is true.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        let master = self.master.lock().expect("pty master lock poisoned");
        master
            .resize(PtySize { rows, cols, pixel_width: 0, pixel_height: 0 })
            .context("resizing pty")
    }

    /// Attach a new subscriber, returning the scrollback replay to send
    /// immediately and registering `tx` to receive everything produced from
    /// this point on.
    ///
    /// Scrollback is snapshotted and the subscriber registered under the
    /// same lock acquisition, so a byte produced concurrently by the reader
    /// thread is either in the replay or delivered to `tx`, never both and
    /// never neither (§4.5 invariant: scrollback append happens-before
    /// fan-out).
    pub fn attach(&self, tx: SubscriberTx) -> Vec<u8> {
        let scrollback = self.scrollback.lock().expect("scrollback lock poisoned");
        let replay = scrollback.to_vec();
        self.subscribers.lock().expect("subscribers lock poisoned").push(tx);
        *self.idle_since.lock().expect("idle_since lock poisoned") = None;
        replay
    }

    /// Number of currently attached subscribers (closed channels are pruned
    /// lazily on the next fan-out, so this is an upper bound between pumps).
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("subscribers lock poisoned").len()
    }

    /// True once the session has had zero subscribers for at least
    /// `idle_timeout` — checked by the idle sweeper (§4.5, §8 scenario S4).
    #[must_use]
    pub fn is_idle_expired(&self, idle_timeout: Duration) -> bool {
        match *self.idle_since.lock().expect("idle_since lock poisoned") {
            Some(since) => since.elapsed() >= idle_timeout,
            None => false,
        }
    }

    fn push_and_fan_out(&self, data: &[u8]) {
        self.scrollback.lock().expect("scrollback lock poisoned").push(data);
        let mut subs = self.subscribers.lock().expect("subscribers lock poisoned");
        subs.retain(|tx| tx.send(data.to_vec()).is_ok());
        if subs.is_empty() {
            let mut idle_since = self.idle_since.lock().expect("idle_since lock poisoned");
            if idle_since.is_none() {
                *idle_since = Some(Instant::now());
            }
        }
    }

    /// Re-check subscriber liveness and arm the idle timer if every
    /// previously attached subscriber has since disconnected. The per-
    /// connection pump calls this when its own loop exits, since a
    /// subscriber that simply stops reading (no further output arrives)
    /// would otherwise never trigger the `retain` pass in
    /// `push_and_fan_out`.
    pub fn mark_possibly_idle(&self) {
        let mut subs = self.subscribers.lock().expect("subscribers lock poisoned");
        subs.retain(|tx| !tx.is_closed());
        if subs.is_empty() {
            let mut idle_since = self.idle_since.lock().expect("idle_since lock poisoned");
            if idle_since.is_none() {
                *idle_since = Some(Instant::now());
            }
        }
    }

    /// Kill the child process and wait on it, so it never becomes a zombie.
    /// Mirrors the teacher's `PtySession::kill_child`.
    pub fn kill_and_reap(&self) {
        let mut child = self.child.lock().expect("child lock poisoned");
        log::info!("killing reconnecting-pty child for session {}", self.id);
        if let Err(e) = child.kill() {
            log::warn!("failed to kill reconnecting-pty child {}: {e}", self.id);
        }
        let _ = child.wait();
    }
}

fn spawn_reader_thread(session: Arc<PtySession>, mut reader: Box<dyn Read + Send>) {
    std::thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => session.push_and_fan_out(&buf[..n]),
                Err(e) => {
                    log::warn!("reconnecting-pty reader for session {} stopped: {e}", session.id);
                    break;
                }
            }
        }
        session.kill_and_reap();
        session.closed.cancel();
    });
}

/// Concurrent registry of live reconnecting-PTY sessions, keyed by the
/// client-chosen session id (§4.5).
#[derive(Default)]
pub struct PtyRegistry {
    sessions: Mutex<HashMap<String, Arc<PtySession>>>,
}

impl PtyRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self { sessions: Mutex::new(HashMap::new()) }
    }

    /// Look up a live session, evicting it first if its reader thread has
    /// already torn it down.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<PtySession>> {
        let mut sessions = self.sessions.lock().expect("registry lock poisoned");
        if let Some(session) = sessions.get(id) {
            if session.closed.is_cancelled() {
                sessions.remove(id);
                return None;
            }
            return Some(Arc::clone(session));
        }
        None
    }

    /// Insert a freshly spawned session under `id`. Returns an error if a
    /// live session already holds that id (callers should `get` first).
    pub fn insert(&self, id: String, session: Arc<PtySession>) {
        self.sessions.lock().expect("registry lock poisoned").insert(id, session);
    }

    /// Remove and return a session by id, used once its idle timer expires.
    pub fn remove(&self, id: &str) -> Option<Arc<PtySession>> {
        self.sessions.lock().expect("registry lock poisoned").remove(id)
    }

    /// Fetch a live session or a domain-specific not-found error.
    pub fn require(&self, id: &str) -> Result<Arc<PtySession>, AgentError> {
        self.get(id).ok_or_else(|| AgentError::SessionNotFound(id.to_string()))
    }

    /// Evict every session that is either already closed or has been idle
    /// (zero subscribers) for at least `idle_timeout`, killing each one's
    /// child process before dropping it.
    pub fn sweep(&self, idle_timeout: Duration) {
        let expired: Vec<Arc<PtySession>> = {
            let mut sessions = self.sessions.lock().expect("registry lock poisoned");
            let expired_ids: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| s.closed.is_cancelled() || s.is_idle_expired(idle_timeout))
                .map(|(id, _)| id.clone())
                .collect();
            expired_ids.into_iter().filter_map(|id| sessions.remove(&id)).collect()
        };
        for session in expired {
            if !session.closed.is_cancelled() {
                log::info!("reaping idle reconnecting-pty session {}", session.id());
                session.kill_and_reap();
                session.closed.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use std::path::PathBuf;

    fn echo_spec() -> CommandSpec {
        CommandSpec {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), "cat".to_string()],
            cwd: PathBuf::from("/"),
            env: StdHashMap::new(),
        }
    }

    #[test]
    fn test_registry_starts_empty() {
        let registry = PtyRegistry::new();
        assert!(registry.get("nope").is_none());
        assert!(matches!(registry.require("nope"), Err(AgentError::SessionNotFound(_))));
    }

    #[test]
    fn test_spawn_attach_write_and_replay() {
        let session = PtySession::spawn("sess-1".to_string(), &echo_spec(), 24, 80).unwrap();
        session.write_input(b"hello\n").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(200));

        let (tx, _rx) = mpsc::unbounded_channel();
        let replay = session.attach(tx);
        assert!(replay.windows(5).any(|w| w == b"hello"));

        session.kill_and_reap();
    }

    #[test]
    fn test_registry_insert_and_get() {
        let registry = PtyRegistry::new();
        let session = PtySession::spawn("sess-2".to_string(), &echo_spec(), 24, 80).unwrap();
        registry.insert("sess-2".to_string(), Arc::clone(&session));
        assert!(registry.get("sess-2").is_some());
        session.kill_and_reap();
        session.closed.cancel();
        assert!(registry.get("sess-2").is_none());
    }
}
