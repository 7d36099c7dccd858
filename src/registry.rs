use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde_json::json;

use crate::event_log;
use crate::script_process::ProcessHandle;

/// Shared grace period between asking every live session to stop and
/// force-killing the survivors.
pub const CLOSE_GRACE: Duration = Duration::from_millis(3000);

const FEED_TIMEOUT: Duration = Duration::from_millis(500);
const STDIN_CLOSE_TIMEOUT: Duration = Duration::from_millis(200);
const CLOSE_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// One named streaming script run: the live process plus everything the
/// completion policy needs once it finishes.
#[derive(Debug)]
pub struct ScriptSession {
    pub script: PathBuf,
    pub target: Option<String>,
    pub handle: ProcessHandle,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub close_requested: bool,
}

impl ScriptSession {
    pub fn new(script: PathBuf, target: Option<String>, handle: ProcessHandle) -> Self {
        Self {
            script,
            target,
            handle,
            stdout: Vec::new(),
            stderr: Vec::new(),
            close_requested: false,
        }
    }
}

/// Session-ID keyed collection of live streaming scripts. Mutated only from
/// the router's event thread.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, ScriptSession>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn insert(&mut self, id: String, session: ScriptSession) {
        self.sessions.insert(id, session);
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut ScriptSession> {
        self.sessions.get_mut(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<ScriptSession> {
        self.sessions.remove(id)
    }

    /// Writes one payload to the named session's stdin. Unknown or finished
    /// sessions make this a no-op; nothing is ever spawned here.
    pub fn feed(&mut self, id: &str, payload: Vec<u8>) -> bool {
        let Some(session) = self.sessions.get(id) else {
            event_log::log("feed_unknown_session", json!({ "session": id }));
            return false;
        };
        if session.handle.is_finished() {
            return false;
        }
        match session.handle.write_input(payload, FEED_TIMEOUT) {
            Ok(()) => true,
            Err(err) => {
                event_log::log(
                    "feed_failed",
                    json!({ "session": id, "error": err.to_string() }),
                );
                false
            }
        }
    }

    /// Asks every live session to stop, then waits out one shared grace
    /// deadline. Sessions exiting early are removed as they exit; whatever
    /// is still alive at the deadline is force-killed. Returns with the
    /// registry empty.
    pub fn close_all(&mut self, grace: Duration) {
        if self.sessions.is_empty() {
            return;
        }
        for session in self.sessions.values_mut() {
            session.close_requested = true;
            let _ = session.handle.close_stdin(STDIN_CLOSE_TIMEOUT);
            session.handle.terminate();
        }
        let deadline = Instant::now() + grace;
        loop {
            self.sessions.retain(|id, session| {
                if session.handle.is_finished() {
                    event_log::log("session_closed", json!({ "session": id }));
                    false
                } else {
                    true
                }
            });
            if self.sessions.is_empty() {
                return;
            }
            if Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(CLOSE_POLL_INTERVAL);
        }
        for (id, session) in self.sessions.drain() {
            session.handle.kill();
            event_log::log("session_force_killed", json!({ "session": id }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_to_unknown_session_is_a_noop() {
        let mut registry = SessionRegistry::new();
        assert!(!registry.feed("nope", b"data\n".to_vec()));
        assert!(registry.is_empty());
    }

    #[cfg(target_family = "unix")]
    mod unix {
        use std::collections::BTreeMap;
        use std::sync::mpsc;
        use std::time::Duration;

        use super::*;
        use crate::script_process::{
            EnvPolicy, ProcessEvent, ProcessSpec, ProcessTag, spawn_streaming,
        };

        fn sh_spec(script: &str) -> ProcessSpec {
            ProcessSpec {
                program: "/bin/sh".into(),
                args: vec!["-c".into(), script.into()],
                env: EnvPolicy::Inherit(BTreeMap::new()),
                cwd: None,
            }
        }

        fn start_session(
            registry: &mut SessionRegistry,
            id: &str,
            script: &str,
        ) -> mpsc::Receiver<(ProcessTag, ProcessEvent)> {
            let (tx, rx) = mpsc::channel();
            let handle =
                spawn_streaming(&sh_spec(script), None, ProcessTag::Page(id.to_string()), tx)
                    .expect("spawn session");
            registry.insert(
                id.to_string(),
                ScriptSession::new("/tmp/script.pl".into(), None, handle),
            );
            rx
        }

        fn collect_stdout(rx: &mpsc::Receiver<(ProcessTag, ProcessEvent)>) -> Vec<u8> {
            let mut stdout = Vec::new();
            loop {
                match rx.recv_timeout(Duration::from_secs(10)).expect("event") {
                    (_, ProcessEvent::Stdout(chunk)) => stdout.extend_from_slice(&chunk),
                    (_, ProcessEvent::Stderr(_)) => {}
                    (_, ProcessEvent::Finished(_)) => return stdout,
                }
            }
        }

        #[test]
        fn feed_reaches_the_live_process_stdin() {
            let mut registry = SessionRegistry::new();
            let rx = start_session(&mut registry, "s1", "read line; printf 'got:%s' \"$line\"");
            assert!(registry.feed("s1", b"hello\n".to_vec()));
            let stdout = collect_stdout(&rx);
            assert_eq!(stdout, b"got:hello");
        }

        #[test]
        fn close_all_lets_cooperative_sessions_exit_early() {
            let mut registry = SessionRegistry::new();
            let _rx = start_session(&mut registry, "s1", "sleep 30");
            let started = std::time::Instant::now();
            registry.close_all(Duration::from_millis(3000));
            assert!(registry.is_empty());
            assert!(started.elapsed() < Duration::from_secs(2));
        }

        #[test]
        fn close_all_force_kills_survivors_at_the_deadline() {
            let mut registry = SessionRegistry::new();
            let _rx = start_session(&mut registry, "s1", "trap '' TERM; sleep 30");
            let started = std::time::Instant::now();
            registry.close_all(Duration::from_millis(300));
            assert!(registry.is_empty());
            assert!(started.elapsed() < Duration::from_secs(5));
        }

        #[test]
        fn feed_after_finish_is_a_noop() {
            let mut registry = SessionRegistry::new();
            let rx = start_session(&mut registry, "s1", "exit 0");
            let _ = collect_stdout(&rx);
            // The monitor thread marks the handle finished before sending
            // the final event, so the flag is already set here.
            assert!(!registry.feed("s1", b"late\n".to_vec()));
        }
    }
}
