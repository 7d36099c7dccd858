use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;

use memchr::memmem;
use serde_json::json;

use crate::cgi_env::{QUERY_STRING_VAR, REQUEST_METHOD_VAR};
use crate::error::ProcessError;
use crate::event_log;
use crate::router::SurfaceBridge;
use crate::script_process::{
    EnvPolicy, ProcessEvent, ProcessHandle, ProcessSpec, ProcessTag, spawn_streaming,
};

pub const DEBUG_FLAG: &str = "-d";
pub const READLINE_VAR: &str = "PERLDB_OPTS";
pub const READLINE_VALUE: &str = "ReadLine=0";

const PROMPT_MARKER: &[u8] = b"DB<";
const MAX_PROMPT_DIGITS: usize = 5;
const COMMAND_TIMEOUT: Duration = Duration::from_millis(500);
const TEARDOWN_GRACE: Duration = Duration::from_millis(3000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebuggerState {
    Idle,
    Starting,
    AwaitingPrompt,
    Ready,
    Closed,
}

#[derive(Debug, Clone)]
pub struct DebuggerConfig {
    pub interpreter: PathBuf,
    pub formatter_script: PathBuf,
    pub app_root: PathBuf,
}

/// Singleton wrapper around one persistent interpreter in debug mode plus
/// one transient formatter process.
///
/// Stdout and stderr of the persistent process are merged into a single raw
/// accumulation buffer; the formatter turns that buffer into HTML for the
/// debugger display frame.
pub struct DebuggerSession {
    config: DebuggerConfig,
    events: mpsc::Sender<(ProcessTag, ProcessEvent)>,
    script: Option<PathBuf>,
    handle: Option<ProcessHandle>,
    formatter: Option<ProcessHandle>,
    raw: Vec<u8>,
    html: Vec<u8>,
    just_started: bool,
    pending_nonempty: bool,
    state: DebuggerState,
}

impl DebuggerSession {
    pub fn new(config: DebuggerConfig, events: mpsc::Sender<(ProcessTag, ProcessEvent)>) -> Self {
        Self {
            config,
            events,
            script: None,
            handle: None,
            formatter: None,
            raw: Vec::new(),
            html: Vec::new(),
            just_started: false,
            pending_nonempty: false,
            state: DebuggerState::Idle,
        }
    }

    pub fn state(&self) -> DebuggerState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn script(&self) -> Option<&Path> {
        self.script.as_deref()
    }

    /// "Select a script to debug". With the same target already open the
    /// command goes straight to stdin; otherwise the persistent process is
    /// (re)started for the new target, and any nonempty command is written
    /// immediately after start.
    pub fn select_script(
        &mut self,
        script: &Path,
        command: &str,
        extra_args: &[String],
    ) -> Result<(), ProcessError> {
        if self.is_open() && self.script.as_deref() == Some(script) {
            if !command.is_empty() {
                let handle = self
                    .handle
                    .as_ref()
                    .ok_or_else(|| ProcessError::Protocol("debugger handle missing".into()))?;
                handle.write_input(newline_terminated(command), COMMAND_TIMEOUT)?;
            }
            return Ok(());
        }

        self.shutdown();
        self.raw.clear();
        self.html.clear();
        self.state = DebuggerState::Starting;

        let mut args: Vec<OsString> = vec![DEBUG_FLAG.into(), script.into()];
        args.extend(extra_args.iter().map(OsString::from));
        let spec = ProcessSpec {
            program: self.config.interpreter.clone(),
            args,
            env: debug_environment(script, &self.config.app_root),
            cwd: script.parent().map(Path::to_path_buf),
        };
        let handle = spawn_streaming(&spec, None, ProcessTag::Debugger, self.events.clone())?;
        if !command.is_empty() {
            handle.write_input(newline_terminated(command), COMMAND_TIMEOUT)?;
        }
        event_log::log(
            "debugger_started",
            json!({
                "script": script.to_string_lossy().to_string(),
                "pid": handle.pid(),
                "command_pending": !command.is_empty(),
            }),
        );
        self.pending_nonempty = !command.is_empty();
        self.just_started = true;
        self.script = Some(script.to_path_buf());
        self.handle = Some(handle);
        self.state = DebuggerState::AwaitingPrompt;
        Ok(())
    }

    pub fn handle_debugger_event(&mut self, event: ProcessEvent) {
        match event {
            ProcessEvent::Stdout(chunk) | ProcessEvent::Stderr(chunk) => {
                self.raw.extend_from_slice(&chunk);
                self.check_prompt();
            }
            ProcessEvent::Finished(info) => {
                // A replaced process exiting late; the live session stays up.
                if self
                    .handle
                    .as_ref()
                    .is_some_and(|handle| !handle.is_finished())
                {
                    return;
                }
                self.handle = None;
                self.state = DebuggerState::Closed;
                event_log::log(
                    "debugger_exited",
                    json!({ "code": info.code, "success": info.success }),
                );
            }
        }
    }

    pub fn handle_formatter_event(&mut self, event: ProcessEvent, bridge: &dyn SurfaceBridge) {
        match event {
            ProcessEvent::Stdout(chunk) => self.html.extend_from_slice(&chunk),
            ProcessEvent::Stderr(chunk) => {
                event_log::log_lazy("formatter_stderr", || {
                    json!({ "text": String::from_utf8_lossy(&chunk).to_string() })
                });
            }
            ProcessEvent::Finished(_) => {
                self.formatter = None;
                let html = std::mem::take(&mut self.html);
                bridge.push_debugger_html(&String::from_utf8_lossy(&html));
            }
        }
    }

    /// Tears the persistent process down, terminate first, forced kill after
    /// the grace period. Open formatters are short-lived and killed outright.
    pub fn shutdown(&mut self) {
        if let Some(formatter) = self.formatter.take() {
            formatter.kill();
        }
        if let Some(handle) = self.handle.take() {
            handle.shutdown_graceful(TEARDOWN_GRACE);
        }
        self.script = None;
        self.state = DebuggerState::Idle;
    }

    fn check_prompt(&mut self) {
        if !prompt_satisfied(&self.raw, self.just_started, self.pending_nonempty) {
            return;
        }
        self.just_started = false;
        self.state = DebuggerState::Ready;
        self.invoke_formatter();
    }

    /// Hands the accumulated raw output to the formatter as its query
    /// string and clears the buffer. A still-open previous formatter is
    /// stale and gets killed first.
    fn invoke_formatter(&mut self) {
        if let Some(open) = self.formatter.take() {
            open.kill();
        }
        let raw = std::mem::take(&mut self.raw);
        let mut vars = BTreeMap::new();
        vars.insert(REQUEST_METHOD_VAR.to_string(), "GET".to_string());
        vars.insert(
            QUERY_STRING_VAR.to_string(),
            String::from_utf8_lossy(&raw).into_owned(),
        );
        let spec = ProcessSpec {
            program: self.config.interpreter.clone(),
            args: vec![self.config.formatter_script.clone().into()],
            env: EnvPolicy::Clean(vars),
            cwd: None,
        };
        match spawn_streaming(&spec, None, ProcessTag::Formatter, self.events.clone()) {
            Ok(handle) => self.formatter = Some(handle),
            Err(err) => {
                event_log::log("formatter_spawn_failed", json!({ "error": err.to_string() }));
            }
        }
    }
}

/// Scripts inside the managed application root run against a clean
/// environment holding only the readline switch; foreign scripts keep the
/// full host environment plus the same switch.
pub(crate) fn debug_environment(script: &Path, app_root: &Path) -> EnvPolicy {
    let mut vars = BTreeMap::new();
    vars.insert(READLINE_VAR.to_string(), READLINE_VALUE.to_string());
    if script.starts_with(app_root) {
        EnvPolicy::Clean(vars)
    } else {
        EnvPolicy::Inherit(vars)
    }
}

pub(crate) fn prompt_satisfied(raw: &[u8], just_started: bool, pending_nonempty: bool) -> bool {
    let needed = if just_started && pending_nonempty { 2 } else { 1 };
    count_prompts(raw) >= needed
}

/// Counts `DB<N>` prompt markers with one to five digits.
pub(crate) fn count_prompts(raw: &[u8]) -> usize {
    memmem::find_iter(raw, PROMPT_MARKER)
        .filter(|&position| {
            let rest = &raw[position + PROMPT_MARKER.len()..];
            let digits = rest.iter().take_while(|byte| byte.is_ascii_digit()).count();
            (1..=MAX_PROMPT_DIGITS).contains(&digits) && rest.get(digits) == Some(&b'>')
        })
        .count()
}

fn newline_terminated(command: &str) -> Vec<u8> {
    let mut payload = command.as_bytes().to_vec();
    payload.push(b'\n');
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_markers_need_one_to_five_digits() {
        assert_eq!(count_prompts(b"  DB<1> "), 1);
        assert_eq!(count_prompts(b"DB<12345>"), 1);
        assert_eq!(count_prompts(b"DB<123456>"), 0);
        assert_eq!(count_prompts(b"DB<>"), 0);
        assert_eq!(count_prompts(b"DB<x1>"), 0);
        assert_eq!(count_prompts(b"main::(t.pl:3) DB<1> DB<2>"), 2);
    }

    #[test]
    fn startup_with_pending_command_waits_for_the_second_prompt() {
        let mut raw: Vec<u8> = b"Loading DB routines\n  DB<1> ".to_vec();
        assert!(!prompt_satisfied(&raw, true, true));
        raw.extend_from_slice(b"x=1\n  DB<2> ");
        assert!(prompt_satisfied(&raw, true, true));
    }

    #[test]
    fn startup_without_pending_command_fires_on_the_first_prompt() {
        assert!(prompt_satisfied(b"  DB<1> ", true, false));
    }

    #[test]
    fn past_startup_every_prompt_fires() {
        assert!(prompt_satisfied(b"  DB<7> ", false, true));
        assert!(prompt_satisfied(b"  DB<7> ", false, false));
    }

    #[test]
    fn managed_scripts_get_a_clean_environment() {
        let root = Path::new("/srv/app");
        match debug_environment(Path::new("/srv/app/tools/run.pl"), root) {
            EnvPolicy::Clean(vars) => {
                assert_eq!(vars.get(READLINE_VAR), Some(&READLINE_VALUE.to_string()));
                assert_eq!(vars.len(), 1);
            }
            EnvPolicy::Inherit(_) => panic!("expected a clean environment"),
        }
    }

    #[test]
    fn foreign_scripts_keep_the_host_environment() {
        let root = Path::new("/srv/app");
        match debug_environment(Path::new("/home/user/other.pl"), root) {
            EnvPolicy::Inherit(vars) => {
                assert_eq!(vars.get(READLINE_VAR), Some(&READLINE_VALUE.to_string()));
            }
            EnvPolicy::Clean(_) => panic!("expected the inherited environment"),
        }
    }
}
