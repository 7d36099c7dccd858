use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use url::Url;

use crate::app_layout::{AppLayout, ajax_timeout_from_env, render_error_page};
use crate::cgi_env;
use crate::debugger::{DebuggerConfig, DebuggerSession};
use crate::error::ProcessError;
use crate::event_log;
use crate::registry::{CLOSE_GRACE, ScriptSession, SessionRegistry};
use crate::request::{Reply, Request};
use crate::resolver::{
    AJAX_FORBIDDEN_MESSAGE, Classification, Resolver, page_forbidden_message,
};
use crate::script_process::{
    EnvPolicy, InterpreterSpec, ProcessEvent, ProcessTag, run_blocking, spawn_streaming,
};

pub const NOT_FOUND_PREFIX: &str = "File not found:<br>";
pub const AJAX_EMPTY_OUTPUT_MESSAGE: &str = "AJAX script timed out or gave no output:";

/// Callbacks into the rendering surface. Implemented by the shell that
/// embeds the engine; the recording implementations in the tests stand in
/// for it.
pub trait SurfaceBridge {
    /// Incremental stdout chunk for a session with a declared output target.
    fn push_output(&self, target: &str, chunk: &str);
    /// Whole-view replacement at session completion.
    fn replace_page(&self, html: &str);
    /// Formatted debugger output for the dedicated display frame.
    fn push_debugger_html(&self, html: &str);
    /// Script errors raised in the separate error-display surface.
    fn raise_error_display(&self, text: &str);
    /// Resource the surface must hand to the operating system.
    fn open_externally(&self, path: &Path);
    /// The window-close control path was requested and every session has
    /// been shut down.
    fn close_window(&self);

    /// Labels the application configured for dialogs and context menus.
    fn dialog_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// Whether the surface wants a confirmation before the window closes.
    fn close_warning(&self) -> Option<CloseWarning> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseWarning {
    pub text: String,
    pub mode: CloseWarningMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseWarningMode {
    Sync,
    Async,
}

/// The orchestrator: classifies intercepted requests, serves or spawns, and
/// pumps the single event channel every process reports into.
///
/// All state mutation happens on the thread that calls into the router;
/// the process side only ever talks through the channel.
pub struct Router {
    resolver: Resolver,
    registry: SessionRegistry,
    bridge: Arc<dyn SurfaceBridge>,
    interpreter: Option<InterpreterSpec>,
    events_tx: mpsc::Sender<(ProcessTag, ProcessEvent)>,
    events_rx: mpsc::Receiver<(ProcessTag, ProcessEvent)>,
    remote_content: HashMap<String, bool>,
    start_page: Option<Url>,
    ajax_timeout: Option<Duration>,
    close_grace: Duration,
    debugger: Option<DebuggerSession>,
}

impl Router {
    pub fn new(
        resolver: Resolver,
        interpreter: Option<InterpreterSpec>,
        start_page: Option<Url>,
        bridge: Arc<dyn SurfaceBridge>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        Self {
            resolver,
            registry: SessionRegistry::new(),
            bridge,
            interpreter,
            events_tx,
            events_rx,
            remote_content: HashMap::new(),
            start_page,
            ajax_timeout: None,
            close_grace: CLOSE_GRACE,
            debugger: None,
        }
    }

    pub fn from_layout(layout: &AppLayout, bridge: Arc<dyn SurfaceBridge>) -> Self {
        let resolver = Resolver::new(layout.pseudo_host.clone(), layout.app_root.clone());
        let interpreter = layout.interpreter.clone().map(InterpreterSpec::perl);
        let start_page = layout.start_page_url();
        let mut router = Self::new(resolver, interpreter, start_page, bridge);
        router.ajax_timeout = ajax_timeout_from_env();
        router
    }

    pub fn set_ajax_timeout(&mut self, timeout: Option<Duration>) {
        self.ajax_timeout = timeout;
    }

    pub fn set_close_grace(&mut self, grace: Duration) {
        self.close_grace = grace;
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.registry.ids()
    }

    pub fn remote_content(&self, view: &str) -> bool {
        self.remote_content.get(view).copied().unwrap_or(false)
    }

    /// Tracks where a view navigated. Landing exactly on the start page
    /// unlocks local scripts again; landing anywhere off the pseudo-host
    /// locks them.
    pub fn observe_navigation(&mut self, view: &str, url: &Url) {
        if self.start_page.as_ref() == Some(url) {
            self.remote_content.insert(view.to_string(), false);
        } else if !self.resolver.is_local(url) {
            self.remote_content.insert(view.to_string(), true);
        }
    }

    pub fn handle_request(&mut self, view: &str, url: &Url, body: Option<Vec<u8>>) -> Reply {
        let request = Request::from_url(url, body);
        let remote = self.remote_content(view);
        let classification = self.resolver.classify(url, remote);
        event_log::log_lazy("request", || {
            json!({
                "view": view,
                "path": request.path,
                "method": request.method,
                "classification": classification_name(&classification),
            })
        });
        match classification {
            Classification::CloseWindow => self.handle_close_window(),
            Classification::ForbiddenAjax => {
                Reply::with_body("", AJAX_FORBIDDEN_MESSAGE.as_bytes().to_vec(), None)
            }
            Classification::ForbiddenPage => {
                let message = page_forbidden_message(&self.start_page_href());
                Reply::html(render_error_page(&message))
            }
            Classification::NotFound { path } => {
                Reply::html(render_error_page(&format!("{NOT_FOUND_PREFIX}{path}")))
            }
            Classification::StaticFile {
                mime,
                bytes,
                modified,
            } => Reply::with_body(mime, bytes, modified),
            Classification::OpenExternally { path } => {
                self.bridge.open_externally(&path);
                Reply::empty()
            }
            Classification::AjaxScript { script } => self.run_ajax(&script, &request),
            Classification::PageScript { script } => self.start_script_session(script, request),
            Classification::PassThrough => {
                self.remote_content.insert(view.to_string(), true);
                Reply::empty()
            }
        }
    }

    /// Writes one payload to a named live session. Unknown IDs are a no-op.
    pub fn feed_session(&mut self, id: &str, payload: Vec<u8>) -> bool {
        self.registry.feed(id, payload)
    }

    pub fn configure_debugger(&mut self, interpreter: PathBuf, formatter_script: PathBuf) {
        let config = DebuggerConfig {
            interpreter,
            formatter_script,
            app_root: self.resolver.app_root().to_path_buf(),
        };
        self.debugger = Some(DebuggerSession::new(config, self.events_tx.clone()));
    }

    pub fn select_debug_script(
        &mut self,
        script: &Path,
        command: &str,
        extra_args: &[String],
    ) -> Result<(), ProcessError> {
        match &mut self.debugger {
            Some(debugger) => debugger.select_script(script, command, extra_args),
            None => Err(ProcessError::Protocol("debugger is not configured".into())),
        }
    }

    /// Drains the event channel until it stays quiet for `idle`. Returns the
    /// number of events handled.
    pub fn pump_until_idle(&mut self, idle: Duration) -> usize {
        let mut handled = 0;
        loop {
            match self.events_rx.recv_timeout(idle) {
                Ok((tag, event)) => {
                    self.dispatch_event(tag, event);
                    handled += 1;
                }
                Err(_) => return handled,
            }
        }
    }

    /// Graceful end of every live process: debugger first, then the whole
    /// registry under one shared grace deadline.
    pub fn shutdown(&mut self) {
        if let Some(debugger) = self.debugger.as_mut() {
            debugger.shutdown();
        }
        self.registry.close_all(self.close_grace);
        // Events from the closed sessions may still sit in the channel;
        // their sessions are gone, so they fall through as no-ops.
        self.pump_until_idle(Duration::from_millis(50));
    }

    fn handle_close_window(&mut self) -> Reply {
        event_log::log_lazy("close_window", || {
            json!({
                "sessions": self.registry.ids(),
                "warning": self.bridge.close_warning(),
                "labels": self.bridge.dialog_labels(),
            })
        });
        self.shutdown();
        self.bridge.close_window();
        Reply::empty()
    }

    fn run_ajax(&mut self, script: &Path, request: &Request) -> Reply {
        let Some(interpreter) = &self.interpreter else {
            self.log_missing_interpreter(script);
            return Reply::empty();
        };
        let env = cgi_env::build(&request.query, request.body.as_deref());
        let spec = interpreter.spec(script, env, None);
        match run_blocking(&spec, request.body.as_deref(), self.ajax_timeout) {
            Ok(output) => {
                for line in output.stderr.split(|&byte| byte == b'\n') {
                    if line.is_empty() {
                        continue;
                    }
                    event_log::log_lazy("script_stderr", || {
                        json!({
                            "script": script.to_string_lossy().to_string(),
                            "text": String::from_utf8_lossy(line).to_string(),
                        })
                    });
                }
                if output.stdout.is_empty() && output.stderr.is_empty() {
                    event_log::log(
                        "ajax_empty_output",
                        json!({
                            "message": format!(
                                "{AJAX_EMPTY_OUTPUT_MESSAGE} {}",
                                script.display()
                            ),
                        }),
                    );
                }
                Reply::with_body("", output.stdout, None)
            }
            Err(err) => {
                event_log::log(
                    "ajax_failed",
                    json!({
                        "script": script.to_string_lossy().to_string(),
                        "error": err.to_string(),
                    }),
                );
                Reply::empty()
            }
        }
    }

    /// Starts a streaming run under the caller-supplied session ID, or feeds
    /// the body to the session already running under that ID.
    fn start_script_session(&mut self, script: PathBuf, request: Request) -> Reply {
        let session_id = request
            .session
            .clone()
            .unwrap_or_else(|| synthesize_session_id(&script));
        if self.registry.contains(&session_id) {
            if let Some(body) = request.body
                && !body.is_empty()
            {
                self.registry.feed(&session_id, body);
            }
            return Reply::empty();
        }
        let Some(interpreter) = &self.interpreter else {
            self.log_missing_interpreter(&script);
            return Reply::empty();
        };
        let env = cgi_env::build(&request.query, request.body.as_deref());
        let spec = interpreter.spec(&script, env, None);
        match spawn_streaming(
            &spec,
            request.body.as_deref(),
            ProcessTag::Page(session_id.clone()),
            self.events_tx.clone(),
        ) {
            Ok(handle) => {
                event_log::log(
                    "session_started",
                    json!({
                        "session": session_id,
                        "script": script.to_string_lossy().to_string(),
                        "pid": handle.pid(),
                        "target": request.target,
                    }),
                );
                self.registry.insert(
                    session_id,
                    ScriptSession::new(script, request.target, handle),
                );
                Reply::empty()
            }
            Err(err) => {
                event_log::log(
                    "session_spawn_failed",
                    json!({
                        "session": session_id,
                        "script": script.to_string_lossy().to_string(),
                        "error": err.to_string(),
                    }),
                );
                Reply::empty()
            }
        }
    }

    fn dispatch_event(&mut self, tag: ProcessTag, event: ProcessEvent) {
        match tag {
            ProcessTag::Page(session_id) => self.dispatch_session_event(&session_id, event),
            ProcessTag::Debugger => {
                if let Some(debugger) = self.debugger.as_mut() {
                    debugger.handle_debugger_event(event);
                }
            }
            ProcessTag::Formatter => {
                if let Some(debugger) = self.debugger.as_mut() {
                    debugger.handle_formatter_event(event, &*self.bridge);
                }
            }
            // Blocking runs collect their events over a private channel.
            ProcessTag::Blocking => {}
        }
    }

    fn dispatch_session_event(&mut self, session_id: &str, event: ProcessEvent) {
        match event {
            ProcessEvent::Stdout(chunk) => {
                let Some(session) = self.registry.get_mut(session_id) else {
                    return;
                };
                match &session.target {
                    Some(target) => {
                        self.bridge
                            .push_output(target, &String::from_utf8_lossy(&chunk));
                    }
                    None => session.stdout.extend_from_slice(&chunk),
                }
            }
            ProcessEvent::Stderr(chunk) => {
                if let Some(session) = self.registry.get_mut(session_id) {
                    session.stderr.extend_from_slice(&chunk);
                }
            }
            ProcessEvent::Finished(info) => {
                let Some(session) = self.registry.remove(session_id) else {
                    return;
                };
                event_log::log(
                    "session_finished",
                    json!({
                        "session": session_id,
                        "code": info.code,
                        "success": info.success,
                    }),
                );
                if session.close_requested {
                    return;
                }
                self.apply_completion_policy(&session);
            }
        }
    }

    /// Exactly one branch fires, in this order. A session that streamed all
    /// of its output to a target and produced no errors needs nothing here.
    fn apply_completion_policy(&self, session: &ScriptSession) {
        let has_out = !session.stdout.is_empty();
        let has_err = !session.stderr.is_empty();
        if has_out && !has_err && session.target.is_none() {
            self.bridge
                .replace_page(&String::from_utf8_lossy(&session.stdout));
        } else if has_err && !has_out && session.target.is_none() {
            self.bridge
                .replace_page(&String::from_utf8_lossy(&session.stderr));
        } else if has_err && !has_out {
            self.bridge
                .raise_error_display(&String::from_utf8_lossy(&session.stderr));
        } else if has_out && has_err {
            self.bridge
                .raise_error_display(&String::from_utf8_lossy(&session.stderr));
        }
    }

    fn start_page_href(&self) -> String {
        match &self.start_page {
            Some(url) => url.to_string(),
            None => format!("http://{}/", self.resolver.pseudo_host()),
        }
    }

    fn log_missing_interpreter(&self, script: &Path) {
        event_log::log(
            "interpreter_missing",
            json!({ "script": script.to_string_lossy().to_string() }),
        );
    }
}

fn synthesize_session_id(script: &Path) -> String {
    format!("script:{}", script.display())
}

fn classification_name(classification: &Classification) -> &'static str {
    match classification {
        Classification::CloseWindow => "close_window",
        Classification::ForbiddenAjax => "forbidden_ajax",
        Classification::ForbiddenPage => "forbidden_page",
        Classification::AjaxScript { .. } => "ajax_script",
        Classification::PageScript { .. } => "page_script",
        Classification::StaticFile { .. } => "static_file",
        Classification::OpenExternally { .. } => "open_externally",
        Classification::NotFound { .. } => "not_found",
        Classification::PassThrough => "pass_through",
    }
}
