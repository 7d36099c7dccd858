#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tempfile::TempDir;
use url::Url;

use scripthost::resolver::Resolver;
use scripthost::router::{Router, SurfaceBridge};
use scripthost::script_process::InterpreterSpec;

pub type TestResult = Result<(), Box<dyn std::error::Error>>;

pub const TEST_HOST: &str = "local-pseudodomain";
pub const TEST_VIEW: &str = "view";
pub const PUMP_TIMEOUT: Duration = Duration::from_secs(10);

const PUMP_SLICE: Duration = Duration::from_millis(50);

/// Bridge that records every surface callback as a prefixed string, so
/// tests can assert on both content and ordering.
#[derive(Debug, Default)]
pub struct RecordingBridge {
    calls: Mutex<Vec<String>>,
}

impl RecordingBridge {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("bridge mutex").clone()
    }

    pub fn streamed_to(&self, target: &str) -> String {
        let prefix = format!("push:{target}:");
        self.calls()
            .iter()
            .filter_map(|call| call.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }

    pub fn page_replacements(&self) -> Vec<String> {
        self.collect_with_prefix("page:")
    }

    pub fn errors_raised(&self) -> Vec<String> {
        self.collect_with_prefix("error:")
    }

    pub fn debugger_frames(&self) -> Vec<String> {
        self.collect_with_prefix("debug:")
    }

    pub fn closed(&self) -> bool {
        self.calls().iter().any(|call| call == "close")
    }

    fn collect_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .iter()
            .filter_map(|call| call.strip_prefix(prefix).map(str::to_string))
            .collect()
    }

    fn record(&self, entry: String) {
        self.calls.lock().expect("bridge mutex").push(entry);
    }
}

impl SurfaceBridge for RecordingBridge {
    fn push_output(&self, target: &str, chunk: &str) {
        self.record(format!("push:{target}:{chunk}"));
    }

    fn replace_page(&self, html: &str) {
        self.record(format!("page:{html}"));
    }

    fn push_debugger_html(&self, html: &str) {
        self.record(format!("debug:{html}"));
    }

    fn raise_error_display(&self, text: &str) {
        self.record(format!("error:{text}"));
    }

    fn open_externally(&self, path: &Path) {
        self.record(format!("open:{}", path.display()));
    }

    fn close_window(&self) {
        self.record("close".to_string());
    }
}

/// Interpreter stand-in with the same two-stage shape as the real one: the
/// shell runs a wrapper which sources the target script, with the CGI
/// variables visible in its environment.
pub fn sh_interpreter() -> InterpreterSpec {
    InterpreterSpec {
        program: PathBuf::from("/bin/sh"),
        eval_flag: "-c".to_string(),
        wrapper: r#". "$0""#.to_string(),
        separator: None,
    }
}

/// One application root on disk plus a router wired to a recording bridge.
pub struct TestApp {
    pub root: TempDir,
    pub bridge: Arc<RecordingBridge>,
    pub router: Router,
}

impl TestApp {
    pub fn new() -> Self {
        let root = tempfile::tempdir().expect("create app root");
        let bridge = Arc::new(RecordingBridge::default());
        let resolver = Resolver::new(TEST_HOST, root.path());
        let start_page =
            Url::parse(&format!("http://{TEST_HOST}/index.html")).expect("start page url");
        let router = Router::new(
            resolver,
            Some(sh_interpreter()),
            Some(start_page),
            bridge.clone(),
        );
        Self {
            root,
            bridge,
            router,
        }
    }

    pub fn write_file(&self, relative: &str, content: &str) -> PathBuf {
        let path = self.root.path().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create parent dirs");
        }
        std::fs::write(&path, content).expect("write app file");
        path
    }

    pub fn write_script(&self, relative: &str, content: &str) -> PathBuf {
        self.write_file(relative, content)
    }

    pub fn url(&self, path_and_query: &str) -> Url {
        Url::parse(&format!("http://{TEST_HOST}{path_and_query}")).expect("request url")
    }

    pub fn get(&mut self, path_and_query: &str) -> scripthost::Reply {
        let url = self.url(path_and_query);
        self.router.handle_request(TEST_VIEW, &url, None)
    }

    pub fn post(&mut self, path_and_query: &str, body: &[u8]) -> scripthost::Reply {
        let url = self.url(path_and_query);
        self.router
            .handle_request(TEST_VIEW, &url, Some(body.to_vec()))
    }

    pub fn visit_remote(&mut self) {
        let url = Url::parse("https://example.com/page").expect("remote url");
        self.router.observe_navigation(TEST_VIEW, &url);
    }

    pub fn return_to_start_page(&mut self) {
        let url = self.url("/index.html");
        self.router.observe_navigation(TEST_VIEW, &url);
    }

    /// Pumps events until the predicate holds or the shared timeout passes.
    pub fn pump_until(&mut self, predicate: impl Fn(&RecordingBridge) -> bool) -> bool {
        let deadline = Instant::now() + PUMP_TIMEOUT;
        loop {
            if predicate(&self.bridge) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            self.router.pump_until_idle(PUMP_SLICE);
        }
    }

    pub fn pump_until_session_done(&mut self, id: &str) -> bool {
        let deadline = Instant::now() + PUMP_TIMEOUT;
        loop {
            if !self.router.session_ids().iter().any(|session| session == id) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            self.router.pump_until_idle(PUMP_SLICE);
        }
    }
}

/// Writes a script and marks it executable, for processes started directly
/// rather than through the interpreter wrapper.
#[cfg(target_family = "unix")]
pub fn write_executable(dir: &Path, name: &str, content: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, content).expect("write executable");
    let mut permissions = std::fs::metadata(&path)
        .expect("stat executable")
        .permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(&path, permissions).expect("chmod executable");
    path
}
