use std::path::{Path, PathBuf};
use std::time::Duration;

use url::Url;

use crate::resolver::DEFAULT_PSEUDO_HOST;

pub const ROOT_ENV: &str = "SCRIPTHOST_ROOT";
pub const PSEUDO_HOST_ENV: &str = "SCRIPTHOST_PSEUDO_HOST";
pub const INTERPRETER_ENV: &str = "SCRIPTHOST_INTERPRETER";
pub const AJAX_TIMEOUT_ENV: &str = "SCRIPTHOST_AJAX_TIMEOUT_MS";

const APP_ROOT_RELATIVE: &str = "resources/app";
const PRIVATE_INTERPRETER_RELATIVE: &str = "perl/bin/perl";
const START_PAGE_FILE: &str = "index.html";
const START_PAGE_SCRIPT: &str = "index.pl";

const ERROR_MESSAGE_PLACEHOLDER: &str = "ERROR_MESSAGE";
const ERROR_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>Error</title>
<style>
body { font-family: sans-serif; margin: 3em; color: #333; }
.box { border: 1px solid #c00; background: #fff4f4; padding: 1.5em 2em; }
</style>
</head>
<body>
<div class="box">ERROR_MESSAGE</div>
</body>
</html>
"#;

pub fn render_error_page(message: &str) -> String {
    ERROR_TEMPLATE.replace(ERROR_MESSAGE_PLACEHOLDER, message)
}

/// Where the application lives on disk and how its scripts are run.
/// Discovered once at startup; explicit overrides beat the environment,
/// which beats the install-relative defaults.
#[derive(Debug, Clone)]
pub struct AppLayout {
    pub app_root: PathBuf,
    pub pseudo_host: String,
    pub interpreter: Option<PathBuf>,
}

/// What the shell should show first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartPage {
    File(PathBuf),
    Script(PathBuf),
    Missing,
}

impl AppLayout {
    pub fn discover(
        root_override: Option<PathBuf>,
        host_override: Option<String>,
        interpreter_override: Option<PathBuf>,
    ) -> Self {
        let app_root = root_override
            .or_else(|| env_path(ROOT_ENV))
            .unwrap_or_else(default_app_root);
        let pseudo_host = host_override
            .or_else(|| env_string(PSEUDO_HOST_ENV))
            .unwrap_or_else(|| DEFAULT_PSEUDO_HOST.to_string());
        let interpreter = discover_interpreter(interpreter_override);
        Self {
            app_root,
            pseudo_host,
            interpreter,
        }
    }

    pub fn start_page(&self) -> StartPage {
        let file = self.app_root.join(START_PAGE_FILE);
        if file.is_file() {
            return StartPage::File(file);
        }
        let script = self.app_root.join(START_PAGE_SCRIPT);
        if script.is_file() {
            return StartPage::Script(script);
        }
        StartPage::Missing
    }

    /// The URL the shell opens first. A missing start page still yields a
    /// stable URL so the forbidden-message link has somewhere to point.
    pub fn start_page_url(&self) -> Option<Url> {
        let name = match self.start_page() {
            StartPage::File(_) => START_PAGE_FILE,
            StartPage::Script(_) => START_PAGE_SCRIPT,
            StartPage::Missing => START_PAGE_FILE,
        };
        Url::parse(&format!("http://{}/{}", self.pseudo_host, name)).ok()
    }
}

fn default_app_root() -> PathBuf {
    match exe_dir() {
        Some(dir) => dir.join(APP_ROOT_RELATIVE),
        None => PathBuf::from(APP_ROOT_RELATIVE),
    }
}

/// A private interpreter shipped beside the executable wins; otherwise the
/// first `perl` on PATH. Missing interpreter is reported by the caller, not
/// a crash here.
pub fn discover_interpreter(interpreter_override: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(path) = interpreter_override.or_else(|| env_path(INTERPRETER_ENV)) {
        return Some(path);
    }
    if let Some(dir) = exe_dir() {
        let private = dir.join(PRIVATE_INTERPRETER_RELATIVE);
        if private.is_file() {
            return Some(private);
        }
    }
    find_on_path("perl")
}

pub fn ajax_timeout_from_env() -> Option<Duration> {
    let raw = std::env::var(AJAX_TIMEOUT_ENV).ok()?;
    let millis: u64 = raw.trim().parse().ok()?;
    (millis > 0).then(|| Duration::from_millis(millis))
}

fn exe_dir() -> Option<PathBuf> {
    std::env::current_exe()
        .ok()?
        .parent()
        .map(Path::to_path_buf)
}

fn find_on_path(program: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(program);
        if candidate.is_file() {
            return Some(candidate);
        }
        #[cfg(windows)]
        {
            let with_exe = dir.join(format!("{program}.exe"));
            if with_exe.is_file() {
                return Some(with_exe);
            }
        }
    }
    None
}

fn env_path(var: &str) -> Option<PathBuf> {
    std::env::var_os(var)
        .filter(|raw| !raw.is_empty())
        .map(PathBuf::from)
}

fn env_string(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout_with_root(root: &Path) -> AppLayout {
        AppLayout {
            app_root: root.to_path_buf(),
            pseudo_host: DEFAULT_PSEUDO_HOST.to_string(),
            interpreter: None,
        }
    }

    #[test]
    fn error_page_substitutes_the_message() {
        let page = render_error_page("File not found:<br>/tmp/x");
        assert!(page.contains("File not found:<br>/tmp/x"));
        assert!(!page.contains(ERROR_MESSAGE_PLACEHOLDER));
    }

    #[test]
    fn html_start_page_wins_over_script() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join(START_PAGE_FILE), "<p>hi</p>").expect("write html");
        std::fs::write(dir.path().join(START_PAGE_SCRIPT), "print 1;").expect("write script");
        let layout = layout_with_root(dir.path());
        assert_eq!(
            layout.start_page(),
            StartPage::File(dir.path().join(START_PAGE_FILE))
        );
    }

    #[test]
    fn script_start_page_is_the_fallback() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join(START_PAGE_SCRIPT), "print 1;").expect("write script");
        let layout = layout_with_root(dir.path());
        assert_eq!(
            layout.start_page(),
            StartPage::Script(dir.path().join(START_PAGE_SCRIPT))
        );
    }

    #[test]
    fn empty_root_has_no_start_page_but_a_stable_url() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = layout_with_root(dir.path());
        assert_eq!(layout.start_page(), StartPage::Missing);
        let url = layout.start_page_url().expect("url");
        assert_eq!(url.as_str(), "http://local-pseudodomain/index.html");
    }

    #[test]
    fn explicit_interpreter_override_wins() {
        let chosen = discover_interpreter(Some(PathBuf::from("/opt/perl/bin/perl")));
        assert_eq!(chosen, Some(PathBuf::from("/opt/perl/bin/perl")));
    }
}
