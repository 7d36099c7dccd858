use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use memchr::memmem;
use url::Url;

pub const DEFAULT_PSEUDO_HOST: &str = "local-pseudodomain";
pub const CLOSE_WINDOW_FILE: &str = "close-window.function";
pub const SCRIPT_MIME: &str = "application/x-perl";

pub const AJAX_FORBIDDEN_MESSAGE: &str = "Calling local Perl scripts after web content \
     is loaded is prohibited. Go to start page to unlock local Perl scripts.";

pub fn page_forbidden_message(start_page: &str) -> String {
    format!(
        "Calling local Perl scripts after web content is loaded is prohibited.<br>\
         Go to <a href='{start_page}'>start page</a> to unlock local Perl scripts."
    )
}

/// What the router should do with one intercepted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    CloseWindow,
    /// Ajax call refused after web content was loaded. The reply body is the
    /// raw refusal message, no template.
    ForbiddenAjax,
    /// Page script refused after web content was loaded. Rendered through
    /// the error template with a link back to the start page.
    ForbiddenPage,
    AjaxScript {
        script: PathBuf,
    },
    PageScript {
        script: PathBuf,
    },
    StaticFile {
        mime: &'static str,
        bytes: Vec<u8>,
        modified: Option<SystemTime>,
    },
    OpenExternally {
        path: PathBuf,
    },
    NotFound {
        path: String,
    },
    /// Host differs from the reserved pseudo-host; the surface fetches it
    /// from the real network.
    PassThrough,
}

/// Maps request URLs on the reserved pseudo-host onto local resources.
#[derive(Debug, Clone)]
pub struct Resolver {
    pseudo_host: String,
    app_root: PathBuf,
}

impl Resolver {
    pub fn new(pseudo_host: impl Into<String>, app_root: impl Into<PathBuf>) -> Self {
        Self {
            pseudo_host: pseudo_host.into(),
            app_root: app_root.into(),
        }
    }

    pub fn pseudo_host(&self) -> &str {
        &self.pseudo_host
    }

    pub fn app_root(&self) -> &Path {
        &self.app_root
    }

    pub fn is_local(&self, url: &Url) -> bool {
        url.host_str() == Some(self.pseudo_host.as_str())
    }

    pub fn classify(&self, url: &Url, remote_content_loaded: bool) -> Classification {
        if !self.is_local(url) {
            return Classification::PassThrough;
        }
        let path = url.path();
        if last_segment(path) == CLOSE_WINDOW_FILE {
            return Classification::CloseWindow;
        }
        let resolved = match self.resolve_path(path) {
            Some(resolved) => resolved,
            None => {
                return Classification::NotFound {
                    path: lossy_join(&self.app_root, path),
                };
            }
        };
        if has_ajax_marker(path) {
            if remote_content_loaded {
                return Classification::ForbiddenAjax;
            }
            return Classification::AjaxScript { script: resolved };
        }
        if !resolved.is_file() {
            return Classification::NotFound {
                path: resolved.display().to_string(),
            };
        }
        let mime = match mime_for_path(&resolved) {
            Some(mime) => mime,
            None => return Classification::OpenExternally { path: resolved },
        };
        if mime == SCRIPT_MIME {
            if remote_content_loaded {
                return Classification::ForbiddenPage;
            }
            return Classification::PageScript { script: resolved };
        }
        if !is_embeddable(mime) {
            return Classification::OpenExternally { path: resolved };
        }
        match std::fs::read(&resolved) {
            Ok(bytes) => {
                let modified = std::fs::metadata(&resolved)
                    .and_then(|meta| meta.modified())
                    .ok();
                Classification::StaticFile {
                    mime,
                    bytes,
                    modified,
                }
            }
            Err(_) => Classification::NotFound {
                path: resolved.display().to_string(),
            },
        }
    }

    /// Joins the URL path onto the application root. Rejects any path that
    /// would escape the root via parent components.
    fn resolve_path(&self, url_path: &str) -> Option<PathBuf> {
        let decoded = percent_decode(url_path);
        let relative = decoded.trim_start_matches('/');
        let candidate = Path::new(relative);
        for component in candidate.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => return None,
            }
        }
        Some(self.app_root.join(candidate))
    }
}

fn last_segment(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn has_ajax_marker(path: &str) -> bool {
    let lowered = path.to_ascii_lowercase();
    memmem::find(lowered.as_bytes(), b"ajax").is_some()
}

fn lossy_join(root: &Path, url_path: &str) -> String {
    format!(
        "{}{}{}",
        root.display(),
        std::path::MAIN_SEPARATOR,
        url_path.trim_start_matches('/')
    )
}

fn percent_decode(path: &str) -> String {
    let bytes = path.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == b'%' && index + 2 < bytes.len() {
            let pair = &path[index + 1..index + 3];
            if let Ok(value) = u8::from_str_radix(pair, 16) {
                out.push(value);
                index += 3;
                continue;
            }
        }
        out.push(bytes[index]);
        index += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn mime_for_path(path: &Path) -> Option<&'static str> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    mime_for_extension(&extension)
}

fn mime_for_extension(extension: &str) -> Option<&'static str> {
    let mime = match extension {
        "pl" => SCRIPT_MIME,
        "htm" | "html" => "text/html",
        "xml" => "text/xml",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "gif" => "image/gif",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "svg" => "image/svg+xml",
        "eot" => "application/vnd.ms-fontobject",
        "ttf" => "application/x-font-ttf",
        "sfnt" => "application/font-sfnt",
        "woff" => "application/font-woff",
        "woff2" => "application/font-woff2",
        _ => return None,
    };
    Some(mime)
}

/// Resources the rendering surface may embed directly. Anything else is
/// handed to the operating system instead.
fn is_embeddable(mime: &str) -> bool {
    matches!(
        mime,
        "text/html"
            | "text/xml"
            | "text/css"
            | "application/javascript"
            | "application/json"
            | "image/gif"
            | "image/jpeg"
            | "image/png"
            | "image/svg+xml"
            | "application/vnd.ms-fontobject"
            | "application/x-font-ttf"
            | "application/font-sfnt"
    ) || mime.contains("application/font-woff")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(input: &str) -> Url {
        Url::parse(input).expect("parse url")
    }

    fn resolver_with_root() -> (Resolver, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let resolver = Resolver::new(DEFAULT_PSEUDO_HOST, dir.path());
        (resolver, dir)
    }

    #[test]
    fn foreign_hosts_pass_through() {
        let (resolver, _dir) = resolver_with_root();
        let classification = resolver.classify(&url("https://example.com/page.html"), false);
        assert_eq!(classification, Classification::PassThrough);
    }

    #[test]
    fn close_window_control_path_needs_no_file() {
        let (resolver, _dir) = resolver_with_root();
        let classification = resolver.classify(
            &url("http://local-pseudodomain/ui/close-window.function"),
            false,
        );
        assert_eq!(classification, Classification::CloseWindow);
    }

    #[test]
    fn ajax_marker_is_case_insensitive() {
        let (resolver, _dir) = resolver_with_root();
        for path in [
            "http://local-pseudodomain/scripts/Ajax_list.pl",
            "http://local-pseudodomain/AJAX/list.pl",
        ] {
            match resolver.classify(&url(path), false) {
                Classification::AjaxScript { .. } => {}
                other => panic!("expected ajax classification, got {other:?}"),
            }
        }
    }

    #[test]
    fn ajax_after_remote_content_is_refused_without_file_access() {
        let (resolver, _dir) = resolver_with_root();
        let classification =
            resolver.classify(&url("http://local-pseudodomain/ajax/list.pl"), true);
        assert_eq!(classification, Classification::ForbiddenAjax);
    }

    #[test]
    fn page_script_after_remote_content_is_refused() {
        let (resolver, dir) = resolver_with_root();
        std::fs::write(dir.path().join("run.pl"), "print 1;").expect("write script");
        let classification = resolver.classify(&url("http://local-pseudodomain/run.pl"), true);
        assert_eq!(classification, Classification::ForbiddenPage);
    }

    #[test]
    fn existing_perl_file_is_a_page_script() {
        let (resolver, dir) = resolver_with_root();
        let script = dir.path().join("run.pl");
        std::fs::write(&script, "print 1;").expect("write script");
        let classification = resolver.classify(&url("http://local-pseudodomain/run.pl"), false);
        assert_eq!(classification, Classification::PageScript { script });
    }

    #[test]
    fn static_file_carries_mime_and_bytes() {
        let (resolver, dir) = resolver_with_root();
        std::fs::write(dir.path().join("index.html"), b"<p>hi</p>").expect("write page");
        match resolver.classify(&url("http://local-pseudodomain/index.html"), false) {
            Classification::StaticFile {
                mime,
                bytes,
                modified,
            } => {
                assert_eq!(mime, "text/html");
                assert_eq!(bytes, b"<p>hi</p>");
                assert!(modified.is_some());
            }
            other => panic!("expected static file, got {other:?}"),
        }
    }

    #[test]
    fn unknown_extension_opens_externally() {
        let (resolver, dir) = resolver_with_root();
        let path = dir.path().join("report.pdf");
        std::fs::write(&path, b"%PDF").expect("write file");
        let classification = resolver.classify(&url("http://local-pseudodomain/report.pdf"), false);
        assert_eq!(classification, Classification::OpenExternally { path });
    }

    #[test]
    fn missing_file_reports_the_resolved_path() {
        let (resolver, dir) = resolver_with_root();
        match resolver.classify(&url("http://local-pseudodomain/missing.html"), false) {
            Classification::NotFound { path } => {
                assert!(path.contains("missing.html"));
                assert!(path.starts_with(&dir.path().display().to_string()));
            }
            other => panic!("expected not found, got {other:?}"),
        }
    }

    #[test]
    fn parent_traversal_is_refused() {
        let (resolver, _dir) = resolver_with_root();
        match resolver.classify(&url("http://local-pseudodomain/../etc/passwd"), false) {
            Classification::NotFound { .. } => {}
            other => panic!("expected not found, got {other:?}"),
        }
    }

    #[test]
    fn percent_encoded_segments_resolve() {
        let (resolver, dir) = resolver_with_root();
        std::fs::write(dir.path().join("two words.html"), b"ok").expect("write page");
        match resolver.classify(&url("http://local-pseudodomain/two%20words.html"), false) {
            Classification::StaticFile { mime, .. } => assert_eq!(mime, "text/html"),
            other => panic!("expected static file, got {other:?}"),
        }
    }

    #[test]
    fn classification_is_stable_without_state_changes() {
        let (resolver, dir) = resolver_with_root();
        std::fs::write(dir.path().join("index.html"), b"x").expect("write page");
        let request = url("http://local-pseudodomain/index.html");
        let first = resolver.classify(&request, false);
        let second = resolver.classify(&request, false);
        assert_eq!(first, second);
    }

    #[test]
    fn woff_variants_pass_the_embed_check() {
        assert!(is_embeddable("application/font-woff"));
        assert!(is_embeddable("application/font-woff2"));
        assert!(!is_embeddable("application/pdf"));
    }

    #[test]
    fn page_forbidden_message_links_the_start_page() {
        let message = page_forbidden_message("http://local-pseudodomain/index.html");
        assert!(message.contains("<a href='http://local-pseudodomain/index.html'>"));
        assert!(message.contains("prohibited"));
    }
}
