use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use url::Url;

pub const TARGET_PARAM: &str = "target";
pub const SESSION_PARAM: &str = "session";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Get,
    Post,
}

/// One intercepted navigation or network event, decoded from its URL.
///
/// The output-target and session parameters are stripped out of the query
/// string here so spawned scripts never see them.
#[derive(Debug, Clone)]
pub struct Request {
    pub path: String,
    pub query: String,
    pub method: Method,
    pub body: Option<Vec<u8>>,
    pub target: Option<String>,
    pub session: Option<String>,
}

impl Request {
    pub fn from_url(url: &Url, body: Option<Vec<u8>>) -> Self {
        let raw_query = url.query().unwrap_or("");
        let (query, target, session) = strip_routing_params(raw_query);
        let method = match &body {
            Some(bytes) if !bytes.is_empty() => Method::Post,
            _ => Method::Get,
        };
        Self {
            path: url.path().to_string(),
            query,
            method,
            body,
            target,
            session,
        }
    }
}

/// Removes `target=` and `session=` pairs from a raw query string, keeping
/// the remaining pairs in their original order and encoding.
fn strip_routing_params(raw: &str) -> (String, Option<String>, Option<String>) {
    let mut kept: Vec<&str> = Vec::new();
    let mut target = None;
    let mut session = None;
    for pair in raw.split('&') {
        if pair.is_empty() {
            continue;
        }
        if let Some(value) = pair.strip_prefix("target=") {
            target = Some(value.to_string());
            continue;
        }
        if let Some(value) = pair.strip_prefix("session=") {
            session = Some(value.to_string());
            continue;
        }
        kept.push(pair);
    }
    (
        kept.join("&"),
        target.filter(|value| !value.is_empty()),
        session.filter(|value| !value.is_empty()),
    )
}

/// In-memory reply handed back to the rendering surface. Local resources
/// never touch real network I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: u16,
    pub mime: String,
    pub body: Vec<u8>,
    pub content_length: Option<u64>,
    pub last_modified: Option<SystemTime>,
}

impl Reply {
    pub fn with_body(mime: &str, body: Vec<u8>, last_modified: Option<SystemTime>) -> Self {
        let content_length = Some(body.len() as u64);
        Self {
            status: 200,
            mime: mime.to_string(),
            body,
            content_length,
            last_modified: Some(last_modified.unwrap_or_else(SystemTime::now)),
        }
    }

    pub fn empty() -> Self {
        Self {
            status: 204,
            mime: String::new(),
            body: Vec::new(),
            content_length: None,
            last_modified: None,
        }
    }

    pub fn html(body: String) -> Self {
        Self::with_body("text/html", body.into_bytes(), None)
    }
}
