use std::collections::BTreeMap;

pub const REQUEST_METHOD_VAR: &str = "REQUEST_METHOD";
pub const QUERY_STRING_VAR: &str = "QUERY_STRING";
pub const CONTENT_LENGTH_VAR: &str = "CONTENT_LENGTH";

/// Synthesizes the CGI variables for one script invocation.
///
/// A non-empty query string marks the request as GET and is passed through
/// raw. A non-empty body marks it as POST and sets the byte count; when both
/// are present the POST method wins because it is written last.
pub fn build(query: &str, body: Option<&[u8]>) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    if !query.is_empty() {
        env.insert(REQUEST_METHOD_VAR.to_string(), "GET".to_string());
        env.insert(QUERY_STRING_VAR.to_string(), query.to_string());
    }
    if let Some(body) = body
        && !body.is_empty()
    {
        env.insert(REQUEST_METHOD_VAR.to_string(), "POST".to_string());
        env.insert(CONTENT_LENGTH_VAR.to_string(), body.len().to_string());
    }
    env
}
