use std::io::{self, BufRead, Write};
use std::path::Path;
use std::time::Duration;

use serde_json::json;
use url::Url;

use crate::error::ProcessError;
use crate::request::Reply;
use crate::router::{Router, SurfaceBridge};

const PUMP_IDLE: Duration = Duration::from_millis(200);
const CONSOLE_VIEW: &str = "console";

/// Bridge implementation for terminal use: routed output becomes annotated
/// lines, errors go to stderr.
pub struct ConsoleBridge;

impl SurfaceBridge for ConsoleBridge {
    fn push_output(&self, target: &str, chunk: &str) {
        println!("[{target}] {chunk}");
    }

    fn replace_page(&self, html: &str) {
        println!("[page] {html}");
    }

    fn push_debugger_html(&self, html: &str) {
        println!("[debugger] {html}");
    }

    fn raise_error_display(&self, text: &str) {
        eprintln!("[error] {text}");
    }

    fn open_externally(&self, path: &Path) {
        println!("[open] {}", path.display());
    }

    fn close_window(&self) {
        println!("[close-window]");
    }
}

/// Line-oriented front-end for exercising the engine without a rendering
/// surface. One request per line; replies are printed as JSONL.
pub fn run(mut router: Router) -> Result<(), Box<dyn std::error::Error>> {
    eprintln!(
        "console: GET <url> | POST <url> (body lines, end with END) | \
         FEED <session> <line> | DEBUG <script> [command] | CLOSE | Ctrl-D to exit"
    );

    let stdin = io::stdin();
    let mut stdin = stdin.lock();
    let mut stdout = io::stdout();

    loop {
        let Some(line) = read_line(&mut stdin)? else {
            break;
        };
        let (command, rest) = split_command(&line);
        match command {
            "" => {}
            "GET" => handle_get(&mut router, rest, &mut stdout)?,
            "POST" => handle_post(&mut router, rest, &mut stdin, &mut stdout)?,
            "FEED" => handle_feed(&mut router, rest, &mut stdout)?,
            "DEBUG" => handle_debug(&mut router, rest),
            "CLOSE" => handle_close(&mut router, &mut stdout)?,
            other => eprintln!("unknown command: {other}"),
        }
        router.pump_until_idle(PUMP_IDLE);
    }

    router.shutdown();
    Ok(())
}

fn handle_get(
    router: &mut Router,
    rest: &str,
    stdout: &mut impl Write,
) -> Result<(), Box<dyn std::error::Error>> {
    let Some(url) = parse_url(rest) else {
        return Ok(());
    };
    router.observe_navigation(CONSOLE_VIEW, &url);
    let reply = router.handle_request(CONSOLE_VIEW, &url, None);
    print_reply(stdout, &reply)
}

fn handle_post(
    router: &mut Router,
    rest: &str,
    stdin: &mut impl BufRead,
    stdout: &mut impl Write,
) -> Result<(), Box<dyn std::error::Error>> {
    let Some(url) = parse_url(rest) else {
        return Ok(());
    };
    let mut body = String::new();
    loop {
        let Some(line) = read_line(stdin)? else {
            return Err("EOF reached while reading the body; expected END".into());
        };
        if is_exact_command(&line, "END") {
            break;
        }
        body.push_str(&line);
    }
    let reply = router.handle_request(CONSOLE_VIEW, &url, Some(body.into_bytes()));
    print_reply(stdout, &reply)
}

fn handle_feed(
    router: &mut Router,
    rest: &str,
    stdout: &mut impl Write,
) -> Result<(), Box<dyn std::error::Error>> {
    let (session, payload) = split_command(rest);
    if session.is_empty() {
        eprintln!("FEED needs a session id");
        return Ok(());
    }
    let mut bytes = payload.as_bytes().to_vec();
    bytes.push(b'\n');
    let delivered = router.feed_session(session, bytes);
    writeln!(stdout, "{}", json!({ "fed": session, "delivered": delivered }))?;
    stdout.flush()?;
    Ok(())
}

fn handle_debug(router: &mut Router, rest: &str) {
    let (script, command) = split_command(rest);
    if script.is_empty() {
        eprintln!("DEBUG needs a script path");
        return;
    }
    if let Err(err) = router.select_debug_script(Path::new(script), command, &[]) {
        report_debug_error(&err);
    }
}

fn report_debug_error(err: &ProcessError) {
    eprintln!("debug: {err}");
}

fn handle_close(
    router: &mut Router,
    stdout: &mut impl Write,
) -> Result<(), Box<dyn std::error::Error>> {
    let host = router.resolver().pseudo_host().to_string();
    let url = Url::parse(&format!("http://{host}/close-window.function"))?;
    let reply = router.handle_request(CONSOLE_VIEW, &url, None);
    print_reply(stdout, &reply)
}

fn print_reply(stdout: &mut impl Write, reply: &Reply) -> Result<(), Box<dyn std::error::Error>> {
    let line = json!({
        "status": reply.status,
        "mime": reply.mime,
        "content_length": reply.content_length,
        "body": String::from_utf8_lossy(&reply.body).to_string(),
    });
    writeln!(stdout, "{line}")?;
    stdout.flush()?;
    Ok(())
}

fn parse_url(raw: &str) -> Option<Url> {
    match Url::parse(raw) {
        Ok(url) => Some(url),
        Err(err) => {
            eprintln!("bad url {raw}: {err}");
            None
        }
    }
}

fn read_line(reader: &mut impl BufRead) -> Result<Option<String>, io::Error> {
    let mut line = String::new();
    let bytes = reader.read_line(&mut line)?;
    if bytes == 0 {
        return Ok(None);
    }
    Ok(Some(line))
}

fn is_exact_command(line: &str, command: &str) -> bool {
    let trimmed = line.trim_end_matches(['\n', '\r']);
    trimmed == command
}

fn split_command(line: &str) -> (&str, &str) {
    let trimmed = line.trim();
    match trimmed.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim()),
        None => (trimmed, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_command_separates_verb_and_rest() {
        assert_eq!(
            split_command("GET http://local-pseudodomain/x\n"),
            ("GET", "http://local-pseudodomain/x")
        );
        assert_eq!(split_command("CLOSE\n"), ("CLOSE", ""));
        assert_eq!(split_command("  \n"), ("", ""));
        assert_eq!(split_command("FEED s1 hello world"), ("FEED", "s1 hello world"));
    }

    #[test]
    fn end_marker_matches_with_any_line_ending() {
        assert!(is_exact_command("END\n", "END"));
        assert!(is_exact_command("END\r\n", "END"));
        assert!(is_exact_command("END", "END"));
        assert!(!is_exact_command("ENDING\n", "END"));
    }

    #[test]
    fn bad_urls_are_rejected_quietly() {
        assert!(parse_url("not a url").is_none());
        assert!(parse_url("http://local-pseudodomain/ok").is_some());
    }
}
