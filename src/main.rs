use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use url::Url;

use scripthost::app_layout::AppLayout;
use scripthost::console::{self, ConsoleBridge};
use scripthost::event_log;
use scripthost::router::Router;

const VERSION: &str = env!("CARGO_PKG_VERSION");

enum CliCommand {
    Console(CliOptions),
    Route(CliOptions, String),
    Version,
    Help,
}

#[derive(Default)]
struct CliOptions {
    root: Option<PathBuf>,
    host: Option<String>,
    interpreter: Option<PathBuf>,
    formatter: Option<PathBuf>,
    log_dir: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(target_family = "unix")]
    // A downstream reader closing its end would otherwise raise SIGPIPE and
    // terminate the process; surface broken-pipe errors normally instead.
    ignore_sigpipe();

    match parse_cli_args()? {
        CliCommand::Help => {
            print_usage();
            Ok(())
        }
        CliCommand::Version => {
            println!("scripthost {VERSION}");
            Ok(())
        }
        CliCommand::Console(options) => {
            let router = build_router(&options, "console")?;
            console::run(router)
        }
        CliCommand::Route(options, raw_url) => {
            let mut router = build_router(&options, "route")?;
            let url = Url::parse(&raw_url)?;
            router.observe_navigation("route", &url);
            let reply = router.handle_request("route", &url, None);
            println!(
                "{}",
                serde_json::json!({
                    "status": reply.status,
                    "mime": reply.mime,
                    "content_length": reply.content_length,
                    "body": String::from_utf8_lossy(&reply.body).to_string(),
                })
            );
            router.pump_until_idle(Duration::from_millis(500));
            router.shutdown();
            Ok(())
        }
    }
}

fn build_router(
    options: &CliOptions,
    mode: &str,
) -> Result<Router, Box<dyn std::error::Error>> {
    let layout = AppLayout::discover(
        options.root.clone(),
        options.host.clone(),
        options.interpreter.clone(),
    );
    event_log::initialize(
        options.log_dir.clone(),
        event_log::StartupContext {
            mode: mode.to_string(),
            app_root: layout.app_root.clone(),
            pseudo_host: layout.pseudo_host.clone(),
            interpreter: layout.interpreter.clone(),
        },
    )?;
    if layout.interpreter.is_none() {
        eprintln!("warning: no script interpreter found; script requests will fail");
    }
    let mut router = Router::from_layout(&layout, Arc::new(ConsoleBridge));
    if let Some(formatter) = &options.formatter
        && let Some(interpreter) = &layout.interpreter
    {
        router.configure_debugger(interpreter.clone(), formatter.clone());
    }
    Ok(router)
}

#[cfg(target_family = "unix")]
fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

struct ArgParser {
    args: Vec<String>,
    index: usize,
}

impl ArgParser {
    fn new() -> Self {
        Self {
            args: std::env::args().skip(1).collect(),
            index: 0,
        }
    }

    fn next(&mut self) -> Option<String> {
        let value = self.args.get(self.index)?.clone();
        self.index += 1;
        Some(value)
    }

    fn next_value(&mut self, flag: &str) -> Result<String, Box<dyn std::error::Error>> {
        self.next()
            .ok_or_else(|| format!("missing value for {flag}").into())
    }
}

fn parse_cli_args() -> Result<CliCommand, Box<dyn std::error::Error>> {
    let mut parser = ArgParser::new();
    let mut options = CliOptions::default();
    let mut command: Option<String> = None;
    let mut route_url: Option<String> = None;

    while let Some(arg) = parser.next() {
        match arg.as_str() {
            "-h" | "--help" | "help" => return Ok(CliCommand::Help),
            "-V" | "--version" | "version" => return Ok(CliCommand::Version),
            "--root" => {
                options.root = Some(PathBuf::from(parser.next_value("--root")?));
            }
            _ if arg.starts_with("--root=") => {
                options.root = Some(PathBuf::from(flag_value(&arg, "--root")?));
            }
            "--host" => {
                options.host = Some(parser.next_value("--host")?);
            }
            _ if arg.starts_with("--host=") => {
                options.host = Some(flag_value(&arg, "--host")?);
            }
            "--interpreter" => {
                options.interpreter = Some(PathBuf::from(parser.next_value("--interpreter")?));
            }
            _ if arg.starts_with("--interpreter=") => {
                options.interpreter = Some(PathBuf::from(flag_value(&arg, "--interpreter")?));
            }
            "--formatter" => {
                options.formatter = Some(PathBuf::from(parser.next_value("--formatter")?));
            }
            _ if arg.starts_with("--formatter=") => {
                options.formatter = Some(PathBuf::from(flag_value(&arg, "--formatter")?));
            }
            "--log-dir" => {
                options.log_dir = Some(PathBuf::from(parser.next_value("--log-dir")?));
            }
            _ if arg.starts_with("--log-dir=") => {
                options.log_dir = Some(PathBuf::from(flag_value(&arg, "--log-dir")?));
            }
            "console" | "route" if command.is_none() => {
                command = Some(arg);
            }
            _ if command.as_deref() == Some("route") && route_url.is_none() => {
                route_url = Some(arg);
            }
            _ => return Err(format!("unknown argument: {arg}").into()),
        }
    }

    match command.as_deref() {
        Some("route") => {
            let url = route_url.ok_or("route needs a URL argument")?;
            Ok(CliCommand::Route(options, url))
        }
        Some("console") | None => Ok(CliCommand::Console(options)),
        Some(other) => Err(format!("unknown command: {other}").into()),
    }
}

fn flag_value(arg: &str, flag: &str) -> Result<String, Box<dyn std::error::Error>> {
    let value = arg.split_once('=').map(|(_, value)| value).unwrap_or("");
    if value.is_empty() {
        return Err(format!("missing value for {flag}").into());
    }
    Ok(value.to_string())
}

fn print_usage() {
    println!(
        "Usage:\n\
scripthost [--root <dir>] [--host <name>] [--interpreter <path>] [--formatter <script>] [--log-dir <dir>] [console]\n\
scripthost [options] route <url>\n\
scripthost version\n\n\
console: interactive driver over stdio (default command)\n\
route: classify and serve one URL, print the reply as JSON, then exit\n\
--root: application root directory (env: SCRIPTHOST_ROOT; default: <exe-dir>/resources/app)\n\
--host: reserved pseudo-host name (env: SCRIPTHOST_PSEUDO_HOST; default: local-pseudodomain)\n\
--interpreter: script interpreter path (env: SCRIPTHOST_INTERPRETER; default: bundled perl, then PATH)\n\
--formatter: debugger output formatter script; enables the DEBUG console command\n\
--log-dir: directory for per-startup JSONL event logs (env: SCRIPTHOST_LOG_DIR)"
    );
}
