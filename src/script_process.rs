use std::collections::{BTreeMap, HashMap, HashSet};
use std::ffi::OsString;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use sysinfo::{Pid, ProcessesToUpdate, System};

use crate::error::ProcessError;

const STDIN_CLOSE_TIMEOUT: Duration = Duration::from_millis(200);
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(20);
const BLOCKING_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub const PERL_EVAL_FLAG: &str = "-e";
pub const PERL_ARG_SEPARATOR: &str = "--";

/// Pre-script executed by the interpreter; it loads and runs the target
/// script so a gate can sit between the engine and user code.
pub const PERL_WRAPPER: &str = r#"
my $target = shift @ARGV;
die "no target script supplied\n" unless defined $target;
open my $handle, '<', $target or die "can not open $target: $!\n";
my $code = do { local $/; <$handle> };
close $handle;
$0 = $target;
eval $code;
die $@ if $@;
"#;

/// Identifies which part of the engine a process event belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProcessTag {
    Page(String),
    Debugger,
    Formatter,
    Blocking,
}

#[derive(Debug)]
pub enum ProcessEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Finished(ExitInfo),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub success: bool,
}

#[derive(Debug, Clone)]
pub enum EnvPolicy {
    /// Host environment plus the given overrides.
    Inherit(BTreeMap<String, String>),
    /// Only the given variables.
    Clean(BTreeMap<String, String>),
}

/// Everything needed to start one external process.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub env: EnvPolicy,
    pub cwd: Option<PathBuf>,
}

/// How script files are handed to their interpreter: the interpreter runs a
/// small in-memory wrapper which in turn loads the target script.
#[derive(Debug, Clone)]
pub struct InterpreterSpec {
    pub program: PathBuf,
    pub eval_flag: String,
    pub wrapper: String,
    pub separator: Option<String>,
}

impl InterpreterSpec {
    pub fn perl(program: PathBuf) -> Self {
        Self {
            program,
            eval_flag: PERL_EVAL_FLAG.to_string(),
            wrapper: PERL_WRAPPER.to_string(),
            separator: Some(PERL_ARG_SEPARATOR.to_string()),
        }
    }

    pub fn invocation(&self, script: &Path) -> (PathBuf, Vec<OsString>) {
        let mut args: Vec<OsString> = Vec::new();
        args.push(OsString::from(self.eval_flag.clone()));
        args.push(OsString::from(self.wrapper.clone()));
        if let Some(separator) = &self.separator {
            args.push(OsString::from(separator.clone()));
        }
        args.push(script.as_os_str().to_os_string());
        (self.program.clone(), args)
    }

    pub fn spec(
        &self,
        script: &Path,
        env: BTreeMap<String, String>,
        cwd: Option<PathBuf>,
    ) -> ProcessSpec {
        let (program, args) = self.invocation(script);
        ProcessSpec {
            program,
            args,
            env: EnvPolicy::Inherit(env),
            cwd,
        }
    }
}

enum StdinCommand {
    Write {
        payload: Vec<u8>,
        reply: mpsc::Sender<Result<(), ProcessError>>,
    },
    Close {
        reply: mpsc::Sender<Result<(), ProcessError>>,
    },
}

/// Handle to one live external process. The child itself is owned by a
/// monitor thread; the handle carries the pid for signalling, the stdin
/// channel, and a completion flag set strictly after all output has been
/// forwarded.
pub struct ProcessHandle {
    pid: u32,
    stdin_tx: mpsc::Sender<StdinCommand>,
    finished: Arc<AtomicBool>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn write_input(&self, payload: Vec<u8>, timeout: Duration) -> Result<(), ProcessError> {
        self.send_stdin(Some(payload), timeout)
    }

    pub fn close_stdin(&self, timeout: Duration) -> Result<(), ProcessError> {
        self.send_stdin(None, timeout)
    }

    fn send_stdin(
        &self,
        payload: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<(), ProcessError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        let command = match payload {
            Some(payload) => StdinCommand::Write {
                payload,
                reply: reply_tx,
            },
            None => StdinCommand::Close { reply: reply_tx },
        };
        self.stdin_tx
            .send(command)
            .map_err(|_| ProcessError::Protocol("script stdin unavailable".to_string()))?;
        match reply_rx.recv_timeout(timeout) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(ProcessError::Timeout(timeout)),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(ProcessError::Protocol(
                "script stdin thread exited unexpectedly".to_string(),
            )),
        }
    }

    /// Graceful termination request. The caller owns the grace timer and
    /// follows up with `kill` when the process outlives it.
    pub fn terminate(&self) {
        #[cfg(target_family = "unix")]
        {
            if self.send_signal(libc::SIGTERM).is_err() {
                signal_process_tree(self.pid, libc::SIGTERM);
            }
        }
        // No portable graceful signal elsewhere; the grace timer falls
        // through to the forced kill.
    }

    pub fn kill(&self) {
        #[cfg(target_family = "unix")]
        {
            if self.send_signal(libc::SIGKILL).is_err() {
                signal_process_tree(self.pid, libc::SIGKILL);
            }
        }
        #[cfg(not(target_family = "unix"))]
        {
            force_kill_process_tree(self.pid);
        }
    }

    /// Terminate, wait up to `grace` for a self-exit, then force-kill.
    pub fn shutdown_graceful(&self, grace: Duration) {
        let _ = self.close_stdin(STDIN_CLOSE_TIMEOUT);
        self.terminate();
        let deadline = Instant::now() + grace;
        while !self.is_finished() && Instant::now() < deadline {
            thread::sleep(SHUTDOWN_POLL_INTERVAL);
        }
        if !self.is_finished() {
            self.kill();
        }
    }

    #[cfg(target_family = "unix")]
    fn send_signal(&self, signal: i32) -> Result<(), ProcessError> {
        let pid = self.pid as i32;
        let result = unsafe { libc::kill(-pid, signal) };
        if result == 0 {
            Ok(())
        } else {
            let err = std::io::Error::last_os_error();
            // If the process (group) is already gone, we're done.
            if err.kind() == std::io::ErrorKind::NotFound {
                return Ok(());
            }
            Err(ProcessError::Io(err))
        }
    }
}

/// Start a process and deliver its output incrementally. Stdout and stderr
/// chunks arrive tagged on `events`; a single `Finished` event follows once
/// both streams have drained and the process has exited.
pub fn spawn_streaming(
    spec: &ProcessSpec,
    body: Option<&[u8]>,
    tag: ProcessTag,
    events: mpsc::Sender<(ProcessTag, ProcessEvent)>,
) -> Result<ProcessHandle, ProcessError> {
    let mut command = Command::new(&spec.program);
    command.args(&spec.args);
    match &spec.env {
        EnvPolicy::Inherit(extra) => {
            command.envs(extra.iter());
        }
        EnvPolicy::Clean(vars) => {
            command.env_clear();
            command.envs(vars.iter());
        }
    }
    if let Some(dir) = &spec.cwd {
        command.current_dir(dir);
    }
    #[cfg(target_family = "unix")]
    unsafe {
        use std::os::unix::process::CommandExt;
        command.pre_exec(|| {
            libc::setpgid(0, 0);
            Ok(())
        });
    }
    let mut child = command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| ProcessError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

    let pid = child.id();
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| ProcessError::Protocol("script stdin unavailable".to_string()))?;
    let stdin_tx = spawn_stdin_writer(stdin);
    let stdout_reader = spawn_output_reader(child.stdout.take(), false, tag.clone(), events.clone());
    let stderr_reader = spawn_output_reader(child.stderr.take(), true, tag.clone(), events.clone());

    if let Some(payload) = body
        && !payload.is_empty()
    {
        let (reply_tx, _reply_rx) = mpsc::channel();
        let _ = stdin_tx.send(StdinCommand::Write {
            payload: payload.to_vec(),
            reply: reply_tx,
        });
    }

    let finished = Arc::new(AtomicBool::new(false));
    let finished_flag = finished.clone();
    thread::spawn(move || {
        let status = child.wait();
        // Readers hit EOF once the pipes drain; joining them first keeps the
        // finish event strictly after the last output chunk.
        if let Some(reader) = stdout_reader {
            let _ = reader.join();
        }
        if let Some(reader) = stderr_reader {
            let _ = reader.join();
        }
        finished_flag.store(true, Ordering::SeqCst);
        let info = match status {
            Ok(status) => ExitInfo {
                code: status.code(),
                success: status.success(),
            },
            Err(_) => ExitInfo {
                code: None,
                success: false,
            },
        };
        let _ = events.send((tag, ProcessEvent::Finished(info)));
    });

    Ok(ProcessHandle {
        pid,
        stdin_tx,
        finished,
    })
}

#[derive(Debug)]
pub struct BlockingOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit: ExitInfo,
}

/// Start a process, write the body, close stdin, and suspend the calling
/// flow until it finishes. With `timeout` set the process is killed at the
/// deadline and `ProcessError::Timeout` is returned.
pub fn run_blocking(
    spec: &ProcessSpec,
    body: Option<&[u8]>,
    timeout: Option<Duration>,
) -> Result<BlockingOutput, ProcessError> {
    let (events_tx, events_rx) = mpsc::channel();
    let handle = spawn_streaming(spec, body, ProcessTag::Blocking, events_tx)?;
    let _ = handle.close_stdin(STDIN_CLOSE_TIMEOUT);

    let deadline = timeout.map(|limit| Instant::now() + limit);
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    loop {
        match events_rx.recv_timeout(BLOCKING_POLL_INTERVAL) {
            Ok((_, ProcessEvent::Stdout(chunk))) => stdout.extend_from_slice(&chunk),
            Ok((_, ProcessEvent::Stderr(chunk))) => stderr.extend_from_slice(&chunk),
            Ok((_, ProcessEvent::Finished(exit))) => {
                return Ok(BlockingOutput {
                    stdout,
                    stderr,
                    exit,
                });
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if let Some(deadline) = deadline
                    && Instant::now() >= deadline
                {
                    handle.kill();
                    return Err(ProcessError::Timeout(timeout.unwrap_or_default()));
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                return Err(ProcessError::Protocol(
                    "script output channel closed before completion".to_string(),
                ));
            }
        }
    }
}

fn spawn_stdin_writer<W>(stdin: W) -> mpsc::Sender<StdinCommand>
where
    W: Write + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<StdinCommand>();
    thread::spawn(move || {
        let mut writer = std::io::BufWriter::new(stdin);
        for command in rx {
            match command {
                StdinCommand::Write { payload, reply } => {
                    let result = writer
                        .write_all(&payload)
                        .and_then(|_| writer.flush())
                        .map_err(ProcessError::Io);
                    let _ = reply.send(result);
                }
                StdinCommand::Close { reply } => {
                    let result = writer.flush().map_err(ProcessError::Io);
                    let _ = reply.send(result);
                    break;
                }
            }
        }
    });
    tx
}

fn spawn_output_reader<R>(
    stream: Option<R>,
    is_stderr: bool,
    tag: ProcessTag,
    events: mpsc::Sender<(ProcessTag, ProcessEvent)>,
) -> Option<thread::JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    let mut stream = stream?;
    let handle = thread::spawn(move || {
        let mut buffer = [0u8; 8192];
        loop {
            match stream.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = buffer[..n].to_vec();
                    let event = if is_stderr {
                        ProcessEvent::Stderr(chunk)
                    } else {
                        ProcessEvent::Stdout(chunk)
                    };
                    if events.send((tag.clone(), event)).is_err() {
                        break;
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    });
    Some(handle)
}

/// Walk the process table and collect the pids of `root_pid` and every
/// descendant still visible.
fn process_tree_pids(root_pid: u32) -> HashSet<Pid> {
    let root = Pid::from_u32(root_pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for (proc_pid, process) in system.processes() {
        if let Some(parent) = process.parent() {
            children.entry(parent).or_default().push(*proc_pid);
        }
    }

    let mut stack = vec![root];
    let mut seen: HashSet<Pid> = HashSet::new();
    while let Some(current) = stack.pop() {
        if !seen.insert(current) {
            continue;
        }
        if let Some(kids) = children.get(&current) {
            for child in kids {
                if !seen.contains(child) {
                    stack.push(*child);
                }
            }
        }
    }
    seen
}

#[cfg(target_family = "unix")]
fn signal_process_tree(root_pid: u32, signal: i32) {
    for pid in process_tree_pids(root_pid) {
        let _ = unsafe { libc::kill(pid.as_u32() as i32, signal) };
    }
}

#[cfg(not(target_family = "unix"))]
fn force_kill_process_tree(root_pid: u32) {
    let pids = process_tree_pids(root_pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    for pid in pids {
        if let Some(process) = system.process(pid) {
            process.kill();
        }
    }
}
