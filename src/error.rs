use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug)]
pub enum ProcessError {
    Io(std::io::Error),
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },
    Timeout(Duration),
    Protocol(String),
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessError::Io(err) => write!(f, "script process I/O error: {err}"),
            ProcessError::Spawn { program, source } => {
                write!(f, "failed to start {}: {source}", program.display())
            }
            ProcessError::Timeout(duration) => {
                write!(
                    f,
                    "script process timed out after {:.1}s",
                    duration.as_secs_f64()
                )
            }
            ProcessError::Protocol(message) => write!(f, "script process error: {message}"),
        }
    }
}

impl std::error::Error for ProcessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProcessError::Io(err) => Some(err),
            ProcessError::Spawn { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ProcessError {
    fn from(err: std::io::Error) -> Self {
        ProcessError::Io(err)
    }
}
