use std::io::Read;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use wait_timeout::ChildExt;

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Command `{0}` timed out after {1:?}")]
    Timeout(String, Duration),
    #[error("Command `{0}` output reader panicked")]
    Reader(String),
}

/// What a finished subprocess produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedOutput {
    /// Exit code; `None` if the process was ended by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Run `program` with `args`, capturing stdout and stderr.
///
/// Unlike a shell pipeline, no shell is involved: arguments are passed as-is.
/// A nonzero exit is not an error; callers inspect [`CapturedOutput::code`].
///
/// # Arguments
///
/// * `program` - The executable, resolved through `PATH`
/// * `args` - Arguments passed verbatim
/// * `timeout` - Optional timeout; if exceeded, the process is killed
pub fn run_captured(
    program: &str,
    args: &[&str],
    timeout: Option<Duration>,
) -> Result<CapturedOutput, ShellError> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    // Drain both pipes while waiting so a chatty child cannot block on a full pipe.
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let status = match timeout {
        Some(duration) => match child.wait_timeout(duration)? {
            Some(status) => status,
            None => {
                child.kill()?;
                child.wait()?;
                return Err(ShellError::Timeout(program.to_string(), duration));
            }
        },
        None => child.wait()?,
    };

    Ok(CapturedOutput {
        code: status.code(),
        stdout: collect(program, stdout)?,
        stderr: collect(program, stderr)?,
    })
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<std::io::Result<String>> {
    thread::spawn(move || {
        let mut bytes = Vec::new();
        pipe.read_to_end(&mut bytes)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    })
}

fn collect(
    program: &str,
    reader: Option<thread::JoinHandle<std::io::Result<String>>>,
) -> Result<String, ShellError> {
    match reader {
        Some(handle) => handle
            .join()
            .map_err(|_| ShellError::Reader(program.to_string()))?
            .map_err(ShellError::from),
        None => Ok(String::new()),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_captures_both_streams_and_code() {
        let output = run_captured("sh", &["-c", "echo out; echo err >&2; exit 3"], None).unwrap();
        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
    }

    #[test]
    fn test_arguments_are_not_shell_expanded() {
        let output = run_captured("echo", &["$HOME", "*"], None).unwrap();
        assert_eq!(output.stdout, "$HOME *\n");
    }

    #[test]
    fn test_timeout() {
        let start = std::time::Instant::now();
        let res = run_captured("sleep", &["2"], Some(Duration::from_millis(200)));
        assert!(matches!(res, Err(ShellError::Timeout(_, _))));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_missing_program_is_io_error() {
        let res = run_captured("definitely-not-a-real-program-xyz", &[], None);
        assert!(matches!(res, Err(ShellError::Io(_))));
    }
}
