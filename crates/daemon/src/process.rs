//! Scoped supervision of external tools.
//!
//! Every tool is spawned with `kill_on_drop` in its own process group, its
//! output forwarded to the log, and it is always waited on before the call
//! returns, whether it succeeded, failed, timed out or was cancelled.
//! Cancellation signals the whole group, so helpers started by wrapper
//! scripts (abcde runs cdparanoia and flac) stop with the tool.

use std::ffi::OsStr;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long output forwarding may outlive the tool before it is abandoned
const OUTPUT_DRAIN: Duration = Duration::from_secs(2);

/// Error type for external tool invocations
#[derive(Debug, Error)]
pub enum ToolError {
    /// The tool could not be started (usually not installed)
    #[error("Failed to start {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    /// Process exited with non-zero status
    #[error("{tool} failed with exit code: {code}")]
    Failed { tool: String, code: i32 },

    /// Process was terminated by a signal it did not receive from us
    #[error("{tool} was terminated by signal")]
    Terminated { tool: String },

    /// Shutdown was requested while the tool was running
    #[error("{tool} was cancelled")]
    Cancelled { tool: String },

    /// The tool did not finish within its deadline
    #[error("{tool} timed out after {secs}s")]
    TimedOut { tool: String, secs: u64 },

    /// IO error while waiting on the process
    #[error("IO error while running {tool}: {source}")]
    Io {
        tool: String,
        #[source]
        source: std::io::Error,
    },
}

impl ToolError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ToolError::Cancelled { .. })
    }
}

/// Name of the program a command will execute
pub fn tool_name(cmd: &Command) -> String {
    let program = cmd.as_std().get_program();
    std::path::Path::new(program)
        .file_name()
        .unwrap_or(program)
        .to_string_lossy()
        .into_owned()
}

/// Map an exit status to the tool result
pub fn check_status(tool: &str, status: ExitStatus) -> Result<(), ToolError> {
    if status.success() {
        Ok(())
    } else {
        match status.code() {
            Some(code) => Err(ToolError::Failed {
                tool: tool.to_string(),
                code,
            }),
            None => Err(ToolError::Terminated {
                tool: tool.to_string(),
            }),
        }
    }
}

/// Run a tool to completion, logging its output at debug level
///
/// If `cancel` fires while the tool runs, the child gets SIGTERM, then `grace`
/// to exit before it is killed. The child is reaped on every path.
pub async fn run_tool(
    mut cmd: Command,
    cancel: &CancellationToken,
    grace: Duration,
) -> Result<(), ToolError> {
    let tool = tool_name(&cmd);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    debug!(tool = %tool, command = ?cmd.as_std(), "Executing");
    let mut child = cmd.spawn().map_err(|source| ToolError::Spawn {
        tool: tool.clone(),
        source,
    })?;
    let forwarders = forward_output(&mut child, &tool);

    let status = tokio::select! {
        status = child.wait() => status,
        _ = cancel.cancelled() => {
            info!(tool = %tool, "Cancellation requested, stopping tool");
            terminate(&mut child, &tool, grace).await;
            drain(forwarders, &tool).await;
            return Err(ToolError::Cancelled { tool });
        }
    };

    drain(forwarders, &tool).await;
    let status = status.map_err(|source| ToolError::Io {
        tool: tool.clone(),
        source,
    })?;
    check_status(&tool, status)
}

/// Run a short-lived query tool and return its combined stdout and stderr
///
/// Some tools (cdparanoia) print their report on stderr, so both streams are
/// returned, stdout first.
pub async fn run_capture(mut cmd: Command, timeout: Duration) -> Result<String, ToolError> {
    let tool = tool_name(&cmd);
    cmd.stdin(Stdio::null()).kill_on_drop(true);
    debug!(tool = %tool, command = ?cmd.as_std(), "Querying");

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(result) => result.map_err(|source| match source.kind() {
            std::io::ErrorKind::NotFound => ToolError::Spawn {
                tool: tool.clone(),
                source,
            },
            _ => ToolError::Io {
                tool: tool.clone(),
                source,
            },
        })?,
        Err(_) => {
            return Err(ToolError::TimedOut {
                tool,
                secs: timeout.as_secs(),
            })
        }
    };

    check_status(&tool, output.status)?;
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(text)
}

/// Run a privileged helper, retrying through sudo when the plain call fails
pub async fn run_with_sudo_fallback<I, S>(
    program: &str,
    args: I,
    use_sudo: bool,
    cancel: &CancellationToken,
    grace: Duration,
) -> Result<(), ToolError>
where
    I: IntoIterator<Item = S> + Clone,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(args.clone());
    match run_tool(cmd, cancel, grace).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_cancelled() || !use_sudo => Err(e),
        Err(e) => {
            debug!(tool = program, error = %e, "Plain invocation failed");
            info!(tool = program, "Retrying with sudo");
            let mut sudo = Command::new("sudo");
            sudo.arg("-n").arg(program).args(args);
            run_tool(sudo, cancel, grace).await
        }
    }
}

fn forward_output(child: &mut Child, tool: &str) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        handles.push(spawn_line_logger(stdout, tool.to_string()));
    }
    if let Some(stderr) = child.stderr.take() {
        handles.push(spawn_line_logger(stderr, tool.to_string()));
    }
    handles
}

fn spawn_line_logger<R>(reader: R, tool: String) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => debug!(tool = %tool, "{}", line),
                Ok(None) => break,
                Err(e) => {
                    // non-UTF-8 progress output ends forwarding, not the tool
                    debug!(tool = %tool, error = %e, "Stopped forwarding output");
                    break;
                }
            }
        }
    })
}

/// Wait for output forwarding to finish, abandoning it after [`OUTPUT_DRAIN`]
///
/// A detached grandchild can hold the pipes open long after the tool exits.
async fn drain(handles: Vec<JoinHandle<()>>, tool: &str) {
    let deadline = tokio::time::Instant::now() + OUTPUT_DRAIN;
    for mut handle in handles {
        if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
            debug!(tool, "Output still open after exit; abandoning forwarder");
            handle.abort();
        }
    }
}

/// Send `signal` to every process in the group led by `pid`
#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) -> bool {
    // SAFETY: a negative pid addresses the process group created at spawn;
    // the group id stays reserved while any member is alive.
    unsafe { libc::kill(-(pid as libc::pid_t), signal) == 0 }
}

async fn terminate(child: &mut Child, tool: &str, grace: Duration) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            if signal_group(pid, libc::SIGTERM) {
                match tokio::time::timeout(grace, child.wait()).await {
                    Ok(Ok(status)) => debug!(tool, ?status, "Tool exited after SIGTERM"),
                    Ok(Err(e)) => warn!(tool, error = %e, "Error waiting for terminated tool"),
                    Err(_) => warn!(tool, "Tool did not exit in time; killing process group"),
                }
            }
            // helpers that ignored SIGTERM; fails with ESRCH once the group is gone
            signal_group(pid, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    // kill() sends SIGKILL and reaps the child
    if let Ok(None) = child.try_wait() {
        if let Err(e) = child.kill().await {
            warn!(tool, error = %e, "Failed to kill tool");
        }
    }
}
