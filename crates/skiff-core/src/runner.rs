//! Resilient process runner: launches a child with captured output, restarts
//! on crash, detects hangs, and escalates from graceful termination to a
//! forced kill of the whole process tree.
//!
//! Each attempt moves `Started -> Running -> (Stopped | Crashed | TimedOut)`.
//! A crash restarts while the policy allows; a timeout is terminal and maps
//! to exit code 124.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Grace period between termination request and forced kill.
const KILL_GRACE: Duration = Duration::from_secs(5);
/// Consecutive non-responsive health samples that classify a hang.
const HANG_SAMPLES: u32 = 3;
/// Exit code reported for timed-out processes.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RestartPolicy {
    pub enabled: bool,
    pub max_restarts: u32,
    pub delay: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self { enabled: false, max_restarts: 3, delay: Duration::from_millis(500) }
    }
}

#[derive(Clone, Debug)]
pub struct ProcessRequest {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Extra environment; overrides inherited variables of the same name.
    pub env: HashMap<String, String>,
    /// Workspace whose `node_modules/.bin` is prepended to PATH.
    pub workspace_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub restart: RestartPolicy,
    pub health_interval: Duration,
    /// When true, a detected hang takes the crash (restart) path.
    pub treat_hang_as_crash: bool,
}

impl ProcessRequest {
    pub fn new(command: impl Into<String>, args: Vec<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args,
            cwd: cwd.into(),
            env: HashMap::new(),
            workspace_dir: None,
            timeout: None,
            restart: RestartPolicy::default(),
            health_interval: Duration::from_secs(10),
            treat_hang_as_crash: false,
        }
    }

    /// A request that runs `script` through the platform shell.
    pub fn shell(script: &str, cwd: impl Into<PathBuf>) -> Self {
        #[cfg(unix)]
        {
            let sh = std::env::var("SHELL").unwrap_or_else(|_| "sh".to_string());
            Self::new(sh, vec!["-c".to_string(), script.to_string()], cwd)
        }
        #[cfg(not(unix))]
        {
            Self::new("cmd", vec!["/c".to_string(), script.to_string()], cwd)
        }
    }
}

/// How the final attempt ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed,
    Crashed,
    TimedOut,
    Canceled,
}

#[derive(Clone, Debug)]
pub struct ProcessResult {
    pub exit_code: i32,
    pub success: bool,
    pub standard_output: String,
    pub standard_error: String,
    pub duration: Duration,
    pub outcome: ProcessOutcome,
    pub restarts: u32,
}

enum AttemptEnd {
    Exited(i32),
    TimedOut,
    Canceled,
    Hung,
}

fn build_path_env(req: &ProcessRequest) -> Option<String> {
    let workspace = req.workspace_dir.as_ref()?;
    let bin_dir = workspace.join("node_modules").join(".bin");
    let current = std::env::var("PATH").unwrap_or_default();
    let sep = if cfg!(windows) { ';' } else { ':' };
    Some(format!("{}{}{}", bin_dir.to_string_lossy(), sep, current))
}

#[cfg(target_os = "linux")]
fn is_responding(pid: u32) -> bool {
    // /proc/<pid>/stat: "pid (comm) state ...". Zombie and stopped states
    // count as non-responsive; a vanished proc entry is decided by wait().
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
        return true;
    };
    let Some(after_comm) = stat.rsplit(')').next() else {
        return true;
    };
    match after_comm.trim_start().chars().next() {
        Some('Z') | Some('T') | Some('t') | Some('X') => false,
        _ => true,
    }
}

#[cfg(not(target_os = "linux"))]
fn is_responding(_pid: u32) -> bool {
    // No cheap probe on this platform; hang handling degrades to timeouts.
    true
}

#[cfg(unix)]
fn signal_tree(pid: u32, signal: i32) {
    // The child is its own process group leader, so the negative pid
    // addresses the whole tree.
    unsafe {
        libc::kill(-(pid as i32), signal);
    }
}

async fn force_kill(child: &mut tokio::process::Child) {
    if let Some(pid) = child.id() {
        #[cfg(unix)]
        signal_tree(pid, libc::SIGKILL);
        #[cfg(not(unix))]
        let _ = pid;
    }
    let _ = child.kill().await;
}

/// Ask nicely, wait out the grace period, then kill the tree.
async fn terminate(child: &mut tokio::process::Child) {
    if let Some(pid) = child.id() {
        #[cfg(unix)]
        signal_tree(pid, libc::SIGTERM);
        #[cfg(not(unix))]
        let _ = pid;
    }
    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
        Ok(_) => {}
        Err(_) => force_kill(child).await,
    }
}

async fn run_attempt(
    req: &ProcessRequest,
    token: &CancellationToken,
    stdout_buf: &Arc<Mutex<Vec<String>>>,
    stderr_buf: &Arc<Mutex<Vec<String>>>,
) -> Result<AttemptEnd> {
    let mut command = tokio::process::Command::new(&req.command);
    command
        .args(&req.args)
        .current_dir(&req.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(path) = build_path_env(req) {
        command.env("PATH", path);
    }
    for (key, value) in &req.env {
        command.env(key, value);
    }
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command.spawn().map_err(|e| Error::ProcessFailed {
        code: -1,
        detail: format!("{}: {}", req.command, e),
    })?;
    let pid = child.id().unwrap_or(0);

    let out_task = child.stdout.take().map(|stdout| {
        let buf = Arc::clone(stdout_buf);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Ok(mut buf) = buf.lock() {
                    buf.push(line);
                }
            }
        })
    });
    let err_task = child.stderr.take().map(|stderr| {
        let buf = Arc::clone(stderr_buf);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Ok(mut buf) = buf.lock() {
                    buf.push(line);
                }
            }
        })
    });

    let timeout_fut = async {
        match req.timeout {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(timeout_fut);
    let mut health = tokio::time::interval(req.health_interval);
    health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    health.reset(); // skip the immediate first tick
    let mut missed_samples = 0u32;

    let end = loop {
        tokio::select! {
            status = child.wait() => {
                let code = status
                    .map_err(|e| Error::ProcessFailed { code: -1, detail: e.to_string() })?
                    .code()
                    .unwrap_or(-1);
                break AttemptEnd::Exited(code);
            }
            _ = token.cancelled() => {
                force_kill(&mut child).await;
                break AttemptEnd::Canceled;
            }
            _ = &mut timeout_fut => {
                terminate(&mut child).await;
                break AttemptEnd::TimedOut;
            }
            _ = health.tick() => {
                if is_responding(pid) {
                    missed_samples = 0;
                } else {
                    missed_samples += 1;
                    if missed_samples >= HANG_SAMPLES && req.treat_hang_as_crash {
                        force_kill(&mut child).await;
                        break AttemptEnd::Hung;
                    }
                }
            }
        }
    };

    // Drain the capture tasks so the buffers hold everything written.
    if let Some(task) = out_task {
        let _ = task.await;
    }
    if let Some(task) = err_task {
        let _ = task.await;
    }
    Ok(end)
}

/// Run a request to completion, restarting on crash per its policy.
pub async fn execute(req: &ProcessRequest, token: &CancellationToken) -> Result<ProcessResult> {
    let started = Instant::now();
    let stdout_buf = Arc::new(Mutex::new(Vec::new()));
    let stderr_buf = Arc::new(Mutex::new(Vec::new()));
    let mut restarts = 0u32;

    loop {
        if token.is_cancelled() {
            return Ok(finish(ProcessOutcome::Canceled, -1, &stdout_buf, &stderr_buf, started, restarts));
        }
        let end = run_attempt(req, token, &stdout_buf, &stderr_buf).await?;
        match end {
            AttemptEnd::Exited(0) => {
                return Ok(finish(ProcessOutcome::Completed, 0, &stdout_buf, &stderr_buf, started, restarts));
            }
            AttemptEnd::Exited(code) => {
                if req.restart.enabled && restarts < req.restart.max_restarts {
                    restarts += 1;
                    tokio::select! {
                        _ = token.cancelled() => {
                            return Ok(finish(ProcessOutcome::Canceled, code, &stdout_buf, &stderr_buf, started, restarts));
                        }
                        _ = tokio::time::sleep(req.restart.delay) => {}
                    }
                    continue;
                }
                if req.restart.enabled {
                    if let Ok(mut buf) = stderr_buf.lock() {
                        buf.push("Maximum restart attempts exceeded".to_string());
                    }
                }
                return Ok(finish(ProcessOutcome::Crashed, code, &stdout_buf, &stderr_buf, started, restarts));
            }
            AttemptEnd::Hung => {
                // The hang took the crash path; retry like any other crash.
                if req.restart.enabled && restarts < req.restart.max_restarts {
                    restarts += 1;
                    tokio::time::sleep(req.restart.delay).await;
                    continue;
                }
                if req.restart.enabled {
                    if let Ok(mut buf) = stderr_buf.lock() {
                        buf.push("Maximum restart attempts exceeded".to_string());
                    }
                }
                return Ok(finish(ProcessOutcome::Crashed, -1, &stdout_buf, &stderr_buf, started, restarts));
            }
            AttemptEnd::TimedOut => {
                return Ok(finish(
                    ProcessOutcome::TimedOut,
                    TIMEOUT_EXIT_CODE,
                    &stdout_buf,
                    &stderr_buf,
                    started,
                    restarts,
                ));
            }
            AttemptEnd::Canceled => {
                return Ok(finish(ProcessOutcome::Canceled, -1, &stdout_buf, &stderr_buf, started, restarts));
            }
        }
    }
}

fn finish(
    outcome: ProcessOutcome,
    exit_code: i32,
    stdout_buf: &Arc<Mutex<Vec<String>>>,
    stderr_buf: &Arc<Mutex<Vec<String>>>,
    started: Instant,
    restarts: u32,
) -> ProcessResult {
    let standard_output = stdout_buf.lock().map(|b| b.join("\n")).unwrap_or_default();
    let standard_error = stderr_buf.lock().map(|b| b.join("\n")).unwrap_or_default();
    ProcessResult {
        exit_code,
        success: outcome == ProcessOutcome::Completed && exit_code == 0,
        standard_output,
        standard_error,
        duration: started.elapsed(),
        outcome,
        restarts,
    }
}
