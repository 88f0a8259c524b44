//! Resource-limited process execution.
//!
//! Spawns the target in its own process group, feeds stdin, captures
//! stdout/stderr incrementally up to the output ceiling, and races the
//! process against a wall-clock deadline and a memory sampler. Whatever
//! fires first decides the outcome; the whole group is terminated and the
//! child reaped on every path.

use std::ffi::OsString;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::time::MissedTickBehavior;
use tracing::{debug, instrument, warn};

use super::memory;
use super::{ConfinedCommand, ExecutionLimits, ExecutionResult, ExitKind, ProcessLauncher};
use crate::error::{EngineError, Result};

/// Stderr fragments that mean the program died of an allocation failure.
const ALLOCATION_FAILURE_MARKERS: &[&str] = &[
    "std::bad_alloc",
    "cannot allocate memory",
    "out of memory",
    "memory exhausted",
    // Dynamic loader refused by the address-space limit.
    "failed to map segment",
];

const READ_CHUNK: usize = 8 * 1024;

/// Host-side knobs of the limiter, fixed at startup.
#[derive(Debug, Clone)]
pub struct LimiterSettings {
    /// Time between graceful termination and the kill signal.
    pub kill_grace: Duration,
    /// Interval between memory samples.
    pub sample_interval: Duration,
    /// Address-space backstop as a multiple of the memory ceiling.
    /// `0` disables the backstop.
    pub address_space_factor: u64,
    /// Host environment passed to every child.
    pub inherited_env: Vec<(String, OsString)>,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            kill_grace: Duration::from_millis(500),
            sample_interval: Duration::from_millis(10),
            address_space_factor: 2,
            inherited_env: std::env::var_os("PATH")
                .map(|path| vec![("PATH".to_string(), path)])
                .unwrap_or_default(),
        }
    }
}

/// Process launcher that enforces [`ExecutionLimits`].
#[derive(Debug, Clone, Default)]
pub struct ResourceLimiter {
    settings: LimiterSettings,
}

impl ResourceLimiter {
    #[must_use]
    pub const fn new(settings: LimiterSettings) -> Self {
        Self { settings }
    }

    fn build_command(&self, command: &ConfinedCommand, limits: &ExecutionLimits) -> Command {
        let workdir = command.working_dir.as_path();
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .current_dir(workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env_clear()
            .envs(self.settings.inherited_env.iter().map(|(k, v)| (k, v)))
            .env("LC_ALL", "C")
            .env("HOME", workdir)
            .env("TMPDIR", workdir)
            .kill_on_drop(true);

        #[cfg(unix)]
        harden(&mut cmd, limits, self.settings.address_space_factor);
        #[cfg(not(unix))]
        let _ = limits;

        cmd
    }

    /// Terminate the group gracefully, escalate after the grace period,
    /// then reap the child.
    async fn terminate(&self, child: &mut Child, group: &ProcessGroup) -> Option<ExitStatus> {
        group.terminate();
        #[cfg(not(unix))]
        let _ = child.start_kill();

        let status = match tokio::time::timeout(self.settings.kill_grace, child.wait()).await {
            Ok(Ok(status)) => Some(status),
            _ => {
                debug!("Grace period elapsed, killing process group");
                group.kill();
                let _ = child.start_kill();
                child.wait().await.ok()
            }
        };
        // Descendants that ignored SIGTERM outlive the leader.
        group.kill_survivors();
        status
    }
}

#[async_trait]
impl ProcessLauncher for ResourceLimiter {
    #[instrument(
        skip(self, command, limits),
        fields(
            program = %command.program.display(),
            timeout_ms = limits.timeout_ms,
            memory_mb = limits.memory_mb,
        )
    )]
    async fn run_confined(
        &self,
        command: ConfinedCommand,
        limits: &ExecutionLimits,
    ) -> Result<ExecutionResult> {
        debug!(stdin_len = command.stdin.len(), "Spawning confined process");

        let mut cmd = self.build_command(&command, limits);
        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|e| {
            EngineError::limiter(format!("failed to spawn {}: {e}", command.program.display()))
        })?;
        let mut group = ProcessGroup::of(&child);

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::limiter("failed to open stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::limiter("failed to open stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::limiter("failed to open stderr"))?;

        // Fed from a task so a child that never reads cannot stall capture.
        let feeder = tokio::spawn(feed_stdin(stdin, command.stdin));

        let cap = limits.max_output_bytes;
        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();
        let mut stdout_truncated = false;
        let mut stderr_truncated = false;
        let mut exit: Option<ExitStatus> = None;
        let mut peak: Option<u64> = None;

        let stop = {
            let stdout_pump = pump(stdout, &mut stdout_buf, cap);
            let stderr_pump = pump(stderr, &mut stderr_buf, cap);
            tokio::pin!(stdout_pump, stderr_pump);
            let mut stdout_open = true;
            let mut stderr_open = true;

            let deadline = tokio::time::sleep(limits.timeout());
            tokio::pin!(deadline);
            let mut sampler = tokio::time::interval(self.settings.sample_interval);
            sampler.set_missed_tick_behavior(MissedTickBehavior::Delay);

            let stop = loop {
                if exit.is_some() && !stdout_open && !stderr_open {
                    break Stop::Finished;
                }
                tokio::select! {
                    res = &mut stdout_pump, if stdout_open => {
                        stdout_open = false;
                        if read_result(res, "stdout")? {
                            stdout_truncated = true;
                            break Stop::Limit(ExitKind::OutputTruncated);
                        }
                    }
                    res = &mut stderr_pump, if stderr_open => {
                        stderr_open = false;
                        if read_result(res, "stderr")? {
                            stderr_truncated = true;
                            break Stop::Limit(ExitKind::OutputTruncated);
                        }
                    }
                    status = child.wait(), if exit.is_none() => {
                        let status = status
                            .map_err(|e| EngineError::limiter(format!("failed to wait for process: {e}")))?;
                        exit = Some(status);
                        // Descendants holding the pipes get a grace period, not the full timeout.
                        let linger = (Instant::now() + self.settings.kill_grace).min(start + limits.timeout());
                        deadline.as_mut().reset(linger.into());
                    }
                    () = &mut deadline => {
                        break if exit.is_some() { Stop::Lingered } else { Stop::Limit(ExitKind::Timeout) };
                    }
                    _ = sampler.tick() => {
                        if let Some(bytes) = group.resident_bytes() {
                            peak = Some(peak.map_or(bytes, |p| p.max(bytes)));
                            if bytes > limits.memory_bytes() {
                                break Stop::Limit(ExitKind::MemoryExceeded);
                            }
                        }
                    }
                }
            };

            if !matches!(stop, Stop::Finished) {
                let status = self.terminate(&mut child, &group).await;
                exit = exit.or(status);

                // The group is dead, so the pipes are closing. Keep what is left.
                let drain = async {
                    if stdout_open && matches!((&mut stdout_pump).await, Ok(true)) {
                        stdout_truncated = true;
                    }
                    if stderr_open && matches!((&mut stderr_pump).await, Ok(true)) {
                        stderr_truncated = true;
                    }
                };
                if tokio::time::timeout(self.settings.kill_grace, drain).await.is_err() {
                    warn!("Output pipes still open after termination");
                }
            }
            stop
        };

        group.kill_survivors();
        group.disarm();
        feeder.abort();

        let elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        let stdout = String::from_utf8_lossy(&stdout_buf).into_owned();
        let stderr = String::from_utf8_lossy(&stderr_buf).into_owned();
        let (exit_code, signal) = exit.map_or((None, None), split_status);

        let status = match stop {
            Stop::Limit(kind) => kind,
            Stop::Finished | Stop::Lingered => classify_exit(exit_code, signal, &stderr),
        };

        debug!(
            status = %status,
            exit_code = ?exit_code,
            signal = ?signal,
            elapsed_ms,
            peak_kb = ?peak.map(|b| b / 1024),
            "Confined process finished"
        );

        Ok(ExecutionResult {
            status,
            exit_code,
            signal,
            stdout,
            stderr,
            stdout_truncated,
            stderr_truncated,
            elapsed_ms,
            peak_memory_kb: peak.map(|b| b / 1024),
        })
    }
}

/// Why the supervision loop ended.
#[derive(Debug, Clone, Copy)]
enum Stop {
    /// Process exited and both pipes reached EOF.
    Finished,
    /// Process exited but descendants held the pipes past the grace period.
    Lingered,
    /// A ceiling fired.
    Limit(ExitKind),
}

/// Classify a process that ended without the limiter stepping in.
fn classify_exit(exit_code: Option<i32>, signal: Option<i32>, stderr: &str) -> ExitKind {
    let lowered = stderr.to_lowercase();
    let allocation_failed = ALLOCATION_FAILURE_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker));

    match (exit_code, signal) {
        (_, Some(sig)) if is_cpu_limit_signal(sig) => ExitKind::Timeout,
        (_, Some(_)) if allocation_failed => ExitKind::MemoryExceeded,
        (_, Some(_)) => ExitKind::Signaled,
        (Some(code), None) if code != 0 && allocation_failed => ExitKind::MemoryExceeded,
        _ => ExitKind::Normal,
    }
}

#[cfg(unix)]
fn is_cpu_limit_signal(sig: i32) -> bool {
    sig == nix::sys::signal::Signal::SIGXCPU as i32
}

#[cfg(not(unix))]
const fn is_cpu_limit_signal(_sig: i32) -> bool {
    false
}

#[cfg(unix)]
fn split_status(status: ExitStatus) -> (Option<i32>, Option<i32>) {
    use std::os::unix::process::ExitStatusExt;
    (status.code(), status.signal())
}

#[cfg(not(unix))]
fn split_status(status: ExitStatus) -> (Option<i32>, Option<i32>) {
    (status.code(), None)
}

fn read_result(res: std::io::Result<bool>, stream: &str) -> Result<bool> {
    res.map_err(|e| EngineError::limiter(format!("failed to read {stream}: {e}")))
}

/// Copy `reader` into `buf` until EOF or until more than `cap` bytes arrive.
///
/// Returns `true` when output was cut. The buffer then holds exactly `cap`
/// bytes.
async fn pump<R: AsyncRead + Unpin>(
    mut reader: R,
    buf: &mut Vec<u8>,
    cap: usize,
) -> std::io::Result<bool> {
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(false);
        }
        let room = cap.saturating_sub(buf.len());
        if n > room {
            buf.extend_from_slice(&chunk[..room]);
            return Ok(true);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

async fn feed_stdin(mut stdin: ChildStdin, input: Vec<u8>) {
    if let Err(e) = stdin.write_all(&input).await {
        // A program that exits without reading its input is not an error.
        if e.kind() != std::io::ErrorKind::BrokenPipe {
            debug!(error = %e, "Failed to write stdin");
        }
    }
    // Dropping closes the pipe so the child sees EOF.
}

/// Process group of a spawned child. Kills the whole group on drop.
struct ProcessGroup {
    pgid: Option<u32>,
}

impl ProcessGroup {
    fn of(child: &Child) -> Self {
        Self { pgid: child.id() }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }

    fn resident_bytes(&self) -> Option<u64> {
        memory::group_resident_bytes(self.pgid?)
    }

    #[cfg(unix)]
    fn send(&self, signal: nix::sys::signal::Signal) {
        use nix::sys::signal::killpg;
        use nix::unistd::Pid;

        let Some(pgid) = self.pgid.and_then(|p| i32::try_from(p).ok()) else {
            return;
        };
        if let Err(e) = killpg(Pid::from_raw(pgid), signal) {
            if e != nix::errno::Errno::ESRCH {
                warn!(pgid, signal = %signal, error = %e, "Failed to signal process group");
            }
        }
    }

    /// SIGKILL the group only while it still has members.
    ///
    /// Once the leader is reaped, its pid names our group only as long as
    /// some member is alive; with none left it may belong to a new process.
    fn kill_survivors(&self) {
        let members = self
            .pgid
            .and_then(memory::group_usage)
            .map_or(0, |usage| usage.members);
        if members > 0 {
            debug!(members, "Killing surviving group members");
            self.kill();
        }
    }

    #[cfg(unix)]
    fn terminate(&self) {
        self.send(nix::sys::signal::Signal::SIGTERM);
    }

    #[cfg(unix)]
    fn kill(&self) {
        self.send(nix::sys::signal::Signal::SIGKILL);
    }

    // Without process groups the child handle's own kill is all there is.
    #[cfg(not(unix))]
    const fn terminate(&self) {}

    #[cfg(not(unix))]
    const fn kill(&self) {}
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Own process group plus rlimit backstops, applied between fork and exec.
#[cfg(unix)]
#[allow(unsafe_code)]
fn harden(cmd: &mut Command, limits: &ExecutionLimits, address_space_factor: u64) {
    use nix::sys::resource::{setrlimit, Resource};

    cmd.process_group(0);

    let cpu_seconds = limits.timeout_ms.div_ceil(1000) + 1;
    let address_space = (address_space_factor > 0)
        .then(|| limits.memory_bytes().saturating_mul(address_space_factor));

    // SAFETY: the hook runs in the forked child before exec. It only calls
    // setrlimit, which is async-signal-safe, and does not allocate.
    unsafe {
        cmd.pre_exec(move || {
            setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
            setrlimit(Resource::RLIMIT_CPU, cpu_seconds, cpu_seconds + 1)?;
            #[cfg(target_os = "linux")]
            if let Some(bytes) = address_space {
                setrlimit(Resource::RLIMIT_AS, bytes, bytes)?;
            }
            #[cfg(not(target_os = "linux"))]
            let _ = address_space;
            Ok(())
        });
    }
}
