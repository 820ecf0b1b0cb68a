//! Process supervision.
//!
//! The [`ProcessSupervisor`] owns every child process of a session. Callers
//! only ever hold an opaque [`ProcessId`]; the `Child` itself never leaves the
//! supervisor's table, so there is exactly one place that can wait on or kill
//! it.

use crate::error::{ApiError, Result};
use crossbeam_channel::bounded;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const WATCH_INTERVAL: Duration = Duration::from_millis(50);
/// How long to wait for captured output once a helper's group has been killed.
const DRAIN_WAIT: Duration = Duration::from_millis(200);

/// A program plus its fixed arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelperCommand {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory, inherited when unset.
    #[serde(default)]
    pub current_dir: Option<PathBuf>,
}

impl HelperCommand {
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
        }
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

impl fmt::Display for HelperCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Destination for a child's stdout or stderr.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputSink {
    /// Append to a file.
    File(PathBuf),
    /// Forward line by line to the `log` facade.
    Log,
    /// Share the parent's stream.
    Inherit,
    Discard,
}

/// Opaque handle to a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(u64);

/// Exit code and captured stdout of a one-shot helper.
#[derive(Debug, Clone)]
pub struct HelperOutput {
    pub code: Option<i32>,
    pub stdout: String,
}

impl HelperOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

struct Supervised {
    name: String,
    child: Child,
}

/// Owns and supervises child processes.
pub struct ProcessSupervisor {
    table: Arc<Mutex<HashMap<ProcessId, Supervised>>>,
    next_id: AtomicU64,
    watchers: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            watchers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn a long-running process and take ownership of it.
    ///
    /// `extra_args` are appended after the command's own arguments.
    pub fn spawn(
        &self,
        name: &str,
        command: &HelperCommand,
        extra_args: &[String],
        stdout: OutputSink,
        stderr: OutputSink,
    ) -> Result<ProcessId> {
        let mut cmd = command.command();
        cmd.args(extra_args);
        cmd.stdin(Stdio::null());
        cmd.stdout(stdio_for(&stdout)?);
        cmd.stderr(stdio_for(&stderr)?);

        log::info!("[PROCESS] Starting {}: {} {}", name, command, extra_args.join(" "));
        let mut child = cmd.spawn().map_err(|source| ApiError::Spawn {
            command: command.to_string(),
            source,
        })?;

        if stdout == OutputSink::Log {
            if let Some(out) = child.stdout.take() {
                forward_lines(name.to_string(), out, log::Level::Info);
            }
        }
        if stderr == OutputSink::Log {
            if let Some(err) = child.stderr.take() {
                forward_lines(name.to_string(), err, log::Level::Warn);
            }
        }

        let id = ProcessId(self.next_id.fetch_add(1, Ordering::Relaxed));
        log::debug!("[PROCESS] {} started with pid {}", name, child.id());
        self.lock().insert(
            id,
            Supervised {
                name: name.to_string(),
                child,
            },
        );
        Ok(id)
    }

    /// Run a helper to completion, capturing stdout.
    ///
    /// Blocks for at most `timeout`, including the time spent collecting
    /// output. A helper still running after that is killed together with
    /// anything it started and reported as [`ApiError::HelperTimeout`]. If the
    /// helper exits but something it left behind keeps its output open, the
    /// leftovers are killed at the deadline and the output read so far is
    /// returned.
    pub fn run_and_wait(&self, command: &HelperCommand, timeout: Duration) -> Result<HelperOutput> {
        log::debug!("[PROCESS] Running helper: {}", command);
        let deadline = Instant::now() + timeout;
        let mut cmd = command.command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        own_process_group(&mut cmd);
        let mut child = cmd.spawn().map_err(|source| ApiError::Spawn {
            command: command.to_string(),
            source,
        })?;

        // The reader is never joined: a stray subprocess may hold the pipe.
        let (out_tx, out_rx) = bounded(1);
        let stdout = child.stdout.take();
        thread::spawn(move || {
            let mut captured = String::new();
            if let Some(mut out) = stdout {
                let _ = out.read_to_string(&mut captured);
            }
            let _ = out_tx.send(captured);
        });
        if let Some(err) = child.stderr.take() {
            forward_lines(command.program.display().to_string(), err, log::Level::Warn);
        }

        let status = match wait_until(&mut child, deadline)? {
            Some(status) => status,
            None => {
                log::warn!("[PROCESS] Helper timed out, killing: {}", command);
                kill_group(&mut child);
                let _ = child.wait();
                return Err(ApiError::HelperTimeout {
                    command: command.to_string(),
                    timeout,
                });
            }
        };

        let stdout = match out_rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok(captured) => captured,
            Err(_) => {
                log::warn!(
                    "[PROCESS] Helper exited but its output is still held open, killing leftovers: {}",
                    command
                );
                kill_group(&mut child);
                out_rx.recv_timeout(DRAIN_WAIT).unwrap_or_default()
            }
        };
        Ok(HelperOutput {
            code: status.code(),
            stdout,
        })
    }

    /// Stop a process: wait up to `grace` for it to exit on its own, then
    /// kill it. Unknown or already-exited processes are a no-op.
    ///
    /// Returns `true` if a forced kill was needed.
    pub fn terminate(&self, id: ProcessId, grace: Duration) -> Result<bool> {
        let Some(mut entry) = self.lock().remove(&id) else {
            return Ok(false);
        };

        if let Some(status) = wait_until(&mut entry.child, Instant::now() + grace)? {
            log::info!("[PROCESS] {} exited ({})", entry.name, status);
            return Ok(false);
        }

        log::warn!(
            "[PROCESS] {} still running after {:?}, killing",
            entry.name,
            grace
        );
        if let Err(e) = entry.child.kill() {
            // Exited between the last poll and the kill.
            log::debug!("[PROCESS] kill {} failed: {}", entry.name, e);
        }
        let _ = entry.child.wait();
        Ok(true)
    }

    /// Whether the process is still owned and running.
    pub fn is_running(&self, id: ProcessId) -> bool {
        match self.lock().get_mut(&id) {
            Some(entry) => matches!(entry.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Exit code of an owned process that has exited on its own.
    pub fn exit_code(&self, id: ProcessId) -> Option<i32> {
        self.lock()
            .get_mut(&id)
            .and_then(|entry| entry.child.try_wait().ok().flatten())
            .and_then(|status| status.code())
    }

    pub fn pid(&self, id: ProcessId) -> Option<u32> {
        self.lock().get(&id).map(|entry| entry.child.id())
    }

    /// Call `on_exit` from a background thread if the process exits while
    /// still owned. Processes stopped through [`ProcessSupervisor::terminate`]
    /// do not trigger it.
    pub fn watch<F>(&self, id: ProcessId, on_exit: F)
    where
        F: FnOnce(Option<i32>) + Send + 'static,
    {
        let table = Arc::clone(&self.table);
        let handle = thread::spawn(move || loop {
            {
                let mut table = match table.lock() {
                    Ok(t) => t,
                    Err(poisoned) => poisoned.into_inner(),
                };
                let Some(entry) = table.get_mut(&id) else {
                    return;
                };
                match entry.child.try_wait() {
                    Ok(Some(status)) => {
                        log::warn!("[PROCESS] {} exited unexpectedly ({})", entry.name, status);
                        let code = status.code();
                        drop(table);
                        on_exit(code);
                        return;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        log::error!("[PROCESS] Cannot poll {}: {}", entry.name, e);
                        return;
                    }
                }
            }
            thread::sleep(WATCH_INTERVAL);
        });
        self.watchers_lock().push(handle);
    }

    /// Terminate everything still owned and join all watchers.
    pub fn shutdown_all(&self, grace: Duration) {
        let ids: Vec<ProcessId> = self.lock().keys().copied().collect();
        for id in ids {
            if let Err(e) = self.terminate(id, grace) {
                log::warn!("[PROCESS] Failed to terminate process: {}", e);
            }
        }
        self.join_watchers();
    }

    /// Join watcher threads. Each returns once its process has exited or been
    /// removed from the table.
    pub fn join_watchers(&self) {
        let watchers: Vec<JoinHandle<()>> = self.watchers_lock().drain(..).collect();
        for handle in watchers {
            let _ = handle.join();
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ProcessId, Supervised>> {
        match self.table.lock() {
            Ok(t) => t,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn watchers_lock(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        match self.watchers.lock() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        self.shutdown_all(Duration::ZERO);
    }
}

fn stdio_for(sink: &OutputSink) -> Result<Stdio> {
    Ok(match sink {
        OutputSink::File(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Stdio::from(file)
        }
        OutputSink::Log => Stdio::piped(),
        OutputSink::Inherit => Stdio::inherit(),
        OutputSink::Discard => Stdio::null(),
    })
}

fn forward_lines<R: Read + Send + 'static>(name: String, stream: R, level: log::Level) {
    thread::spawn(move || {
        let reader = BufReader::new(stream);
        for line in reader.lines().map_while(std::result::Result::ok) {
            log::log!(level, "[{}] {}", name, line);
        }
    });
}

/// Helpers lead their own process group so a timeout can reach everything
/// they started.
#[cfg(unix)]
fn own_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn own_process_group(_cmd: &mut Command) {}

#[cfg(unix)]
fn kill_group(child: &mut Child) {
    let pgid = child.id() as libc::pid_t;
    // SAFETY: kill(2) only sends a signal; a stale group id yields ESRCH.
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
    let _ = child.kill();
}

#[cfg(not(unix))]
fn kill_group(child: &mut Child) {
    let _ = child.kill();
}

fn wait_until(child: &mut Child, deadline: Instant) -> Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}
