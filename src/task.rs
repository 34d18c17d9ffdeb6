use crate::utils::errors::{ProcError, ProcResult};
use crate::utils::psutils::{find_executable, send_signal, signal_group};
use log::{debug, warn};
use nix::sys::signal::Signal;
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{ChildStdout, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How long to keep draining pipes after a timeout kill.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// What happens to the output of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputAction {
    /// Inherit the parent's stdout/stderr.
    Print,
    /// Redirect to the null device.
    Discard,
    /// Capture in memory; available from the completed result.
    #[default]
    Store,
    /// Pipe stdout for the caller to consume through [`Task::take_stdout`].
    Stream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Running,
    Completed,
    Killed,
}

/// Resource usage reported by the OS when the process was reaped.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceUsage {
    /// Peak resident set size, always in bytes.
    pub max_rss: u64,
    pub user_time: Duration,
    pub system_time: Duration,
}

/// Frozen result of a task that ran to completion.
#[derive(Debug, Clone)]
pub struct Completed {
    /// Exit code, or the negated signal number if the process was signaled.
    pub exit_code: i32,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub usage: ResourceUsage,
    /// Wall time between spawn and reap.
    pub elapsed: Duration,
}

#[derive(Debug)]
struct Lifecycle {
    state: TaskState,
    timed_out: bool,
    elapsed: Option<Duration>,
}

#[derive(Debug)]
struct Shared {
    pid: AtomicU32,
    lifecycle: Mutex<Lifecycle>,
}

/// Cloneable, thread-safe view of a [`Task`].
///
/// Signal delivery goes through the same lock the task takes right before
/// reaping, so a handle never signals a pid after it has been reaped.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    name: Arc<str>,
    shared: Arc<Shared>,
}

impl TaskHandle {
    fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            shared: Arc::new(Shared {
                pid: AtomicU32::new(0),
                lifecycle: Mutex::new(Lifecycle {
                    state: TaskState::Created,
                    timed_out: false,
                    elapsed: None,
                }),
            }),
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.shared.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pid of the process once spawned; stays readable after completion.
    pub fn pid(&self) -> Option<u32> {
        match self.shared.pid.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }

    pub fn state(&self) -> TaskState {
        self.lifecycle().state
    }

    /// True once the process exited, either naturally or killed.
    pub fn is_finished(&self) -> bool {
        matches!(self.state(), TaskState::Completed | TaskState::Killed)
    }

    /// Wall time of the process, known once it has been reaped.
    pub fn elapsed(&self) -> Option<Duration> {
        self.lifecycle().elapsed
    }

    /// Signals the process (and optionally its tree) if it is still running.
    pub fn send_signal(&self, sig: Signal, include_children: bool) -> ProcResult<()> {
        let lifecycle = self.lifecycle();
        match (lifecycle.state, self.pid()) {
            (TaskState::Running, Some(pid)) => send_signal(pid, sig, include_children),
            _ => Ok(()),
        }
    }

    fn mark_running(&self, pid: u32) {
        self.shared.pid.store(pid, Ordering::Release);
        self.lifecycle().state = TaskState::Running;
    }

    /// Watchdog side of the handoff: kills the tree unless the task already exited.
    fn expire(&self) {
        let mut lifecycle = self.lifecycle();
        if lifecycle.state != TaskState::Running {
            return;
        }
        lifecycle.timed_out = true;
        if let Some(pid) = self.pid() {
            debug!("Deadline expired for \"{}\" ({}), killing its tree", self.name, pid);
            if let Err(e) = send_signal(pid, Signal::SIGKILL, true) {
                warn!("Failed to kill \"{}\" ({}): {}", self.name, pid, e);
            }
        }
    }

    /// Reaper side of the handoff. Returns whether the watchdog fired first.
    fn mark_exited(&self) -> bool {
        let mut lifecycle = self.lifecycle();
        lifecycle.state = if lifecycle.timed_out {
            TaskState::Killed
        } else {
            TaskState::Completed
        };
        lifecycle.timed_out
    }

    /// The process exited but its output outlived the deadline.
    fn mark_killed(&self) {
        let mut lifecycle = self.lifecycle();
        lifecycle.timed_out = true;
        lifecycle.state = TaskState::Killed;
    }

    fn kill_and_mark(&self) {
        let mut lifecycle = self.lifecycle();
        if let (TaskState::Running, Some(pid)) = (lifecycle.state, self.pid()) {
            let _ = send_signal(pid, Signal::SIGKILL, true);
        }
        lifecycle.state = TaskState::Killed;
    }

    fn set_elapsed(&self, elapsed: Duration) {
        self.lifecycle().elapsed = Some(elapsed);
    }
}

/// Registry of running tasks, for bulk termination on shutdown.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    tasks: Arc<Mutex<HashMap<u32, TaskHandle>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<u32, TaskHandle>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, pid: u32, handle: TaskHandle) {
        self.tasks().insert(pid, handle);
    }

    fn unregister(&self, pid: u32) {
        self.tasks().remove(&pid);
    }

    pub fn len(&self) -> usize {
        self.tasks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks().is_empty()
    }

    pub fn running(&self) -> Vec<TaskHandle> {
        self.tasks().values().cloned().collect()
    }

    /// Signals every registered task and its tree. Returns how many were signaled.
    pub fn kill_all(&self, sig: Signal) -> usize {
        // Snapshot first so the registry lock is not held while signaling
        let handles = self.running();
        handles
            .iter()
            .filter(|handle| match handle.send_signal(sig, true) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Failed to signal \"{}\": {}", handle.name(), e);
                    false
                }
            })
            .count()
    }
}

/// Common seam for anything that runs a task to completion.
pub trait Workload: Send {
    fn handle(&self) -> TaskHandle;
    fn run(&mut self, timeout: Option<Duration>) -> ProcResult<()>;
}

/// Spawns a process and captures its output.
#[derive(Debug)]
pub struct Task {
    path: PathBuf,
    args: Vec<String>,
    output_action: OutputAction,
    input_path: Option<PathBuf>,
    registry: Option<TaskRegistry>,
    handle: TaskHandle,
    child: Option<std::process::Child>,
    started: Option<Instant>,
    completed: Option<Completed>,
}

impl Task {
    /// Creates a task. Relative executable names are resolved against `PATH`.
    pub fn new<S: AsRef<str>>(executable: &str, args: &[S]) -> ProcResult<Self> {
        if executable.is_empty() {
            return Err(ProcError::ExecutableNotFound(String::new()));
        }

        let path = if Path::new(executable).is_absolute() {
            PathBuf::from(executable)
        } else {
            find_executable(executable)?
        };

        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| executable.to_string());

        Ok(Self {
            path,
            args: args.iter().map(|arg| arg.as_ref().to_string()).collect(),
            output_action: OutputAction::default(),
            input_path: None,
            registry: None,
            handle: TaskHandle::new(&name),
            child: None,
            started: None,
            completed: None,
        })
    }

    /// Builds, runs and waits for a task.
    pub fn spawn<S: AsRef<str>>(
        executable: &str,
        args: &[S],
        output_action: OutputAction,
        input_path: Option<&Path>,
    ) -> ProcResult<Self> {
        let mut task = Self::new(executable, args)?.with_output(output_action);
        if let Some(input_path) = input_path {
            task = task.with_input(input_path);
        }
        task.run(true, None)?;
        Ok(task)
    }

    /// A fresh, not yet started task with the same configuration.
    pub fn copying(task: &Task) -> Self {
        Self {
            path: task.path.clone(),
            args: task.args.clone(),
            output_action: task.output_action,
            input_path: task.input_path.clone(),
            registry: task.registry.clone(),
            handle: TaskHandle::new(task.name()),
            child: None,
            started: None,
            completed: None,
        }
    }

    /// A task launching a Java archive through `java` on `PATH`.
    pub fn jar(jar: &str, jar_args: &[String], jvm_opts: &[String]) -> ProcResult<Self> {
        Self::new("java", &java_args(jar, jar_args, jvm_opts))
    }

    pub fn with_output(mut self, output_action: OutputAction) -> Self {
        self.output_action = output_action;
        self
    }

    pub fn with_input<P: AsRef<Path>>(mut self, input_path: P) -> Self {
        self.input_path = Some(input_path.as_ref().to_path_buf());
        self
    }

    pub fn with_registry(mut self, registry: &TaskRegistry) -> Self {
        self.registry = Some(registry.clone());
        self
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn output_action(&self) -> OutputAction {
        self.output_action
    }

    pub fn handle(&self) -> TaskHandle {
        self.handle.clone()
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.pid()
    }

    pub fn state(&self) -> TaskState {
        self.handle.state()
    }

    pub fn completed(&self) -> Option<&Completed> {
        self.completed.as_ref()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.completed.as_ref().map(|c| c.exit_code)
    }

    pub fn stdout(&self) -> Option<&str> {
        self.completed.as_ref().and_then(|c| c.stdout.as_deref())
    }

    pub fn stderr(&self) -> Option<&str> {
        self.completed.as_ref().and_then(|c| c.stderr.as_deref())
    }

    /// Takes the piped stdout of a running [`OutputAction::Stream`] task.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.as_mut().and_then(|child| child.stdout.take())
    }

    fn stdio(&self) -> (Stdio, Stdio) {
        match self.output_action {
            OutputAction::Print => (Stdio::inherit(), Stdio::inherit()),
            OutputAction::Discard => (Stdio::null(), Stdio::null()),
            OutputAction::Store => (Stdio::piped(), Stdio::piped()),
            OutputAction::Stream => (Stdio::piped(), Stdio::null()),
        }
    }

    /// Spawns the process and, if `wait`, blocks until it exits or `timeout` elapses.
    pub fn run(&mut self, wait: bool, timeout: Option<Duration>) -> ProcResult<&mut Self> {
        if self.handle.state() != TaskState::Created {
            return Err(ProcError::Other(format!("Task \"{}\" has already been run", self.name())));
        }

        let spawn_error = |source| ProcError::Spawn {
            path: self.path.clone(),
            source,
        };

        let stdin = match &self.input_path {
            Some(input) => Stdio::from(File::open(input).map_err(spawn_error)?),
            None => Stdio::null(),
        };
        let (stdout, stderr) = self.stdio();

        let started = Instant::now();
        let child = Command::new(&self.path)
            .args(&self.args)
            .stdin(stdin)
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0)
            .spawn()
            .map_err(spawn_error)?;

        let pid = child.id();
        debug!("Spawned \"{}\" with pid {}", self.name(), pid);

        self.handle.mark_running(pid);
        if let Some(registry) = &self.registry {
            registry.register(pid, self.handle.clone());
        }
        self.child = Some(child);
        self.started = Some(started);

        if wait {
            self.wait(timeout)?;
        }
        Ok(self)
    }

    /// Waits for the process to exit. On timeout the whole tree is killed and
    /// a timeout error carrying any captured output is returned.
    pub fn wait(&mut self, timeout: Option<Duration>) -> ProcResult<&mut Self> {
        if self.completed.is_some() {
            return Ok(self);
        }

        let mut child = self
            .child
            .take()
            .ok_or_else(|| ProcError::Other(format!("Task \"{}\" is not running", self.name())))?;
        let pid = child.id();
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let (done_tx, done_rx) = mpsc::channel::<()>();
        let watchdog = timeout.map(|timeout| {
            let handle = self.handle.clone();
            thread::spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = done_rx.recv_timeout(timeout) {
                    handle.expire();
                }
            })
        });

        let reaped = reap(&self.handle, pid);
        drop(done_tx);
        if let Some(watchdog) = watchdog {
            let _ = watchdog.join();
        }

        if let Some(registry) = &self.registry {
            registry.unregister(pid);
        }

        let (status, usage, mut timed_out) = reaped?;
        let elapsed = self.started.map(|s| s.elapsed()).unwrap_or_default();
        self.handle.set_elapsed(elapsed);

        let drain_deadline = if timed_out {
            Some(Instant::now() + DRAIN_GRACE)
        } else {
            deadline
        };
        let mut out = stdout.as_ref().map(|rx| collect(rx, drain_deadline));
        let mut err = stderr.as_ref().map(|rx| collect(rx, drain_deadline));

        // Descendants still holding the pipes at the deadline share the group
        if !timed_out && (matches!(out, Some(None)) || matches!(err, Some(None))) {
            debug!(
                "Output of \"{}\" ({}) still open at the deadline, killing its group",
                self.name(),
                pid
            );
            timed_out = true;
            self.handle.mark_killed();
            if let Err(e) = signal_group(pid, Signal::SIGKILL) {
                warn!("Failed to kill the group of \"{}\" ({}): {}", self.name(), pid, e);
            }
            let grace = Some(Instant::now() + DRAIN_GRACE);
            if let (Some(rx), Some(None)) = (&stdout, &out) {
                out = Some(collect(rx, grace));
            }
            if let (Some(rx), Some(None)) = (&stderr, &err) {
                err = Some(collect(rx, grace));
            }
        }
        let stdout = out.map(Option::unwrap_or_default);
        let stderr = err.map(Option::unwrap_or_default);

        if timed_out {
            return Err(ProcError::Timeout {
                name: self.name().to_string(),
                timeout: timeout.unwrap_or_default(),
                stdout,
                stderr,
            });
        }

        let exit_code = status
            .code()
            .unwrap_or_else(|| -status.signal().unwrap_or(0));
        debug!(
            "\"{}\" ({}) exited with code {} after {:?}",
            self.name(),
            pid,
            exit_code,
            elapsed
        );

        let store = self.output_action == OutputAction::Store;
        self.completed = Some(Completed {
            exit_code,
            stdout: if store { Some(stdout.unwrap_or_default()) } else { None },
            stderr: if store { Some(stderr.unwrap_or_default()) } else { None },
            usage,
            elapsed,
        });
        Ok(self)
    }

    /// Runs the task on a background thread. `exit_handler` is called exactly once.
    pub fn run_async<F>(mut self, timeout: Option<Duration>, exit_handler: F) -> JoinHandle<Task>
    where
        F: FnOnce(&Task, Option<ProcError>) + Send + 'static,
    {
        thread::spawn(move || {
            let error = self.run(true, timeout).err();
            exit_handler(&self, error);
            self
        })
    }

    /// Signals the process (and optionally its tree). No-op once completed.
    pub fn send_signal(&self, sig: Signal, include_children: bool) -> ProcResult<&Self> {
        self.handle.send_signal(sig, include_children)?;
        Ok(self)
    }

    /// Fails if the exit code is non-zero or, with `ensure_output`, if stdout is empty.
    pub fn raise_if_failed(&self, ensure_output: bool, message: Option<&str>) -> ProcResult<&Self> {
        let auto_message = match self.exit_code() {
            Some(code) if code != 0 => Some(format!(
                "Process \"{}\" returned exit code: {}",
                self.name(),
                code
            )),
            _ if ensure_output && self.stdout().is_none_or(str::is_empty) => {
                Some(format!("Process \"{}\" returned no output.", self.name()))
            }
            _ => None,
        };

        let Some(auto_message) = auto_message else {
            return Ok(self);
        };

        let process_output = self
            .stderr()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .or_else(|| self.stdout().map(str::trim).filter(|s| !s.is_empty()));

        let lines: Vec<&str> = [message, Some(auto_message.as_str()), process_output]
            .into_iter()
            .flatten()
            .filter(|line| !line.is_empty())
            .collect();

        Err(ProcError::ExitStatus(lines.join("\n")))
    }
}

impl Workload for Task {
    fn handle(&self) -> TaskHandle {
        Task::handle(self)
    }

    fn run(&mut self, timeout: Option<Duration>) -> ProcResult<()> {
        Task::run(self, true, timeout).map(|_| ())
    }
}

/// Argument list passed to `java` in order to launch `jar`.
pub fn java_args(jar: &str, jar_args: &[String], jvm_opts: &[String]) -> Vec<String> {
    let mut args = jvm_opts.to_vec();
    args.push("-jar".to_string());
    args.push(jar.to_string());
    args.extend_from_slice(jar_args);
    args
}

fn drain<R: Read + Send + 'static>(mut reader: R) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buffer = Vec::new();
        let _ = reader.read_to_end(&mut buffer);
        let _ = tx.send(buffer);
    });
    rx
}

/// Output of a drain thread, or `None` if it is still open at `deadline`.
fn collect(rx: &Receiver<Vec<u8>>, deadline: Option<Instant>) -> Option<String> {
    let buffer = match deadline {
        Some(deadline) => match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok(buffer) => buffer,
            Err(RecvTimeoutError::Timeout) => return None,
            Err(RecvTimeoutError::Disconnected) => Vec::new(),
        },
        None => rx.recv().unwrap_or_default(),
    };
    Some(String::from_utf8_lossy(&buffer).trim_end().to_string())
}

fn timeval_to_duration(tv: libc::timeval) -> Duration {
    Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
}

/// `ru_maxrss` is kilobytes on Linux and bytes on macOS.
fn max_rss_bytes(max_rss: libc::c_long) -> u64 {
    let max_rss = max_rss.max(0) as u64;
    if cfg!(target_os = "macos") { max_rss } else { max_rss * 1024 }
}

/// Blocks until `pid` exits, leaving it unreaped.
fn wait_exit(pid: u32) -> std::io::Result<()> {
    loop {
        // SAFETY: `info` is a zeroed, properly aligned siginfo_t owned by this frame.
        let result = unsafe {
            let mut info: libc::siginfo_t = std::mem::zeroed();
            libc::waitid(
                libc::P_PID,
                pid as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        if result == 0 {
            return Ok(());
        }
        let error = std::io::Error::last_os_error();
        if error.kind() != std::io::ErrorKind::Interrupted {
            return Err(error);
        }
    }
}

/// Reaps an exited child, returning its status and resource usage.
fn wait4(pid: u32) -> std::io::Result<(ExitStatus, ResourceUsage)> {
    loop {
        let mut status: libc::c_int = 0;
        // SAFETY: `status` and `usage` are valid for writes for the duration of the call.
        let (result, usage) = unsafe {
            let mut usage: libc::rusage = std::mem::zeroed();
            let result = libc::wait4(pid as libc::pid_t, &mut status, 0, &mut usage);
            (result, usage)
        };
        if result == pid as libc::pid_t {
            let usage = ResourceUsage {
                max_rss: max_rss_bytes(usage.ru_maxrss),
                user_time: timeval_to_duration(usage.ru_utime),
                system_time: timeval_to_duration(usage.ru_stime),
            };
            return Ok((ExitStatus::from_raw(status), usage));
        }
        let error = std::io::Error::last_os_error();
        if error.kind() != std::io::ErrorKind::Interrupted {
            return Err(error);
        }
    }
}

/// Waits for exit, settles the watchdog handoff, then reaps.
fn reap(handle: &TaskHandle, pid: u32) -> ProcResult<(ExitStatus, ResourceUsage, bool)> {
    if let Err(source) = wait_exit(pid) {
        handle.kill_and_mark();
        let _ = wait4(pid);
        return Err(ProcError::Wait { pid, source });
    }

    let timed_out = handle.mark_exited();
    let (status, usage) = wait4(pid).map_err(|source| ProcError::Wait { pid, source })?;
    Ok((status, usage, timed_out))
}
