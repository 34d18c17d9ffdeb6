use crate::utils::errors::{ProcError, ProcResult};
use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use regex::Regex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::ffi::OsStr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, ThreadKind, UpdateKind};

/// Snapshot of the live process table. Command lines are only loaded on request.
fn process_table(with_cmd: bool) -> System {
    let mut kind = ProcessRefreshKind::nothing().with_tasks();
    if with_cmd {
        kind = kind.with_cmd(UpdateKind::OnlyIfNotSet);
    }
    let mut system = System::new();
    system.refresh_processes_specifics(ProcessesToUpdate::All, true, kind);
    system
}

fn is_thread(process: &sysinfo::Process) -> bool {
    matches!(process.thread_kind(), Some(ThreadKind::Userland))
}

fn push_unique(ids: &mut Vec<u32>, seen: &mut HashSet<u32>, id: u32) {
    if seen.insert(id) {
        ids.push(id);
    }
}

/// Returns `pid` followed by all of its live descendants, breadth first,
/// optionally interleaving the thread ids of every process.
///
/// A pid that no longer exists yields an empty list.
pub fn pid_tree(pid: u32, include_threads: bool) -> Vec<u32> {
    let system = process_table(false);
    let root = Pid::from_u32(pid);

    if system.process(root).is_none() {
        return Vec::new();
    }

    let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for (child, process) in system.processes() {
        if is_thread(process) {
            continue;
        }
        if let Some(parent) = process.parent() {
            children.entry(parent).or_default().push(*child);
        }
    }

    let mut ids = Vec::new();
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([root]);

    while let Some(current) = queue.pop_front() {
        push_unique(&mut ids, &mut seen, current.as_u32());

        if include_threads {
            if let Some(tasks) = system.process(current).and_then(|p| p.tasks()) {
                let mut tids: Vec<u32> = tasks.iter().map(|t| t.as_u32()).collect();
                tids.sort_unstable();
                for tid in tids {
                    push_unique(&mut ids, &mut seen, tid);
                }
            }
        }

        if let Some(kids) = children.get_mut(&current) {
            kids.sort_unstable();
            queue.extend(kids.iter().copied());
        }
    }

    ids
}

fn deliver(pid: u32, sig: Signal) -> ProcResult<()> {
    match signal::kill(nix::unistd::Pid::from_raw(pid as i32), sig) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => Err(ProcError::NoSuchProcess(pid)),
        Err(source) => Err(ProcError::Signal { pid, source }),
    }
}

/// Sends `sig` to `pid`. With `include_children` every descendant is signaled
/// first; descendants that already exited are skipped.
pub fn send_signal(pid: u32, sig: Signal, include_children: bool) -> ProcResult<()> {
    if include_children {
        for child in pid_tree(pid, false).into_iter().skip(1) {
            match deliver(child, sig) {
                Ok(()) | Err(ProcError::NoSuchProcess(_)) => {}
                Err(e) => warn!("Could not deliver {} to child {}: {}", sig, child, e),
            }
        }
    }
    debug!("Sending {} to {}", sig, pid);
    deliver(pid, sig)
}

/// Sends `sig` to every member of the process group `pgid`.
pub fn signal_group(pgid: u32, sig: Signal) -> ProcResult<()> {
    debug!("Sending {} to group {}", sig, pgid);
    match signal::killpg(nix::unistd::Pid::from_raw(pgid as i32), sig) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => Err(ProcError::NoSuchProcess(pgid)),
        Err(source) => Err(ProcError::Signal { pid: pgid, source }),
    }
}

/// Options for [`find_pids`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FindOptions {
    /// Treat the pattern as a regular expression instead of an exact name.
    pub regex: bool,
    /// Match against the full command line instead of the process name.
    pub match_arguments: bool,
    /// Stop at the first (lowest) matching pid.
    pub only_first: bool,
}

/// Finds pids by exact name or regex. Results are sorted ascending.
pub fn find_pids(pattern: &str, options: FindOptions) -> ProcResult<Vec<u32>> {
    let regex = if options.regex { Some(Regex::new(pattern)?) } else { None };
    let system = process_table(options.match_arguments);

    let mut candidates: Vec<(&Pid, &sysinfo::Process)> = system
        .processes()
        .iter()
        .filter(|(_, process)| !is_thread(process))
        .collect();
    candidates.sort_unstable_by_key(|(pid, _)| **pid);

    let mut pids = Vec::new();
    for (pid, process) in candidates {
        let haystack = if options.match_arguments {
            process
                .cmd()
                .iter()
                .map(|arg| arg.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        } else {
            process.name().to_string_lossy().to_string()
        };

        let found = match &regex {
            Some(regex) => regex.is_match(&haystack),
            None => haystack == pattern,
        };

        if found {
            pids.push(pid.as_u32());
            if options.only_first {
                break;
            }
        }
    }

    Ok(pids)
}

/// Signals every process named exactly `name`. Returns whether any was found.
pub fn killall(name: &str, sig: Signal) -> ProcResult<bool> {
    let pids = find_pids(name, FindOptions::default())?;
    for pid in &pids {
        let _ = send_signal(*pid, sig, false);
    }
    Ok(!pids.is_empty())
}

/// pkill-like: signals every process whose command line matches `pattern`.
pub fn pkill(pattern: &str, sig: Signal) -> ProcResult<bool> {
    let options = FindOptions {
        regex: true,
        match_arguments: true,
        only_first: false,
    };
    let pids = find_pids(pattern, options)?;
    for pid in &pids {
        let _ = send_signal(*pid, sig, false);
    }
    Ok(!pids.is_empty())
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Resolves an executable name against `PATH`, returning an absolute path.
pub fn find_executable(executable: &str) -> ProcResult<PathBuf> {
    let candidate = Path::new(executable);

    if candidate.components().count() > 1 {
        return if is_executable(candidate) {
            Ok(std::path::absolute(candidate)?)
        } else {
            Err(ProcError::ExecutableNotFound(executable.to_string()))
        };
    }

    let paths = std::env::var_os("PATH").unwrap_or_default();
    std::env::split_paths(&paths)
        .map(|dir| dir.join(executable))
        .find(|path| is_executable(path))
        .and_then(|path| std::path::absolute(path).ok())
        .ok_or_else(|| ProcError::ExecutableNotFound(executable.to_string()))
}

pub fn is_root() -> bool {
    users::get_effective_uid() == 0
}

/// Fails with `PermissionDenied` unless the effective user is root.
pub fn require_root() -> ProcResult<()> {
    if is_root() {
        return Ok(());
    }
    let user = users::get_effective_username()
        .as_deref()
        .map(OsStr::to_string_lossy)
        .map(|name| name.to_string())
        .unwrap_or_else(|| users::get_effective_uid().to_string());
    Err(ProcError::PermissionDenied(user))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::CommandExt;
    use std::process::{Child, Command};
    use std::thread::sleep;
    use std::time::{Duration, Instant};

    const NONEXISTENT_PID: u32 = 4_000_000;

    fn spawn(cmd: &str, args: &[&str]) -> Child {
        Command::new(cmd).args(args).spawn().unwrap()
    }

    // Alive means present and not a zombie waiting to be reaped
    fn is_alive(pid: u32) -> bool {
        let system = process_table(false);
        system
            .process(Pid::from_u32(pid))
            .map(|p| p.status() != sysinfo::ProcessStatus::Zombie)
            .unwrap_or(false)
    }

    #[test]
    fn test_pid_tree_childless() {
        let mut child = spawn("sleep", &["5"]);
        let tree = pid_tree(child.id(), false);
        assert_eq!(tree, vec![child.id()]);
        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn test_pid_tree_nonexistent() {
        assert!(pid_tree(NONEXISTENT_PID, false).is_empty());
        assert!(pid_tree(NONEXISTENT_PID, true).is_empty());
    }

    #[test]
    // Our own test process has at least the main thread
    fn test_pid_tree_with_threads() {
        let me = std::process::id();
        let tree = pid_tree(me, true);
        assert_eq!(tree.first(), Some(&me));
        let mut sorted = tree.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), tree.len());
    }

    #[test]
    fn test_pid_tree_includes_grandchildren() {
        let mut child = spawn("sh", &["-c", "sleep 30 & sleep 30 & wait"]);
        sleep(Duration::from_millis(300));
        let tree = pid_tree(child.id(), false);
        assert_eq!(tree[0], child.id());
        assert!(tree.len() >= 3, "tree: {:?}", tree);

        send_signal(child.id(), Signal::SIGKILL, true).unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn test_signal_fans_out_to_descendants() {
        let mut child = spawn("sh", &["-c", "sleep 30 & sleep 30 & wait"]);
        sleep(Duration::from_millis(300));
        let descendants: Vec<u32> = pid_tree(child.id(), false).into_iter().skip(1).collect();
        assert!(!descendants.is_empty());

        send_signal(child.id(), Signal::SIGKILL, true).unwrap();
        child.wait().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while descendants.iter().any(|pid| is_alive(*pid)) && Instant::now() < deadline {
            sleep(Duration::from_millis(50));
        }
        assert!(descendants.iter().all(|pid| !is_alive(*pid)));
    }

    #[test]
    // Members reparented away from the leader are still reached through the group
    fn test_signal_group() {
        let mut child = Command::new("sh")
            .args(["-c", "sleep 30 & sleep 30 & wait"])
            .process_group(0)
            .spawn()
            .unwrap();
        sleep(Duration::from_millis(300));
        let descendants: Vec<u32> = pid_tree(child.id(), false).into_iter().skip(1).collect();
        assert!(!descendants.is_empty());

        signal_group(child.id(), Signal::SIGKILL).unwrap();
        child.wait().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while descendants.iter().any(|pid| is_alive(*pid)) && Instant::now() < deadline {
            sleep(Duration::from_millis(50));
        }
        assert!(descendants.iter().all(|pid| !is_alive(*pid)));
        assert!(matches!(
            signal_group(child.id(), Signal::SIGKILL),
            Err(ProcError::NoSuchProcess(_))
        ));
    }

    #[test]
    fn test_signal_nonexistent_pid() {
        let result = send_signal(NONEXISTENT_PID, Signal::SIGTERM, true);
        assert!(matches!(result, Err(ProcError::NoSuchProcess(NONEXISTENT_PID))));
    }

    #[test]
    fn test_find_pids_by_command_line() {
        let mut child = spawn("sleep", &["7.123"]);
        sleep(Duration::from_millis(100));

        let options = FindOptions {
            regex: true,
            match_arguments: true,
            only_first: false,
        };
        let pids = find_pids(r"sleep 7\.123", options).unwrap();
        assert!(pids.contains(&child.id()));

        let exact = find_pids("sleep", FindOptions::default()).unwrap();
        assert!(exact.contains(&child.id()));

        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn test_find_pids_only_first() {
        let mut first = spawn("sleep", &["8.321"]);
        let mut second = spawn("sleep", &["8.321"]);
        sleep(Duration::from_millis(100));

        let options = FindOptions {
            regex: true,
            match_arguments: true,
            only_first: true,
        };
        let pids = find_pids(r"^sleep 8\.321$", options).unwrap();
        assert_eq!(pids.len(), 1);
        assert_eq!(pids[0], first.id().min(second.id()));

        for child in [&mut first, &mut second] {
            child.kill().unwrap();
            child.wait().unwrap();
        }
    }

    #[test]
    fn test_find_pids_invalid_regex() {
        let options = FindOptions {
            regex: true,
            ..Default::default()
        };
        assert!(matches!(find_pids("(", options), Err(ProcError::Pattern(_))));
    }

    #[test]
    fn test_pkill() {
        let mut child = spawn("sleep", &["9.456"]);
        sleep(Duration::from_millis(100));
        assert!(pkill(r"sleep 9\.456", Signal::SIGKILL).unwrap());
        child.wait().unwrap();
        assert!(!pkill(r"sleep 9\.456", Signal::SIGKILL).unwrap());
    }

    #[test]
    fn test_find_executable() {
        let sh = find_executable("sh").unwrap();
        assert!(sh.is_absolute());
        assert!(matches!(
            find_executable("definitely-not-a-real-binary-xyz"),
            Err(ProcError::ExecutableNotFound(_))
        ));
    }

    #[test]
    fn test_require_root_matches_euid() {
        assert_eq!(require_root().is_ok(), is_root());
    }
}
