use crate::energy_profiler::{EnergyProbe, ProbeClock, ProbeOutput};
use crate::task::{OutputAction, Task, TaskHandle};
use crate::utils::errors::{ProcError, ProcResult};
use crate::utils::psutils::{find_executable, pid_tree, require_root};
use log::{debug, warn};
use nix::sys::signal::Signal;
use std::collections::HashSet;
use std::io::{BufRead, BufReader};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

const CHUNK_START: &str = "*** Running tasks ***";
const CHUNK_END: &str = "ALL_TASKS";
/// Pid reported on the DEAD_TASKS row.
const DEAD_TASKS_PID: i64 = -1;

/// Makes powermetrics emit a sample immediately.
#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
const FLUSH_SIGNAL: Signal = Signal::SIGINFO;
#[cfg(not(any(target_os = "macos", target_os = "ios", target_os = "freebsd")))]
const FLUSH_SIGNAL: Signal = Signal::SIGUSR1;

/// Splits the helper's output stream into per-sample chunks of task rows.
#[derive(Debug, Default)]
struct ChunkSplitter {
    in_chunk: bool,
    lines: Vec<String>,
}

impl ChunkSplitter {
    /// Feeds one line; returns the chunk it completes, if any.
    fn feed(&mut self, line: &str) -> Option<Vec<String>> {
        let line = line.trim();
        if line.contains(CHUNK_START) {
            self.in_chunk = true;
            self.lines.clear();
        } else if line.starts_with(CHUNK_END) {
            if self.in_chunk {
                self.in_chunk = false;
                return Some(std::mem::take(&mut self.lines));
            }
        } else if self.in_chunk {
            self.lines.push(line.to_string());
        }
        None
    }
}

fn mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        0.0
    } else {
        samples.iter().sum::<f64>() / samples.len() as f64
    }
}

/// DEAD_TASKS estimates above `n * mean / 2` are replaced by the mean.
fn validated_dead_tasks_score(score: f64, history: &[f64]) -> f64 {
    let n = history.len();
    if n > 1 {
        let mean = mean(history);
        if score > n as f64 * mean / 2.0 {
            return mean;
        }
    }
    score
}

/// Sums the energy impact of the rows belonging to `pids`. Falls back to the
/// DEAD_TASKS row when none of them is present, then to zero.
fn chunk_score(lines: &[String], pids: &HashSet<u32>, history: &[f64]) -> f64 {
    let mut pending = pids.clone();
    let mut score: Option<f64> = None;
    let mut dead_tasks_score = None;

    for line in lines {
        let components: Vec<&str> = line.split_whitespace().collect();
        if components.len() < 3 {
            continue;
        }
        let (Ok(pid), Some(Ok(value))) = (
            components[1].parse::<i64>(),
            components.last().map(|v| v.parse::<f64>()),
        ) else {
            continue;
        };

        if pid == DEAD_TASKS_PID {
            dead_tasks_score = Some(validated_dead_tasks_score(value, history));
        } else if u32::try_from(pid).is_ok_and(|pid| pending.remove(&pid)) {
            *score.get_or_insert(0.0) += value;
        }
    }

    score.or(dead_tasks_score).unwrap_or(0.0)
}

/// Energy probe backed by `powermetrics` on macOS.
///
/// One helper runs per probe run; every poll makes it flush a sample and a
/// reader thread turns each flushed chunk into one sample for the task tree.
pub struct PowermetricsProbe {
    clock: ProbeClock,
    task: Option<TaskHandle>,
    helper: Option<Task>,
    reader: Option<(JoinHandle<()>, Receiver<()>)>,
    samples: Arc<Mutex<Vec<f64>>>,
    polls: usize,
}

impl Default for PowermetricsProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl PowermetricsProbe {
    pub fn new() -> Self {
        Self {
            clock: ProbeClock::default(),
            task: None,
            helper: None,
            reader: None,
            samples: Arc::new(Mutex::new(Vec::new())),
            polls: 0,
        }
    }

    pub fn is_available() -> bool {
        cfg!(target_os = "macos") && find_executable("powermetrics").is_ok()
    }

    fn spawn_reader(&mut self, helper: &mut Task, task: TaskHandle) -> ProcResult<()> {
        let stdout = helper
            .take_stdout()
            .ok_or_else(|| ProcError::Probe("powermetrics stdout is not piped".to_string()))?;
        let samples = Arc::clone(&self.samples);
        let (done_tx, done_rx) = mpsc::channel();

        let thread = thread::spawn(move || {
            let mut splitter = ChunkSplitter::default();
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                let Some(chunk) = splitter.feed(&line) else { continue };

                let pids: HashSet<u32> = task
                    .pid()
                    .map(|pid| pid_tree(pid, false).into_iter().collect())
                    .unwrap_or_default();
                let mut samples = samples.lock().unwrap_or_else(PoisonError::into_inner);
                let score = chunk_score(&chunk, &pids, &samples);
                samples.push(score);
            }
            let _ = done_tx.send(());
        });

        self.reader = Some((thread, done_rx));
        Ok(())
    }

    /// Terminates the helper, escalating to SIGKILL after the grace period.
    fn shutdown_helper(&mut self) {
        let Some(mut helper) = self.helper.take() else { return };
        let grace = self.interval() * 2;

        let _ = helper.send_signal(Signal::SIGTERM, false);
        if let Some((thread, done)) = self.reader.take() {
            if done.recv_timeout(grace).is_err() {
                warn!("powermetrics did not exit within {:?}, killing it", grace);
                let _ = helper.send_signal(Signal::SIGKILL, false);
            } else {
                let _ = thread.join();
            }
        }
        if let Err(e) = helper.wait(Some(grace)) {
            debug!("powermetrics exited with: {}", e);
        }
    }

    /// Scales the last sample by the covered fraction of its interval.
    fn normalize_last(&self, samples: &mut [f64]) {
        let Some(elapsed) = self.task.as_ref().and_then(TaskHandle::elapsed) else {
            return;
        };
        let covered = samples.len().saturating_sub(1) as u128;
        let interval_ms = self.interval().as_millis().max(1);
        let elapsed_ms = elapsed.as_millis();
        if let Some(last) = samples.last_mut() {
            if elapsed_ms / interval_ms == covered {
                *last *= (elapsed_ms % interval_ms) as f64 / interval_ms as f64;
            }
        }
    }
}

impl EnergyProbe for PowermetricsProbe {
    fn name(&self) -> &str {
        "powermetrics"
    }

    fn clock(&self) -> &ProbeClock {
        &self.clock
    }

    fn clock_mut(&mut self) -> &mut ProbeClock {
        &mut self.clock
    }

    fn start(&mut self, task: &TaskHandle) -> ProcResult<()> {
        require_root()?;
        self.shutdown_helper();

        self.samples.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.polls = 0;
        self.task = Some(task.clone());

        let args = ["--samplers", "tasks", "--show-process-energy", "-i", "0"];
        let mut helper = Task::new("powermetrics", &args)?.with_output(OutputAction::Stream);
        helper.run(false, None)?;
        self.spawn_reader(&mut helper, task.clone())?;
        debug!("powermetrics started with pid {:?}", helper.pid());
        self.helper = Some(helper);
        Ok(())
    }

    fn poll(&mut self) -> ProcResult<()> {
        self.polls += 1;
        match &self.helper {
            Some(helper) => helper.send_signal(FLUSH_SIGNAL, false).map(|_| ()),
            None => Err(ProcError::Probe("powermetrics is not running".to_string())),
        }
    }

    fn stop(&mut self) -> ProcResult<ProbeOutput> {
        self.shutdown_helper();

        let mut samples = std::mem::take(&mut *self.samples.lock().unwrap_or_else(PoisonError::into_inner));
        if samples.len() != self.polls {
            debug!(
                "powermetrics flushed {} chunks for {} polls",
                samples.len(),
                self.polls
            );
            let fill = mean(&samples);
            samples.resize(self.polls, fill);
        }
        self.normalize_last(&mut samples);
        Ok(ProbeOutput::Samples(samples))
    }
}

impl Drop for PowermetricsProbe {
    fn drop(&mut self) {
        self.shutdown_helper();
    }
}
