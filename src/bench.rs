use crate::task::{Task, TaskHandle, Workload};
use crate::utils::errors::{ProcError, ProcResult};
use crate::utils::units::human_readable_bytes;
use log::info;
use std::time::Duration;

/// Measures wall time and peak memory of a single task run.
#[derive(Debug)]
pub struct Benchmark {
    task: Task,
    nanos: u64,
    max_memory: u64,
}

impl Benchmark {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            nanos: 0,
            max_memory: 0,
        }
    }

    /// Runs the task once. The reap races a watchdog that kills the task tree
    /// if `timeout` elapses first.
    pub fn run(&mut self, timeout: Option<Duration>) -> ProcResult<()> {
        self.task.run(false, None)?;
        let pid = self.task.pid();
        self.task.wait(timeout)?;

        let completed = self
            .task
            .completed()
            .ok_or_else(|| ProcError::Other(format!("Task \"{}\" did not complete", self.task.name())))?;
        self.nanos = u64::try_from(completed.elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.max_memory = completed.usage.max_rss;

        info!(
            "Benchmarked \"{}\" ({:?}): {:.3} s, peak memory {}",
            self.task.name(),
            pid,
            self.seconds(),
            self.max_memory_string()
        );
        Ok(())
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn into_task(self) -> Task {
        self.task
    }

    /// Peak resident memory in bytes.
    pub fn max_memory(&self) -> u64 {
        self.max_memory
    }

    pub fn max_memory_string(&self) -> String {
        human_readable_bytes(self.max_memory)
    }

    pub fn nanoseconds(&self) -> u64 {
        self.nanos
    }

    pub fn milliseconds(&self) -> f64 {
        self.nanos as f64 / 1e6
    }

    pub fn seconds(&self) -> f64 {
        self.nanos as f64 / 1e9
    }

    pub fn pid(&self) -> Option<u32> {
        self.task.pid()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.task.exit_code()
    }

    pub fn stdout(&self) -> Option<&str> {
        self.task.stdout()
    }

    pub fn stderr(&self) -> Option<&str> {
        self.task.stderr()
    }

    pub fn raise_if_failed(&self, ensure_output: bool, message: Option<&str>) -> ProcResult<&Self> {
        self.task.raise_if_failed(ensure_output, message)?;
        Ok(self)
    }
}

impl Workload for Benchmark {
    fn handle(&self) -> TaskHandle {
        self.task.handle()
    }

    fn run(&mut self, timeout: Option<Duration>) -> ProcResult<()> {
        Benchmark::run(self, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskState;

    #[test]
    fn test_benchmark_sleep_duration() {
        let task = Task::new("sleep", &["0.3"]).unwrap();
        let mut bench = Benchmark::new(task);
        bench.run(Some(Duration::from_secs(10))).unwrap();

        assert!(bench.nanoseconds() >= 300_000_000, "{} ns", bench.nanoseconds());
        assert!(bench.nanoseconds() <= 2_300_000_000, "{} ns", bench.nanoseconds());
        assert!((bench.seconds() - bench.milliseconds() / 1e3).abs() < 1e-9);
        assert!(bench.max_memory() > 0);
        assert_eq!(bench.exit_code(), Some(0));
    }

    #[test]
    // Memory is reported in bytes: any real process needs more than 64 KiB
    fn test_benchmark_memory_in_bytes() {
        let task = Task::new("true", &[] as &[&str]).unwrap();
        let mut bench = Benchmark::new(task);
        bench.run(None).unwrap();
        assert!(bench.max_memory() > 64 * 1024);
        assert!(bench.max_memory_string().ends_with("B"));
    }

    #[test]
    fn test_benchmark_timeout() {
        let task = Task::new("sleep", &["30"]).unwrap();
        let mut bench = Benchmark::new(task);
        let result = bench.run(Some(Duration::from_millis(300)));
        assert!(matches!(result, Err(ProcError::Timeout { .. })));
        assert_eq!(bench.task().state(), TaskState::Killed);
        assert_eq!(bench.nanoseconds(), 0);
    }

    #[test]
    fn test_benchmark_forwards_output() {
        let task = Task::new("sh", &["-c", "echo measured; exit 4"]).unwrap();
        let mut bench = Benchmark::new(task);
        bench.run(None).unwrap();
        assert_eq!(bench.stdout(), Some("measured"));
        assert!(bench.raise_if_failed(false, None).is_err());
        assert!(bench.into_task().pid().is_some());
    }
}
