use crate::collectors::ProbeKind;
use crate::energy_profiler::SharedProbe;
use crate::task::{OutputAction, Task, TaskRegistry};
use crate::utils::errors::{ProcError, ProcResult};
use clap::ValueEnum;
use std::path::PathBuf;
use std::time::Duration;

/// What to do with the command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Mode {
    /// Run it and report the exit status.
    Run,
    /// Measure wall time and peak memory.
    #[default]
    Bench,
    /// Profile energy while benchmarking.
    Energy,
}

/// Output handling accepted on the command line.
pub fn parse_output_action(s: &str) -> ProcResult<OutputAction> {
    match s.to_ascii_lowercase().as_str() {
        "print" => Ok(OutputAction::Print),
        "discard" => Ok(OutputAction::Discard),
        "store" => Ok(OutputAction::Store),
        other => Err(ProcError::Other(format!(
            "Unknown output action \"{}\", expected print, discard or store",
            other
        ))),
    }
}

/// Everything needed to run one measurement.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub mode: Mode,
    pub interval: Duration,
    pub timeout: Option<Duration>,
    pub output: OutputAction,
    pub input: Option<PathBuf>,
    /// Empty means the platform default probe.
    pub probes: Vec<ProbeKind>,
    pub command: Vec<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            interval: Duration::from_millis(1000),
            timeout: None,
            output: OutputAction::Store,
            input: None,
            probes: Vec::new(),
            command: Vec::new(),
        }
    }
}

impl RunConfig {
    pub fn new<S: Into<String>>(command: impl IntoIterator<Item = S>) -> Self {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// A zero interval keeps the default.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        if !interval.is_zero() {
            self.interval = interval;
        }
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_output(mut self, output: OutputAction) -> Self {
        self.output = output;
        self
    }

    pub fn with_input(mut self, input: Option<PathBuf>) -> Self {
        self.input = input;
        self
    }

    pub fn with_probes(mut self, probes: Vec<ProbeKind>) -> Self {
        self.probes = probes;
        self
    }

    /// Builds the configured task, registered with `registry`.
    pub fn task(&self, registry: &TaskRegistry) -> ProcResult<Task> {
        let (executable, args) = self
            .command
            .split_first()
            .ok_or_else(|| ProcError::Other("No command given".to_string()))?;

        let mut task = Task::new(executable, args)?
            .with_output(self.output)
            .with_registry(registry);
        if let Some(input) = &self.input {
            task = task.with_input(input);
        }
        Ok(task)
    }

    /// The configured probes, or the platform default when none were named.
    pub fn probe_kinds(&self) -> Vec<ProbeKind> {
        if self.probes.is_empty() {
            vec![ProbeKind::platform_default()]
        } else {
            self.probes.clone()
        }
    }

    pub fn build_probes(&self) -> ProcResult<Vec<SharedProbe>> {
        self.probe_kinds()
            .into_iter()
            .map(|kind| kind.build(self.interval))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RunConfig::default();
        assert_eq!(config.mode, Mode::Bench);
        assert_eq!(config.interval, Duration::from_millis(1000));
        assert_eq!(config.output, OutputAction::Store);
        assert!(config.timeout.is_none());
    }

    #[test]
    fn test_zero_interval_ignored() {
        let config = RunConfig::default().with_interval(Duration::ZERO);
        assert_eq!(config.interval, Duration::from_millis(1000));
    }

    #[test]
    fn test_parse_output_action() {
        assert_eq!(parse_output_action("Print").unwrap(), OutputAction::Print);
        assert_eq!(parse_output_action("discard").unwrap(), OutputAction::Discard);
        assert!(parse_output_action("stream").is_err());
    }

    #[test]
    fn test_task_from_command() {
        let registry = TaskRegistry::new();
        let config = RunConfig::new(["echo", "configured"]);
        let mut task = config.task(&registry).unwrap();
        task.run(true, None).unwrap();
        assert_eq!(task.stdout(), Some("configured"));

        assert!(RunConfig::default().task(&registry).is_err());
    }

    #[test]
    fn test_build_named_probes() {
        let config = RunConfig::default()
            .with_interval(Duration::from_millis(200))
            .with_probes(vec![ProbeKind::Zero, ProbeKind::Zero]);
        let probes = config.build_probes().unwrap();
        assert_eq!(probes.len(), 2);
        assert_eq!(probes[0].lock().unwrap().interval(), Duration::from_millis(200));
    }
}
