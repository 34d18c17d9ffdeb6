use crate::energy_profiler::{EnergyProbe, ProbeClock, ProbeOutput};
use crate::task::{OutputAction, Task, TaskHandle};
use crate::utils::errors::{ProcError, ProcResult};
use crate::utils::psutils::{find_executable, pid_tree, require_root};
use crate::utils::units::power_to_watts;
use log::{debug, warn};
use nix::sys::signal::Signal;
use regex::Regex;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime};
use tempfile::TempDir;

const REPORT_FILENAME: &str = "report";
const REPORT_HEADER: &str = "Overview of Software Power Consumers";
const PID_PATTERN: &str = r";\[PID (\d+)].*;\s*([\d.]+)\s([mu]?W)\s*$";
/// Reports waited for are given this many intervals to appear or fill up.
const WAIT_INTERVALS: u32 = 10;
const CHECKS_PER_INTERVAL: u32 = 10;

/// Sums the power of the tracked ids listed in one report, in watts.
fn read_report(path: &Path, pattern: &Regex, pids: &HashSet<u32>) -> ProcResult<f64> {
    let reader = BufReader::new(File::open(path)?);
    let mut sample = 0.0;
    let mut header_found = false;

    for line in reader.lines() {
        let line = line?;
        if !header_found {
            header_found = line.contains(REPORT_HEADER);
            if !header_found {
                continue;
            }
        }
        let Some(captures) = pattern.captures(&line) else {
            continue;
        };
        let tracked = captures[1].parse::<u32>().is_ok_and(|pid| pids.contains(&pid));
        if tracked {
            sample += power_to_watts(&captures[2], &captures[3]);
        }
    }
    Ok(sample)
}

/// One sample per report, dropping a trailing zero from a report cut short.
fn samples_from_reports(reports: &[PathBuf], pattern: &Regex, pids: &HashSet<u32>) -> Vec<f64> {
    let mut samples: Vec<f64> = reports
        .iter()
        .map(|report| {
            read_report(report, pattern, pids).unwrap_or_else(|e| {
                warn!("Could not read powertop report {}: {}", report.display(), e);
                0.0
            })
        })
        .collect();

    if samples.last() == Some(&0.0) {
        samples.pop();
    }
    samples
}

/// Report files in `dir`, oldest first.
fn reports_by_mtime(dir: &Path) -> ProcResult<Vec<PathBuf>> {
    let mut reports: Vec<(SystemTime, PathBuf)> = fs::read_dir(dir)?
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().starts_with(REPORT_FILENAME))
        .map(|entry| {
            let modified = entry
                .metadata()
                .and_then(|meta| meta.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (modified, entry.path())
        })
        .collect();
    reports.sort();
    Ok(reports.into_iter().map(|(_, path)| path).collect())
}

/// Energy probe backed by `powertop` on GNU/Linux.
///
/// The helper writes CSV reports into a private directory on its own
/// schedule; polls only collect the ids of the task tree and all parsing
/// happens at `stop`.
pub struct PowertopProbe {
    clock: ProbeClock,
    task: Option<TaskHandle>,
    helper: Option<Task>,
    report_dir: Option<TempDir>,
    pids: HashSet<u32>,
    pattern: Regex,
}

impl PowertopProbe {
    pub fn new() -> ProcResult<Self> {
        Ok(Self {
            clock: ProbeClock::default(),
            task: None,
            helper: None,
            report_dir: None,
            pids: HashSet::new(),
            pattern: Regex::new(PID_PATTERN)?,
        })
    }

    pub fn is_available() -> bool {
        cfg!(target_os = "linux") && find_executable("powertop").is_ok()
    }

    fn check_period(&self) -> Duration {
        self.interval() / CHECKS_PER_INTERVAL
    }

    fn wait_for_first_report(&self, dir: &Path) -> ProcResult<()> {
        let deadline = Instant::now() + self.interval() * WAIT_INTERVALS;
        while reports_by_mtime(dir)?.is_empty() {
            if Instant::now() >= deadline {
                return Err(ProcError::Probe(format!(
                    "powertop wrote no report within {:?}",
                    self.interval() * WAIT_INTERVALS
                )));
            }
            sleep(self.check_period());
        }
        Ok(())
    }

    fn wait_for_report(&self, path: &Path) {
        for _ in 0..WAIT_INTERVALS * CHECKS_PER_INTERVAL {
            if fs::metadata(path).map(|meta| meta.len() > 0).unwrap_or(false) {
                return;
            }
            sleep(self.check_period());
        }
        debug!("powertop report {} is still empty", path.display());
    }

    fn shutdown_helper(&mut self) {
        if let Some(mut helper) = self.helper.take() {
            let _ = helper.send_signal(Signal::SIGKILL, true);
            if let Err(e) = helper.wait(Some(self.interval() * 2)) {
                debug!("powertop exited with: {}", e);
            }
        }
    }
}

impl EnergyProbe for PowertopProbe {
    fn name(&self) -> &str {
        "powertop"
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

        self.task = Some(task.clone());
        self.pids.clear();

        let dir = tempfile::Builder::new().prefix("emt_powertop_").tempdir()?;
        let args = [
            "-t".to_string(),
            self.interval().as_secs().max(1).to_string(),
            "-i".to_string(),
            i64::MAX.to_string(),
            format!("-C{}", dir.path().join(REPORT_FILENAME).display()),
        ];
        let mut helper = Task::new("powertop", &args)?.with_output(OutputAction::Discard);
        helper.run(false, None)?;
        debug!("powertop started with pid {:?}", helper.pid());
        self.helper = Some(helper);

        let ready = self.wait_for_first_report(dir.path());
        self.report_dir = Some(dir);
        if ready.is_err() {
            self.shutdown_helper();
            self.report_dir = None;
        }
        ready
    }

    fn poll(&mut self) -> ProcResult<()> {
        if let Some(pid) = self.task.as_ref().and_then(TaskHandle::pid) {
            self.pids.extend(pid_tree(pid, true));
        }
        Ok(())
    }

    fn stop(&mut self) -> ProcResult<ProbeOutput> {
        let dir = self
            .report_dir
            .take()
            .ok_or_else(|| ProcError::Probe("powertop is not running".to_string()))?;

        let reports = reports_by_mtime(dir.path());
        if let Ok(reports) = &reports {
            for report in reports {
                self.wait_for_report(report);
            }
        }
        self.shutdown_helper();

        let samples = samples_from_reports(&reports?, &self.pattern, &self.pids);
        debug!("powertop parsed {} reports", samples.len());
        let average = if samples.is_empty() {
            0.0
        } else {
            samples.iter().sum::<f64>() / samples.len() as f64
        };
        Ok(ProbeOutput::Average(average))
    }
}

impl Drop for PowertopProbe {
    fn drop(&mut self) {
        self.shutdown_helper();
    }
}
