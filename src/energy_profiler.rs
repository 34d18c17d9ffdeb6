use crate::task::{TaskHandle, Workload};
use crate::utils::errors::{ProcError, ProcResult};
use itertools::multiunzip;
use log::{debug, info, warn};
use polars::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// One power sample and the interval it covers.
#[derive(Debug, Clone, PartialEq)]
pub struct EnergySample {
    /// Score proportional to the average power during the interval.
    pub power: f64,
    /// Interval in milliseconds.
    pub interval: f64,
    /// Wall-clock time the sample was taken, milliseconds since the epoch.
    pub timestamp: i64,
}

impl EnergySample {
    pub fn new(power: f64, interval: f64) -> Self {
        Self {
            power,
            interval,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn energy(&self) -> f64 {
        self.power * self.interval
    }
}

/// What a probe hands back when stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutput {
    /// One value per poll, in poll order.
    Samples(Vec<f64>),
    /// A single average applied to every poll.
    Average(f64),
}

/// Sampling interval and the start/stop marks of the last run.
#[derive(Debug, Clone)]
pub struct ProbeClock {
    pub interval: Duration,
    pub start_timestamp: Option<Instant>,
    pub stop_timestamp: Option<Instant>,
}

impl Default for ProbeClock {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            start_timestamp: None,
            stop_timestamp: None,
        }
    }
}

/// A sampler that can be polled for the power draw of a task.
pub trait EnergyProbe: Send {
    fn name(&self) -> &str;

    fn clock(&self) -> &ProbeClock;

    fn clock_mut(&mut self) -> &mut ProbeClock;

    fn interval(&self) -> Duration {
        self.clock().interval
    }

    fn set_interval(&mut self, interval: Duration) {
        self.clock_mut().interval = if interval.is_zero() {
            ProbeClock::default().interval
        } else {
            interval
        };
    }

    /// Resets state for a new run. Must be safe to call repeatedly.
    fn start(&mut self, task: &TaskHandle) -> ProcResult<()>;

    /// Accounts for one sample covering the time since the previous poll.
    fn poll(&mut self) -> ProcResult<()>;

    /// Stops sampling and returns the samples gathered since `start`.
    fn stop(&mut self) -> ProcResult<ProbeOutput>;
}

pub type SharedProbe = Arc<Mutex<dyn EnergyProbe>>;

pub fn shared<P: EnergyProbe + 'static>(probe: P) -> SharedProbe {
    Arc::new(Mutex::new(probe))
}

fn lock(probe: &SharedProbe) -> MutexGuard<'_, dyn EnergyProbe + 'static> {
    probe.lock().unwrap_or_else(PoisonError::into_inner)
}

type SampleLog = Arc<Mutex<Vec<EnergySample>>>;

struct ProbeSlot {
    name: String,
    probe: SharedProbe,
    samples: SampleLog,
}

impl ProbeSlot {
    fn samples(&self) -> Vec<EnergySample> {
        self.samples.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn score(&self) -> f64 {
        let samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        samples.iter().map(EnergySample::energy).sum::<f64>() / 1e3
    }
}

struct Poller {
    index: usize,
    interval: Duration,
    finished: Receiver<()>,
    thread: JoinHandle<()>,
}

/// Runs a workload while polling one or more energy probes.
pub struct EnergyProfiler<W: Workload> {
    workload: W,
    slots: Vec<ProbeSlot>,
}

impl<W: Workload> EnergyProfiler<W> {
    pub fn new(workload: W, probes: Vec<SharedProbe>) -> ProcResult<Self> {
        if probes.is_empty() {
            return Err(ProcError::Other("At least one energy probe is required".to_string()));
        }
        let slots = probes
            .into_iter()
            .map(|probe| {
                let name = lock(&probe).name().to_string();
                ProbeSlot {
                    name,
                    probe,
                    samples: Arc::new(Mutex::new(Vec::new())),
                }
            })
            .collect();
        Ok(Self { workload, slots })
    }

    pub fn workload(&self) -> &W {
        &self.workload
    }

    pub fn into_workload(self) -> W {
        self.workload
    }

    pub fn probe_names(&self) -> Vec<&str> {
        self.slots.iter().map(|slot| slot.name.as_str()).collect()
    }

    fn slot(&self, name: &str) -> Option<&ProbeSlot> {
        self.slots.iter().find(|slot| slot.name.eq_ignore_ascii_case(name))
    }

    /// Samples recorded for the first probe with this name during the last run.
    pub fn samples(&self, name: &str) -> Vec<EnergySample> {
        self.slot(name).map(ProbeSlot::samples).unwrap_or_default()
    }

    /// Samples recorded for the probe at `index`, in attach order.
    pub fn samples_at(&self, index: usize) -> Vec<EnergySample> {
        self.slots.get(index).map(ProbeSlot::samples).unwrap_or_default()
    }

    /// Energy score in watt-seconds: sum of power times interval (ms), over 1000.
    pub fn score(&self, name: &str) -> Option<f64> {
        self.slot(name).map(ProbeSlot::score)
    }

    pub fn score_at(&self, index: usize) -> Option<f64> {
        self.slots.get(index).map(ProbeSlot::score)
    }

    /// One score per attached probe, in attach order.
    pub fn scores(&self) -> Vec<(String, f64)> {
        self.slots
            .iter()
            .map(|slot| (slot.name.clone(), slot.score()))
            .collect()
    }

    /// Starts every probe, runs the workload, then stops every started probe,
    /// whatever the workload outcome.
    pub fn run(&mut self, timeout: Option<Duration>) -> ProcResult<()> {
        let handle = self.workload.handle();
        let stop = Arc::new(AtomicBool::new(false));
        let mut pollers = Vec::with_capacity(self.slots.len());

        let outcome = self
            .start_probes(&handle, &stop, &mut pollers)
            .and_then(|()| self.workload.run(timeout));

        stop.store(true, Ordering::Release);
        let stopped = self.stop_probes(pollers);

        outcome?;
        stopped?;

        for (name, score) in self.scores() {
            info!("Energy score for \"{}\" with {}: {:.3}", handle.name(), name, score);
        }
        Ok(())
    }

    fn start_probes(
        &self,
        handle: &TaskHandle,
        stop: &Arc<AtomicBool>,
        pollers: &mut Vec<Poller>,
    ) -> ProcResult<()> {
        for (index, slot) in self.slots.iter().enumerate() {
            let interval = {
                let mut probe = lock(&slot.probe);
                probe.start(handle)?;
                probe.clock_mut().start_timestamp = Some(Instant::now());
                probe.clock_mut().stop_timestamp = None;
                probe.interval()
            };
            slot.samples.lock().unwrap_or_else(PoisonError::into_inner).clear();

            let (done_tx, finished) = mpsc::channel();
            let probe = Arc::clone(&slot.probe);
            let samples = Arc::clone(&slot.samples);
            let handle = handle.clone();
            let stop = Arc::clone(stop);

            let thread = thread::spawn(move || {
                poll_probe(&probe, &samples, &handle, &stop, interval);
                let _ = done_tx.send(());
            });

            pollers.push(Poller {
                index,
                interval,
                finished,
                thread,
            });
        }
        Ok(())
    }

    fn stop_probes(&self, pollers: Vec<Poller>) -> ProcResult<()> {
        let mut first_error = None;
        for poller in pollers {
            let slot = &self.slots[poller.index];
            let finished = match poller.finished.recv_timeout(poller.interval * 2) {
                Err(RecvTimeoutError::Timeout) => {
                    warn!(
                        "Polling thread for \"{}\" did not finish within {:?}",
                        slot.name,
                        poller.interval * 2
                    );
                    false
                }
                _ => {
                    let _ = poller.thread.join();
                    true
                }
            };
            if let Err(e) = self.stop_probe(slot, finished) {
                warn!("Failed to stop probe \"{}\": {}", slot.name, e);
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Stops one probe. When its polling thread is still stuck inside `poll`,
    /// the stop is handed to a detached thread that runs once the poll returns.
    fn stop_probe(&self, slot: &ProbeSlot, finished: bool) -> ProcResult<()> {
        let mut probe = if finished {
            lock(&slot.probe)
        } else {
            match slot.probe.try_lock() {
                Ok(probe) => probe,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => {
                    let probe = Arc::clone(&slot.probe);
                    thread::spawn(move || {
                        let mut probe = lock(&probe);
                        probe.clock_mut().stop_timestamp = Some(Instant::now());
                        if let Err(e) = probe.stop() {
                            warn!("Deferred stop of probe \"{}\" failed: {}", probe.name(), e);
                        }
                    });
                    return Err(ProcError::Probe(format!(
                        "Probe \"{}\" is still polling, its samples were not reconciled",
                        slot.name
                    )));
                }
            }
        };
        probe.clock_mut().stop_timestamp = Some(Instant::now());
        let output = probe.stop()?;
        drop(probe);

        let mut samples = slot.samples.lock().unwrap_or_else(PoisonError::into_inner);
        match output {
            ProbeOutput::Average(power) => {
                for sample in samples.iter_mut() {
                    sample.power = power;
                }
            }
            ProbeOutput::Samples(powers) => {
                if powers.len() != samples.len() {
                    return Err(ProcError::SampleMismatch {
                        probe: slot.name.clone(),
                        expected: samples.len(),
                        actual: powers.len(),
                    });
                }
                for (sample, power) in samples.iter_mut().zip(powers) {
                    sample.power = power;
                }
            }
        }
        debug!("Probe \"{}\" recorded {} samples", slot.name, samples.len());
        Ok(())
    }

    /// All samples as a DataFrame: probe | sample | timestamp | interval | power | energy
    pub fn trace(&self) -> ProcResult<DataFrame> {
        let rows: Vec<(String, u32, i64, f64, f64, f64)> = self
            .slots
            .iter()
            .flat_map(|slot| {
                slot.samples()
                    .into_iter()
                    .enumerate()
                    .map(move |(i, s)| {
                        (slot.name.clone(), i as u32, s.timestamp, s.interval, s.power, s.energy())
                    })
                    .collect::<Vec<_>>()
            })
            .collect();

        let (probes, indices, timestamps, intervals, powers, energies): (
            Vec<String>,
            Vec<u32>,
            Vec<i64>,
            Vec<f64>,
            Vec<f64>,
            Vec<f64>,
        ) = multiunzip(rows);

        let mut trace = df![
            "probe" => probes,
            "sample" => indices,
            "timestamp" => timestamps,
            "interval" => intervals,
            "power" => powers,
            "energy" => energies,
        ]?;

        // Cast the timestamp column to Datetime with milliseconds
        let timestamp = trace
            .column("timestamp")?
            .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))?;
        trace.with_column(timestamp)?;

        Ok(trace)
    }
}

/// Polls on a drift-compensated cadence: the k-th poll is due at
/// `start + k * interval`, and an overrun only shortens the next sleep.
fn poll_probe(
    probe: &SharedProbe,
    samples: &SampleLog,
    handle: &TaskHandle,
    stop: &AtomicBool,
    interval: Duration,
) {
    let start = Instant::now();
    let mut last = start;
    let mut k: u32 = 1;

    while !handle.is_finished() && !stop.load(Ordering::Acquire) {
        let deadline = start + interval * k;
        thread::sleep(deadline.saturating_duration_since(Instant::now()));

        if stop.load(Ordering::Acquire) {
            break;
        }

        let now = Instant::now();
        if let Err(e) = lock(probe).poll() {
            warn!("Energy probe poll failed: {}", e);
        }
        let elapsed_ms = now.duration_since(last).as_secs_f64() * 1e3;
        samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(EnergySample::new(0.0, elapsed_ms));

        last = now;
        k += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bench::Benchmark;
    use crate::collectors::ZeroProbe;
    use crate::task::Task;
    use std::sync::atomic::AtomicUsize;

    struct ConstantProbe {
        clock: ProbeClock,
        polls: usize,
        output: fn(usize) -> ProbeOutput,
        stops: Arc<AtomicUsize>,
    }

    impl ConstantProbe {
        fn new(output: fn(usize) -> ProbeOutput) -> (Self, Arc<AtomicUsize>) {
            let stops = Arc::new(AtomicUsize::new(0));
            let probe = Self {
                clock: ProbeClock {
                    interval: Duration::from_millis(50),
                    ..Default::default()
                },
                polls: 0,
                output,
                stops: Arc::clone(&stops),
            };
            (probe, stops)
        }
    }

    impl EnergyProbe for ConstantProbe {
        fn name(&self) -> &str {
            "constant"
        }
        fn clock(&self) -> &ProbeClock {
            &self.clock
        }
        fn clock_mut(&mut self) -> &mut ProbeClock {
            &mut self.clock
        }
        fn start(&mut self, _task: &TaskHandle) -> ProcResult<()> {
            self.polls = 0;
            Ok(())
        }
        fn poll(&mut self) -> ProcResult<()> {
            self.polls += 1;
            Ok(())
        }
        fn stop(&mut self) -> ProcResult<ProbeOutput> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok((self.output)(self.polls))
        }
    }

    fn zero_probe(interval_ms: u64) -> SharedProbe {
        let mut probe = ZeroProbe::new();
        probe.set_interval(Duration::from_millis(interval_ms));
        shared(probe)
    }

    #[test]
    fn test_zero_probe_sample_count() {
        let task = Task::new("sleep", &["0.35"]).unwrap();
        let mut profiler = EnergyProfiler::new(task, vec![zero_probe(100)]).unwrap();
        profiler.run(None).unwrap();

        let samples = profiler.samples("zero");
        assert!((3..=4).contains(&samples.len()), "got {} samples", samples.len());
        assert!(samples.iter().all(|s| s.power == 0.0));
        assert!(samples.iter().all(|s| s.interval > 50.0 && s.interval < 250.0));
        assert_eq!(profiler.score("zero"), Some(0.0));
    }

    #[test]
    // An averaged value is broadcast to every recorded slot
    fn test_average_broadcast() {
        let (probe, _) = ConstantProbe::new(|_| ProbeOutput::Average(2.0));
        let task = Task::new("sleep", &["0.3"]).unwrap();
        let mut profiler = EnergyProfiler::new(task, vec![shared(probe)]).unwrap();
        profiler.run(None).unwrap();

        let samples = profiler.samples("constant");
        assert!(!samples.is_empty());
        assert!(samples.iter().all(|s| s.power == 2.0));

        let expected: f64 = samples.iter().map(|s| 2.0 * s.interval).sum::<f64>() / 1e3;
        let score = profiler.score("constant").unwrap();
        assert!((score - expected).abs() < 1e-9);
        // about 2 W for about 0.3 s
        assert!(score > 0.3 && score < 1.2, "score {}", score);
    }

    #[test]
    fn test_sequence_matches_polls() {
        let (probe, _) = ConstantProbe::new(|polls| ProbeOutput::Samples(vec![1.5; polls]));
        let task = Task::new("sleep", &["0.2"]).unwrap();
        let mut profiler = EnergyProfiler::new(task, vec![shared(probe)]).unwrap();
        profiler.run(None).unwrap();
        assert!(profiler.samples("constant").iter().all(|s| s.power == 1.5));
    }

    #[test]
    fn test_sequence_length_mismatch_fails() {
        let (probe, _) = ConstantProbe::new(|polls| ProbeOutput::Samples(vec![1.0; polls + 3]));
        let task = Task::new("sleep", &["0.2"]).unwrap();
        let mut profiler = EnergyProfiler::new(task, vec![shared(probe)]).unwrap();
        let result = profiler.run(None);
        assert!(matches!(result, Err(ProcError::SampleMismatch { .. })));
    }

    #[test]
    // Probes are stopped even when the task times out
    fn test_probes_stopped_on_timeout() {
        let (probe, stops) = ConstantProbe::new(|_| ProbeOutput::Average(1.0));
        let task = Task::new("sleep", &["30"]).unwrap();
        let mut profiler = EnergyProfiler::new(task, vec![shared(probe), zero_probe(50)]).unwrap();

        let started = Instant::now();
        let result = profiler.run(Some(Duration::from_millis(300)));
        assert!(matches!(result, Err(ProcError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_probe_reused_across_runs() {
        let probe = zero_probe(50);
        for _ in 0..2 {
            let task = Task::new("sleep", &["0.2"]).unwrap();
            let mut profiler = EnergyProfiler::new(task, vec![Arc::clone(&probe)]).unwrap();
            profiler.run(None).unwrap();
            assert!(!profiler.samples("zero").is_empty());
        }
    }

    #[test]
    fn test_profiles_benchmark() {
        let bench = Benchmark::new(Task::new("sleep", &["0.2"]).unwrap());
        let mut profiler = EnergyProfiler::new(bench, vec![zero_probe(50)]).unwrap();
        profiler.run(None).unwrap();
        assert!(profiler.workload().nanoseconds() >= 200_000_000);
        assert!(!profiler.samples("zero").is_empty());
    }

    #[test]
    fn test_trace_dataframe() {
        let (probe, _) = ConstantProbe::new(|_| ProbeOutput::Average(3.0));
        let task = Task::new("sleep", &["0.2"]).unwrap();
        let mut profiler = EnergyProfiler::new(task, vec![shared(probe)]).unwrap();
        profiler.run(None).unwrap();

        let trace = profiler.trace().unwrap();
        assert_eq!(trace.height(), profiler.samples("constant").len());
        assert_eq!(
            trace.column("timestamp").unwrap().dtype(),
            &DataType::Datetime(TimeUnit::Milliseconds, None)
        );
        let powers = trace.column("power").unwrap().f64().unwrap();
        assert!(powers.into_iter().all(|p| p == Some(3.0)));
    }

    #[test]
    // Probes sharing a name keep their own samples and scores
    fn test_same_name_probes_kept_apart() {
        let task = Task::new("sleep", &["0.5"]).unwrap();
        let mut profiler = EnergyProfiler::new(task, vec![zero_probe(50), zero_probe(100)]).unwrap();
        profiler.run(None).unwrap();

        let fast = profiler.samples_at(0);
        let slow = profiler.samples_at(1);
        assert!(fast.len() > slow.len(), "{} vs {}", fast.len(), slow.len());
        assert!(!slow.is_empty());
        assert_eq!(profiler.samples("zero").len(), fast.len());
        assert!(profiler.samples_at(2).is_empty());

        assert_eq!(profiler.scores().len(), 2);
        assert_eq!(profiler.score_at(1), Some(0.0));
        assert_eq!(profiler.score_at(2), None);

        let trace = profiler.trace().unwrap();
        assert_eq!(trace.height(), fast.len() + slow.len());
    }

    struct StuckProbe {
        clock: ProbeClock,
        stops: Arc<AtomicUsize>,
    }

    impl EnergyProbe for StuckProbe {
        fn name(&self) -> &str {
            "stuck"
        }
        fn clock(&self) -> &ProbeClock {
            &self.clock
        }
        fn clock_mut(&mut self) -> &mut ProbeClock {
            &mut self.clock
        }
        fn start(&mut self, _task: &TaskHandle) -> ProcResult<()> {
            Ok(())
        }
        fn poll(&mut self) -> ProcResult<()> {
            thread::sleep(Duration::from_secs(3));
            Ok(())
        }
        fn stop(&mut self) -> ProcResult<ProbeOutput> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(ProbeOutput::Average(0.0))
        }
    }

    #[test]
    // A poll that hangs does not hold up shutdown; the probe is stopped later
    fn test_hung_poll_bounded_shutdown() {
        let stops = Arc::new(AtomicUsize::new(0));
        let probe = StuckProbe {
            clock: ProbeClock {
                interval: Duration::from_millis(100),
                ..Default::default()
            },
            stops: Arc::clone(&stops),
        };
        let task = Task::new("sleep", &["0.15"]).unwrap();
        let mut profiler = EnergyProfiler::new(task, vec![shared(probe)]).unwrap();

        let started = Instant::now();
        let result = profiler.run(None);
        assert!(started.elapsed() < Duration::from_millis(1500), "took {:?}", started.elapsed());
        assert!(matches!(result, Err(ProcError::Probe(_))));

        let deadline = Instant::now() + Duration::from_secs(6);
        while stops.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
        }
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_requires_a_probe() {
        let task = Task::new("true", &[] as &[&str]).unwrap();
        assert!(EnergyProfiler::new(task, Vec::new()).is_err());
    }
}
