use crate::energy_profiler::{EnergyProbe, ProbeClock, ProbeOutput};
use crate::task::TaskHandle;
use crate::utils::errors::ProcResult;
use log::debug;

/// Baseline probe: every poll yields a zero sample.
#[derive(Debug, Default)]
pub struct ZeroProbe {
    clock: ProbeClock,
    samples: Vec<f64>,
}

impl ZeroProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always available
    pub fn is_available() -> bool {
        true
    }
}

impl EnergyProbe for ZeroProbe {
    fn name(&self) -> &str {
        "zero"
    }

    fn clock(&self) -> &ProbeClock {
        &self.clock
    }

    fn clock_mut(&mut self) -> &mut ProbeClock {
        &mut self.clock
    }

    fn start(&mut self, task: &TaskHandle) -> ProcResult<()> {
        debug!("Zero probe started for \"{}\"", task.name());
        self.samples.clear();
        Ok(())
    }

    fn poll(&mut self) -> ProcResult<()> {
        self.samples.push(0.0);
        Ok(())
    }

    fn stop(&mut self) -> ProcResult<ProbeOutput> {
        Ok(ProbeOutput::Samples(std::mem::take(&mut self.samples)))
    }
}
