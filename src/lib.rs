pub mod utils {
    pub mod errors;
    pub mod logger;
    pub mod psutils;
    pub mod units;
}

pub mod bench;
pub mod collectors;
pub mod config;
pub mod energy_profiler;
pub mod task;

pub use bench::Benchmark;
pub use collectors::ProbeKind;
pub use config::{Mode, RunConfig};
pub use energy_profiler::{EnergyProbe, EnergyProfiler, EnergySample, ProbeOutput, SharedProbe};
pub use task::{OutputAction, Task, TaskHandle, TaskRegistry, TaskState, Workload};
pub use utils::errors::{ProcError, ProcResult};
