pub mod powermetrics;
pub mod powertop;
pub mod zero;

pub use powermetrics::PowermetricsProbe;
pub use powertop::PowertopProbe;
pub use zero::ZeroProbe;

use crate::energy_profiler::{EnergyProbe, SharedProbe, shared};
use crate::utils::errors::{ProcError, ProcResult};
use crate::utils::psutils::is_root;
use log::debug;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Every probe implementation this crate ships.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeKind {
    Zero,
    Powermetrics,
    Powertop,
}

impl ProbeKind {
    pub fn all() -> [ProbeKind; 3] {
        [ProbeKind::Zero, ProbeKind::Powermetrics, ProbeKind::Powertop]
    }

    pub fn name(self) -> &'static str {
        match self {
            ProbeKind::Zero => "zero",
            ProbeKind::Powermetrics => "powermetrics",
            ProbeKind::Powertop => "powertop",
        }
    }

    /// Case-insensitive lookup by probe name.
    pub fn from_name(name: &str) -> ProcResult<Self> {
        Self::all()
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(name.trim()))
            .ok_or_else(|| {
                let known: Vec<&str> = Self::all().iter().map(|kind| kind.name()).collect();
                ProcError::Probe(format!("Unknown probe \"{}\", expected one of: {}", name, known.join(", ")))
            })
    }

    /// Whether the backing tool exists on this host. Privileges are checked at start.
    pub fn is_available(self) -> bool {
        match self {
            ProbeKind::Zero => ZeroProbe::is_available(),
            ProbeKind::Powermetrics => PowermetricsProbe::is_available(),
            ProbeKind::Powertop => PowertopProbe::is_available(),
        }
    }

    pub fn available() -> Vec<ProbeKind> {
        Self::all().into_iter().filter(|kind| kind.is_available()).collect()
    }

    /// Builds a fresh probe sampling every `interval`.
    pub fn build(self, interval: Duration) -> ProcResult<SharedProbe> {
        let probe = match self {
            ProbeKind::Zero => configured(ZeroProbe::new(), interval),
            ProbeKind::Powermetrics => configured(PowermetricsProbe::new(), interval),
            ProbeKind::Powertop => configured(PowertopProbe::new()?, interval),
        };
        Ok(probe)
    }

    /// The power tool of this platform when it is installed and usable,
    /// otherwise the zero probe.
    pub fn platform_default() -> ProbeKind {
        let native = if cfg!(target_os = "macos") {
            ProbeKind::Powermetrics
        } else {
            ProbeKind::Powertop
        };

        if native.is_available() && is_root() {
            native
        } else {
            debug!("{} is not usable here, falling back to the zero probe", native);
            ProbeKind::Zero
        }
    }
}

fn configured<P: EnergyProbe + 'static>(mut probe: P, interval: Duration) -> SharedProbe {
    probe.set_interval(interval);
    shared(probe)
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ProbeKind {
    type Err = ProcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_name_case_insensitive() {
        assert_eq!(ProbeKind::from_name("Zero").unwrap(), ProbeKind::Zero);
        assert_eq!(ProbeKind::from_name("POWERTOP").unwrap(), ProbeKind::Powertop);
        assert_eq!("powermetrics".parse::<ProbeKind>().unwrap(), ProbeKind::Powermetrics);
        assert!(matches!(ProbeKind::from_name("rapl"), Err(ProcError::Probe(_))));
    }

    #[test]
    fn test_names_round_trip() {
        for kind in ProbeKind::all() {
            assert_eq!(ProbeKind::from_name(&kind.to_string()).unwrap(), kind);
        }
    }

    #[test]
    fn test_zero_always_available() {
        assert!(ProbeKind::available().contains(&ProbeKind::Zero));
        if !is_root() {
            assert_eq!(ProbeKind::platform_default(), ProbeKind::Zero);
        }
    }

    #[test]
    fn test_build_sets_interval() {
        let probe = ProbeKind::Zero.build(Duration::from_millis(250)).unwrap();
        let probe = probe.lock().unwrap();
        assert_eq!(probe.name(), "zero");
        assert_eq!(probe.interval(), Duration::from_millis(250));
    }
}
