use std::str::FromStr;

/// Power units emitted by the supported power tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerUnit {
    Microwatt,
    Milliwatt,
    Watt,
}

impl PowerUnit {
    /// Factor converting a value in this unit to watts.
    pub fn multiplier(self) -> f64 {
        match self {
            PowerUnit::Microwatt => 1e-6,
            PowerUnit::Milliwatt => 1e-3,
            PowerUnit::Watt => 1.0,
        }
    }

    pub fn to_watts(self, value: f64) -> f64 {
        value * self.multiplier()
    }
}

impl FromStr for PowerUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uW" | "µW" => Ok(PowerUnit::Microwatt),
            "mW" => Ok(PowerUnit::Milliwatt),
            "W" => Ok(PowerUnit::Watt),
            other => Err(format!("Unknown power unit: {}", other)),
        }
    }
}

/// Converts a numeric token and a unit token to watts. Malformed input yields 0.0.
pub fn power_to_watts(value: &str, unit: &str) -> f64 {
    match (value.trim().parse::<f64>(), unit.trim().parse::<PowerUnit>()) {
        (Ok(value), Ok(unit)) => unit.to_watts(value),
        _ => 0.0,
    }
}

/// Parses strings such as `12.5uW`, `3 mW` or `2W` to watts. Malformed input yields 0.0.
pub fn parse_power(text: &str) -> f64 {
    let text = text.trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+' || c == 'e'))
        .unwrap_or(text.len());
    let (value, unit) = text.split_at(split);
    power_to_watts(value, unit)
}

const BYTE_UNITS: [&str; 9] = ["B", "KB", "MB", "GB", "TB", "PB", "EB", "ZB", "YB"];

/// Formats a byte count with a binary (1024-based) unit, one decimal digit.
pub fn human_readable_bytes(bytes: u64) -> String {
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < BYTE_UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, BYTE_UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_power_units() {
        assert!((parse_power("12.5uW") - 1.25e-5).abs() < 1e-12);
        assert!((parse_power("3mW") - 0.003).abs() < 1e-12);
        assert_eq!(parse_power("2W"), 2.0);
        assert!((parse_power(" 40.1 mW ") - 0.0401).abs() < 1e-12);
    }

    #[test]
    // Garbage never fails, it just contributes nothing
    fn test_parse_power_garbage() {
        assert_eq!(parse_power("garbage"), 0.0);
        assert_eq!(parse_power("12.5kW"), 0.0);
        assert_eq!(parse_power(""), 0.0);
        assert_eq!(power_to_watts("1.2.3", "W"), 0.0);
    }

    #[test]
    fn test_human_readable_bytes() {
        assert_eq!(human_readable_bytes(0), "0.0 B");
        assert_eq!(human_readable_bytes(1023), "1023.0 B");
        assert_eq!(human_readable_bytes(1536), "1.5 KB");
        assert_eq!(human_readable_bytes(3 * 1024 * 1024 * 1024), "3.0 GB");
    }
}
