//! Memory pressure classification for the residency budget

use serde::{Deserialize, Serialize};

use crate::device::MemoryInfo;

/// Memory pressure level of the residency cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MemoryPressure {
    /// Below the moderate threshold
    Low,
    /// Between the moderate and high thresholds
    Moderate,
    /// Between the high and critical thresholds
    High,
    /// At or above the critical threshold (including over budget)
    Critical,
}

impl MemoryPressure {
    /// Classify a utilization ratio (footprint / budget)
    pub fn from_utilization(utilization: f64, thresholds: &PressureThresholds) -> Self {
        if utilization < thresholds.moderate {
            MemoryPressure::Low
        } else if utilization < thresholds.high {
            MemoryPressure::Moderate
        } else if utilization < thresholds.critical {
            MemoryPressure::High
        } else {
            MemoryPressure::Critical
        }
    }

    /// Returns true if callers should prefer smaller resources (lower mips,
    /// fewer pages) for new requests
    pub fn should_reduce_quality(&self) -> bool {
        matches!(self, MemoryPressure::High | MemoryPressure::Critical)
    }
}

/// Utilization thresholds between pressure levels (0.0 to 1.0)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PressureThresholds {
    pub moderate: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for PressureThresholds {
    fn default() -> Self {
        Self {
            moderate: 0.50,
            high: 0.75,
            critical: 0.90,
        }
    }
}

impl PressureThresholds {
    /// Clamp every threshold into 0.0..=1.0 and force them to be non-decreasing
    pub fn normalized(self) -> Self {
        let moderate = self.moderate.clamp(0.0, 1.0);
        let high = self.high.clamp(moderate, 1.0);
        let critical = self.critical.clamp(high, 1.0);
        Self {
            moderate,
            high,
            critical,
        }
    }
}

/// Utilization ratio
///
/// A zero budget is empty at zero footprint and infinitely over budget
/// otherwise.
pub fn utilization(footprint: usize, budget: usize) -> f64 {
    match (footprint, budget) {
        (0, 0) => 0.0,
        (_, 0) => f64::INFINITY,
        _ => footprint as f64 / budget as f64,
    }
}

/// Cap a configured budget by a fraction of the device's dedicated memory
///
/// Devices that report no dedicated memory (integrated GPUs) fall back to
/// total memory.
pub fn cap_budget(configured: usize, info: &MemoryInfo, fraction: f64) -> usize {
    let device_memory = if info.dedicated > 0 {
        info.dedicated
    } else {
        info.total
    };
    let cap = (device_memory as f64 * fraction.clamp(0.0, 1.0)) as usize;
    configured.min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pressure_levels() {
        let t = PressureThresholds::default();
        assert_eq!(MemoryPressure::from_utilization(0.0, &t), MemoryPressure::Low);
        assert_eq!(MemoryPressure::from_utilization(0.6, &t), MemoryPressure::Moderate);
        assert_eq!(MemoryPressure::from_utilization(0.8, &t), MemoryPressure::High);
        assert_eq!(MemoryPressure::from_utilization(0.95, &t), MemoryPressure::Critical);
        assert_eq!(MemoryPressure::from_utilization(1.4, &t), MemoryPressure::Critical);
    }

    #[test]
    fn test_should_reduce_quality() {
        assert!(!MemoryPressure::Low.should_reduce_quality());
        assert!(!MemoryPressure::Moderate.should_reduce_quality());
        assert!(MemoryPressure::High.should_reduce_quality());
        assert!(MemoryPressure::Critical.should_reduce_quality());
    }

    #[test]
    fn test_thresholds_normalized() {
        let t = PressureThresholds {
            moderate: 0.8,
            high: 0.4,
            critical: 1.5,
        }
        .normalized();
        assert_eq!(t.moderate, 0.8);
        assert_eq!(t.high, 0.8);
        assert_eq!(t.critical, 1.0);
    }

    #[test]
    fn test_utilization_of_empty_budget() {
        assert_eq!(utilization(0, 0), 0.0);
        assert_eq!(utilization(100, 0), f64::INFINITY);
        assert!((utilization(50, 200) - 0.25).abs() < f64::EPSILON);

        let t = PressureThresholds::default();
        assert_eq!(MemoryPressure::from_utilization(utilization(100, 0), &t), MemoryPressure::Critical);
        assert_eq!(MemoryPressure::from_utilization(utilization(0, 0), &t), MemoryPressure::Low);
    }

    #[test]
    fn test_cap_budget() {
        let info = MemoryInfo {
            total: 8000,
            free: 8000,
            dedicated: 4000,
        };
        assert_eq!(cap_budget(10_000, &info, 0.5), 2000);
        assert_eq!(cap_budget(1000, &info, 0.5), 1000);

        let integrated = MemoryInfo {
            total: 8000,
            free: 8000,
            dedicated: 0,
        };
        assert_eq!(cap_budget(10_000, &integrated, 0.25), 2000);
    }
}
