use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// Bounds on concurrently active tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thresholds {
    pub low: usize,
    pub high: usize,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self { low: 2, high: 4 }
    }
}

impl Thresholds {
    pub fn new(low: usize, high: usize) -> Result<Self, ConfigError> {
        let t = Self { low, high };
        t.validate()?;
        Ok(t)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.high < 1 || self.low > self.high {
            return Err(ConfigError::InvalidThresholds {
                low: self.low,
                high: self.high,
            });
        }
        Ok(())
    }
}

/// Hysteresis gate: closes when the active count reaches `high` and reopens
/// once it has dropped to `low`.
#[derive(Debug, Clone)]
pub struct Admission {
    thresholds: Thresholds,
    open: bool,
}

impl Admission {
    pub fn new(thresholds: Thresholds) -> Self {
        Self {
            thresholds,
            open: true,
        }
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn set_thresholds(&mut self, thresholds: Thresholds) {
        self.thresholds = thresholds;
    }

    /// Update the gate for `active` tasks and report whether one more may start.
    pub fn may_admit(&mut self, active: usize) -> bool {
        if active >= self.thresholds.high {
            self.open = false;
        } else if active <= self.thresholds.low {
            self.open = true;
        }
        self.open && active < self.thresholds.high
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_bounds() {
        assert!(Thresholds::new(0, 1).is_ok());
        assert!(Thresholds::new(2, 2).is_ok());
        assert!(Thresholds::new(0, 0).is_err());
        assert!(Thresholds::new(3, 2).is_err());
    }

    #[test]
    fn closes_at_high_reopens_at_low() {
        let mut gate = Admission::new(Thresholds { low: 1, high: 3 });
        assert!(gate.may_admit(0));
        assert!(gate.may_admit(2));
        assert!(!gate.may_admit(3));
        // Between low and high the gate stays closed.
        assert!(!gate.may_admit(2));
        assert!(gate.may_admit(1));
        assert!(gate.may_admit(2));
    }

    #[test]
    fn never_exceeds_high() {
        let mut gate = Admission::new(Thresholds { low: 2, high: 2 });
        let mut active = 0;
        while gate.may_admit(active) {
            active += 1;
        }
        assert_eq!(active, 2);
    }

    #[test]
    fn lowering_high_closes_gate() {
        let mut gate = Admission::new(Thresholds { low: 1, high: 4 });
        assert!(gate.may_admit(2));
        gate.set_thresholds(Thresholds { low: 0, high: 2 });
        assert!(!gate.may_admit(2));
        assert!(!gate.may_admit(1));
        assert!(gate.may_admit(0));
    }
}
