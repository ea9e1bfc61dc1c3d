//! Low-frequency clock configuration and RC calibration policy.
//!
//! The controller keeps time from a 32768 Hz low-frequency clock. When the
//! clock runs from the internal RC oscillator, the oscillator must be
//! recalibrated often enough to hold the advertised sleep-clock accuracy. The
//! calibration decision is pure and lives here, the hardware crate drives the
//! actual calibration task from it.
use crate::error::Error;

/// Low-frequency clock source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LfclkSource {
    /// Internal RC oscillator, periodically calibrated against the HF crystal.
    Rc,
    /// External 32.768 kHz crystal.
    Xtal,
    /// Synthesized from the HF clock.
    Synth,
}

/// Low-frequency clock configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ClockConfig {
    pub source: LfclkSource,
    /// Calibration timer interval in 0.25 s units. Valid range 1-32, RC only.
    pub rc_ctiv: u8,
    /// How many intervals may pass without calibration as long as the
    /// temperature has not moved. 0 forces calibration every interval.
    /// Valid range 0-33, RC only.
    pub rc_temp_ctiv: u8,
    /// Sleep clock accuracy reported to peers, in ppm.
    pub accuracy_ppm: u16,
}

impl Default for ClockConfig {
    fn default() -> Self {
        ClockConfig {
            source: LfclkSource::Rc,
            rc_ctiv: 16,
            rc_temp_ctiv: 2,
            accuracy_ppm: 250,
        }
    }
}

impl ClockConfig {
    /// Check the configuration for internal consistency.
    ///
    /// The RC timing fields must be zero for crystal and synth sources. For
    /// the RC source the worst-case time between calibrations must stay
    /// within 8 seconds, which bounds the frequency drift between
    /// calibrations.
    pub fn validate(&self) -> Result<(), Error> {
        match self.source {
            LfclkSource::Xtal | LfclkSource::Synth => {
                if self.rc_ctiv != 0 || self.rc_temp_ctiv != 0 {
                    return Err(Error::EINVAL);
                }
            }
            LfclkSource::Rc => {
                if !(1..=32).contains(&self.rc_ctiv) || self.rc_temp_ctiv > 33 {
                    return Err(Error::EINVAL);
                }
                let worst_intervals = u32::from(self.rc_ctiv) * u32::from(self.rc_temp_ctiv.max(1));
                if worst_intervals > 32 {
                    return Err(Error::EINVAL);
                }
            }
        }
        if self.accuracy_ppm == 0 || self.accuracy_ppm > 500 {
            return Err(Error::EINVAL);
        }
        Ok(())
    }

    /// Worst-case time between two calibrations, in microseconds.
    pub fn max_calibration_period_us(&self) -> u32 {
        u32::from(self.rc_ctiv) * u32::from(self.rc_temp_ctiv.max(1)) * 250_000
    }
}

/// Decides, at each calibration timer interval, whether to calibrate now.
///
/// Temperatures are in quarter degrees Celsius, matching the on-chip sensor.
pub struct CalibrationPolicy {
    rc_temp_ctiv: u8,
    intervals_since_cal: u8,
    temp_at_cal: i32,
}

/// Temperature movement beyond which recalibration is forced, 0.5 degrees C.
const TEMP_DELTA_QUARTER_DEG: i32 = 2;

impl CalibrationPolicy {
    pub fn new(cfg: &ClockConfig) -> Self {
        CalibrationPolicy {
            rc_temp_ctiv: cfg.rc_temp_ctiv,
            intervals_since_cal: 0,
            temp_at_cal: i32::MIN,
        }
    }

    /// Called on every calibration timer interval with the current die
    /// temperature. Returns `true` when calibration must run now.
    pub fn on_interval(&mut self, temp_quarter_deg: i32) -> bool {
        self.intervals_since_cal = self.intervals_since_cal.saturating_add(1);
        let due = self.rc_temp_ctiv == 0
            || self.intervals_since_cal >= self.rc_temp_ctiv
            || self.temp_at_cal == i32::MIN
            || (temp_quarter_deg - self.temp_at_cal).abs() > TEMP_DELTA_QUARTER_DEG;
        if due {
            self.intervals_since_cal = 0;
            self.temp_at_cal = temp_quarter_deg;
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        ClockConfig::default().validate().unwrap();
    }

    #[test]
    fn rc_fields_must_be_zero_for_xtal() {
        let cfg = ClockConfig {
            source: LfclkSource::Xtal,
            rc_ctiv: 16,
            rc_temp_ctiv: 2,
            accuracy_ppm: 50,
        };
        assert_eq!(cfg.validate(), Err(Error::EINVAL));
        let cfg = ClockConfig {
            source: LfclkSource::Xtal,
            rc_ctiv: 0,
            rc_temp_ctiv: 0,
            accuracy_ppm: 50,
        };
        cfg.validate().unwrap();
    }

    #[test]
    fn rc_worst_case_period_bounded_to_eight_seconds() {
        // 16 * 2 intervals of 0.25 s is exactly 8 s.
        let cfg = ClockConfig::default();
        assert_eq!(cfg.max_calibration_period_us(), 8_000_000);
        let cfg = ClockConfig {
            rc_ctiv: 17,
            rc_temp_ctiv: 2,
            ..ClockConfig::default()
        };
        assert_eq!(cfg.validate(), Err(Error::EINVAL));
    }

    #[test]
    fn policy_calibrates_on_first_interval() {
        let mut policy = CalibrationPolicy::new(&ClockConfig::default());
        assert!(policy.on_interval(100));
    }

    #[test]
    fn policy_skips_while_temperature_is_stable() {
        let mut policy = CalibrationPolicy::new(&ClockConfig::default());
        assert!(policy.on_interval(100));
        // Stable temperature: skip once, then the interval count forces it.
        assert!(!policy.on_interval(101));
        assert!(policy.on_interval(101));
        assert!(!policy.on_interval(100));
        assert!(policy.on_interval(102));
    }

    #[test]
    fn policy_calibrates_on_temperature_swing() {
        let mut policy = CalibrationPolicy::new(&ClockConfig::default());
        assert!(policy.on_interval(100));
        // A move of more than half a degree forces calibration immediately.
        assert!(policy.on_interval(103));
        assert!(policy.on_interval(97));
    }

    #[test]
    fn zero_temp_ctiv_calibrates_every_interval() {
        let cfg = ClockConfig {
            rc_temp_ctiv: 0,
            ..ClockConfig::default()
        };
        let mut policy = CalibrationPolicy::new(&cfg);
        for _ in 0..5 {
            assert!(policy.on_interval(100));
        }
    }
}
