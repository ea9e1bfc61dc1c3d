//! Temperature sensor access.
use crate::pac;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// A temperature measurement.
pub struct Temperature(pub(crate) i32);

impl Temperature {
    /// The integer part of the temperature in degrees Celsius.
    pub fn degrees(self) -> i32 {
        self.0 / 4
    }

    /// The fractional part of the temperature in milli-degrees Celsius.
    pub fn millidegrees(self) -> i32 {
        (self.0 & 0x03) * 250
    }

    /// The raw temperature value, in units of 0.25 degrees Celsius.
    pub fn raw(self) -> i32 {
        self.0
    }
}

/// Blocking die temperature measurement.
///
/// Takes about 35 us. Called from the calibration interval handler at low
/// priority only, so blocking is acceptable.
pub(crate) fn measure() -> Temperature {
    let temp = pac::TEMP;
    temp.events_datardy().write_value(0);
    temp.tasks_start().write_value(1);
    while temp.events_datardy().read() == 0 {}
    temp.events_datardy().write_value(0);
    temp.tasks_stop().write_value(1);
    Temperature(temp.temp().read() as i32)
}
