//! Low-frequency clock, microsecond timebase and RC calibration.
//!
//! RTC0 runs at 32768 Hz from the low-frequency clock and, together with a
//! software overflow counter, provides the wrapping 32-bit microsecond clock
//! the scheduler works in. Coarse wakeups for slot starts are programmed on
//! CC0, the fine alignment inside a slot is TIMER0's job.
use core::cell::RefCell;
use core::sync::atomic::{AtomicU32, Ordering};

use blectlr::clock::{CalibrationPolicy, ClockConfig, LfclkSource};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;

use crate::pac;
use crate::temp;

// RTC0 INTENSET/INTENCLR bits.
const RTC_INT_OVRFLW: u32 = 1 << 1;
const RTC_INT_COMPARE0: u32 = 1 << 16;

// CLOCK INTENSET/INTENCLR bits.
pub(crate) const CLOCK_INT_HFCLKSTARTED: u32 = 1 << 0;
pub(crate) const CLOCK_INT_LFCLKSTARTED: u32 = 1 << 1;
pub(crate) const CLOCK_INT_DONE: u32 = 1 << 3;
pub(crate) const CLOCK_INT_CTTO: u32 = 1 << 4;

const RTC_COUNTER_BITS: u32 = 24;

/// RTC overflow count, extending the 24-bit counter.
static OVERFLOWS: AtomicU32 = AtomicU32::new(0);

static CAL: Mutex<CriticalSectionRawMutex, RefCell<Option<CalibrationPolicy>>> = Mutex::new(RefCell::new(None));

fn ticks_to_us(ticks: u64) -> u64 {
    // One 32768 Hz tick is 15625/512 microseconds.
    ticks * 15625 / 512
}

fn us_to_ticks_ceil(us: u64) -> u64 {
    (us * 512 + 15624) / 15625
}

/// Start the low-frequency clock and the RTC0 timebase.
///
/// Blocks until the clock source is running. Called once during enable,
/// before any interrupt is unmasked.
pub(crate) fn init(cfg: &ClockConfig) {
    let clock = pac::CLOCK;

    let src = match cfg.source {
        LfclkSource::Rc => 0,
        LfclkSource::Xtal => 1,
        LfclkSource::Synth => 2,
    };
    clock.lfclksrc().write(|w| w.0 = src);
    clock.events_lfclkstarted().write_value(0);
    clock.tasks_lfclkstart().write_value(1);
    while clock.events_lfclkstarted().read() == 0 {}
    clock.events_lfclkstarted().write_value(0);

    let rtc = pac::RTC0;
    rtc.tasks_stop().write_value(1);
    rtc.tasks_clear().write_value(1);
    rtc.prescaler().write(|w| w.0 = 0);
    rtc.events_ovrflw().write_value(0);
    rtc.events_compare(0).write_value(0);
    rtc.intenset().write(|w| w.0 = RTC_INT_OVRFLW);
    OVERFLOWS.store(0, Ordering::Release);
    rtc.tasks_start().write_value(1);

    if cfg.source == LfclkSource::Rc {
        CAL.lock(|c| *c.borrow_mut() = Some(CalibrationPolicy::new(cfg)));
        clock.ctiv().write(|w| w.set_ctiv(cfg.rc_ctiv));
        clock.events_ctto().write_value(0);
        clock.events_done().write_value(0);
        clock.intenset().write(|w| w.0 = CLOCK_INT_CTTO | CLOCK_INT_DONE);
        clock.tasks_ctstart().write_value(1);
    }
}

pub(crate) fn stop() {
    let rtc = pac::RTC0;
    rtc.intenclr().write(|w| w.0 = 0xFFFF_FFFF);
    rtc.tasks_stop().write_value(1);

    let clock = pac::CLOCK;
    clock.intenclr().write(|w| w.0 = CLOCK_INT_CTTO | CLOCK_INT_DONE);
    clock.tasks_ctstop().write_value(1);
    CAL.lock(|c| *c.borrow_mut() = None);
}

/// The current time on the wrapping 32-bit microsecond clock.
pub(crate) fn now_us() -> u32 {
    let rtc = pac::RTC0;
    loop {
        let epoch = OVERFLOWS.load(Ordering::Acquire);
        let counter = rtc.counter().read().counter();
        // An unserviced overflow means the counter wrapped but the epoch has
        // not caught up yet.
        if rtc.events_ovrflw().read() != 0 {
            continue;
        }
        if OVERFLOWS.load(Ordering::Acquire) != epoch {
            continue;
        }
        let ticks = (u64::from(epoch) << RTC_COUNTER_BITS) | u64::from(counter);
        return ticks_to_us(ticks) as u32;
    }
}

/// Program the coarse wakeup on CC0 for `target_us`.
///
/// The compare fires a couple of ticks late at worst, which is inside the
/// start jitter budget because the fine start alignment runs on TIMER0.
pub(crate) fn set_wakeup_at(target_us: u32) {
    let rtc = pac::RTC0;
    let delta_us = target_us.wrapping_sub(now_us());
    let mut ticks = us_to_ticks_ceil(u64::from(delta_us)) as u32;
    // The RTC compare needs at least two ticks of lead to latch.
    if ticks < 2 {
        ticks = 2;
    }
    let counter = rtc.counter().read().counter();
    let cc = counter.wrapping_add(ticks) & ((1 << RTC_COUNTER_BITS) - 1);
    rtc.cc(0).write(|w| w.set_compare(cc));
    rtc.events_compare(0).write_value(0);
    rtc.intenset().write(|w| w.0 = RTC_INT_COMPARE0);
}

pub(crate) fn clear_wakeup() {
    let rtc = pac::RTC0;
    rtc.intenclr().write(|w| w.0 = RTC_INT_COMPARE0);
    rtc.events_compare(0).write_value(0);
}

/// Service the RTC0 interrupt. Returns `true` when the coarse wakeup fired.
pub(crate) fn on_rtc_interrupt() -> bool {
    let rtc = pac::RTC0;
    if rtc.events_ovrflw().read() != 0 {
        rtc.events_ovrflw().write_value(0);
        OVERFLOWS.fetch_add(1, Ordering::AcqRel);
    }
    if rtc.events_compare(0).read() != 0 {
        rtc.events_compare(0).write_value(0);
        rtc.intenclr().write(|w| w.0 = RTC_INT_COMPARE0);
        return true;
    }
    false
}

/// The calibration timer expired. Returns `true` when the RC oscillator
/// should be recalibrated now.
pub(crate) fn on_cal_interval() -> bool {
    let t = temp::measure();
    CAL.lock(|c| match c.borrow_mut().as_mut() {
        Some(policy) => policy.on_interval(t.raw()),
        None => false,
    })
}

/// Run one calibration cycle. The crystal oscillator must be running.
pub(crate) fn start_calibration() {
    let clock = pac::CLOCK;
    clock.events_done().write_value(0);
    clock.tasks_cal().write_value(1);
}

/// Restart the calibration interval timer.
pub(crate) fn restart_cal_timer() {
    pac::CLOCK.tasks_ctstart().write_value(1);
}
