//! High-frequency crystal oscillator control.
//!
//! The crystal is started on demand: the scheduler requests it ahead of
//! crystal-guaranteed slots and for RC calibration, and the application can
//! hold its own request through the [`Hfclk`] handle. The oscillator runs
//! while at least one request is outstanding.
use core::marker::PhantomData;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;

use crate::pac;
use crate::Error;

static SIGNAL: Signal<CriticalSectionRawMutex, ()> = Signal::new();
static HANDLE_TAKEN: AtomicBool = AtomicBool::new(false);
static REQUESTS: AtomicU8 = AtomicU8::new(0);

const HFCLKSTAT_STATE: u32 = 1 << 16;
const HFCLKSTAT_SRC_XTAL: u32 = 1;
const INTEN_HFCLKSTARTED: u32 = 1 << 0;

/// Returns `true` while the crystal oscillator is the active HF clock source.
pub(crate) fn is_running() -> bool {
    let stat = pac::CLOCK.hfclkstat().read().0;
    stat & HFCLKSTAT_STATE != 0 && stat & HFCLKSTAT_SRC_XTAL != 0
}

/// Add one request for the crystal. Starts it on the first request.
pub(crate) fn request() {
    if REQUESTS.fetch_add(1, Ordering::AcqRel) == 0 {
        let clock = pac::CLOCK;
        clock.events_hfclkstarted().write_value(0);
        clock.intenset().write(|w| w.0 = INTEN_HFCLKSTARTED);
        clock.tasks_hfclkstart().write_value(1);
    }
}

/// Drop one request. Stops the crystal when none remain.
pub(crate) fn release() {
    if REQUESTS.fetch_sub(1, Ordering::AcqRel) == 1 {
        pac::CLOCK.tasks_hfclkstop().write_value(1);
        SIGNAL.reset();
    }
}

/// Called from the POWER_CLOCK interrupt when the crystal has started.
pub(crate) fn on_started() {
    SIGNAL.signal(());
}

/// An application-held request for the crystal oscillator.
///
/// The request is dropped when the handle is.
pub struct Hfclk {
    // Prevent Send, Sync
    _private: PhantomData<*mut ()>,
}

impl Drop for Hfclk {
    fn drop(&mut self) {
        release();
        HANDLE_TAKEN.store(false, Ordering::Release);
    }
}

impl Hfclk {
    pub(crate) fn new() -> Result<Self, Error> {
        if HANDLE_TAKEN.swap(true, Ordering::Acquire) {
            // Only one Hfclk request is allowed at a time
            return Err(Error::EINVAL);
        }
        request();
        Ok(Hfclk { _private: PhantomData })
    }

    /// Wait until the crystal oscillator is running.
    pub async fn wait() {
        if !is_running() {
            SIGNAL.wait().await
        }
    }
}
