//! Peripheral ownership lock.
//!
//! RADIO, TIMER0 and the crypto accelerators are exclusive: at any instant
//! they belong to the link layer, to the caller's timeslot, or to nobody.
//! The lock is the single source of truth the interrupt dispatchers consult
//! to route RADIO and TIMER0 interrupts, so it is only ever changed from the
//! high-priority handlers or with those interrupts not yet enabled.
use core::sync::atomic::{AtomicU8, Ordering};

use crate::pac;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum RadioOwner {
    None,
    /// Link-layer connection events and maintenance work.
    Controller,
    /// The caller's timeslot session.
    Timeslot,
}

const OWNER_NONE: u8 = 0;
const OWNER_CONTROLLER: u8 = 1;
const OWNER_TIMESLOT: u8 = 2;

pub(crate) struct OwnershipLock {
    owner: AtomicU8,
}

impl OwnershipLock {
    pub const fn new() -> Self {
        OwnershipLock {
            owner: AtomicU8::new(OWNER_NONE),
        }
    }

    pub fn owner(&self) -> RadioOwner {
        match self.owner.load(Ordering::Acquire) {
            OWNER_CONTROLLER => RadioOwner::Controller,
            OWNER_TIMESLOT => RadioOwner::Timeslot,
            _ => RadioOwner::None,
        }
    }

    /// Take the radio hardware for `owner`. Fails if anyone holds it.
    pub fn try_acquire(&self, owner: RadioOwner) -> Result<(), RadioOwner> {
        let val = match owner {
            RadioOwner::Controller => OWNER_CONTROLLER,
            RadioOwner::Timeslot => OWNER_TIMESLOT,
            RadioOwner::None => return Err(self.owner()),
        };
        match self
            .owner
            .compare_exchange(OWNER_NONE, val, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            Err(OWNER_CONTROLLER) => Err(RadioOwner::Controller),
            Err(_) => Err(RadioOwner::Timeslot),
        }
    }

    /// Return the radio hardware to the unowned state.
    ///
    /// Quiesces RADIO and TIMER0 so the next owner finds them inert: no
    /// interrupt sources enabled, no pending events, the radio disabled.
    /// Fails when `owner` does not actually hold the lock, which is an
    /// internal consistency violation the caller must escalate.
    pub fn release(&self, owner: RadioOwner) -> Result<(), RadioOwner> {
        let val = match owner {
            RadioOwner::Controller => OWNER_CONTROLLER,
            RadioOwner::Timeslot => OWNER_TIMESLOT,
            RadioOwner::None => return Err(RadioOwner::None),
        };
        if self.owner.load(Ordering::Acquire) != val {
            return Err(self.owner());
        }
        quiesce_radio();
        quiesce_timer0();
        self.owner.store(OWNER_NONE, Ordering::Release);
        Ok(())
    }
}

fn quiesce_radio() {
    let radio = pac::RADIO;
    radio.intenclr().write(|w| w.0 = 0xFFFF_FFFF);
    radio.shorts().write(|w| w.0 = 0);
    // If a transaction is in flight, drive the state machine to DISABLED.
    if radio.state().read().0 != 0 {
        radio.events_disabled().write_value(0);
        radio.tasks_disable().write_value(1);
        while radio.events_disabled().read() == 0 {}
    }
    radio.events_disabled().write_value(0);
    radio.events_ready().write_value(0);
    radio.events_end().write_value(0);
    radio.events_address().write_value(0);
    radio.events_payload().write_value(0);
}

fn quiesce_timer0() {
    let timer = pac::TIMER0;
    timer.tasks_stop().write_value(1);
    timer.tasks_clear().write_value(1);
    timer.intenclr().write(|w| w.0 = 0xFFFF_FFFF);
    for i in 0..4 {
        timer.events_compare(i).write_value(0);
    }
}
