//! Portable core of a BLE Link Layer controller.
//!
//! Everything in this crate is hardware-independent: radio time arbitration,
//! the timeslot session state machine, resource configuration and memory
//! accounting, clock calibration policy and the transport queues. The
//! hardware crate drives these pieces from the nRF interrupt handlers.
#![no_std]

#[cfg(test)]
extern crate std;

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

mod error;

pub mod clock;
pub mod config;
pub mod hci;
pub mod lpwq;
pub mod rand_pool;
pub mod region;
pub mod sched;
pub mod time;
pub mod timeslot;

pub use error::{Error, RetVal};
