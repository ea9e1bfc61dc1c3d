//! Interrupt-side slot machinery.
//!
//! The coarse wakeup arrives on RTC0, the fine slot start and the end-of-slot
//! watchdog run on TIMER0, and RADIO interrupts are routed by the ownership
//! lock. Everything here runs at the highest interrupt priority except the
//! POWER_CLOCK handler.
use blectlr::lpwq::WorkEvent;
use blectlr::sched::{MaintKind, Owner, WorkItem, GUARD_US};
use blectlr::time::delta;
use blectlr::timeslot::{HfclkMode, Priority, Signal, SlotDirective, TimeslotRequest};
use blectlr::Error;

use crate::controller::{with_state, State, POL, WORK_QUEUE};
use crate::pol::RadioOwner;
use crate::{hfclk, lfclk, pac, rng};

// TIMER0 INTENSET/INTENCLR bits.
const TIMER_INT_COMPARE0: u32 = 1 << 16;
const TIMER_INT_COMPARE1: u32 = 1 << 17;
const TIMER_INT_COMPARE2: u32 = 1 << 18;
const TIMER_INT_COMPARE3: u32 = 1 << 19;

/// Lead time between the coarse RTC wakeup and the slot start, absorbed by
/// the fine timer.
const FINE_LEAD_US: u32 = 150;

/// Length of the radio-silent slot used for an RC calibration cycle.
const CAL_SLOT_LENGTH_US: u32 = 1_000;

/// How long a calibration slot may be deferred by other radio activity.
const CAL_SLOT_DEADLINE_US: u32 = 1_000_000;

fn pol_owner(owner: Owner) -> RadioOwner {
    match owner {
        Owner::Timeslot => RadioOwner::Timeslot,
        Owner::LinkLayer(_) | Owner::Maintenance(_) => RadioOwner::Controller,
    }
}

/// Re-run arbitration and bring the wakeup hardware in line with the result.
pub(crate) fn run_arbitration(s: &mut State, now_us: u32) {
    let prev = s.scheduler.committed().copied();
    let mut blocked: heapless::Vec<Owner, { blectlr::sched::MAX_PENDING + 1 }> = heapless::Vec::new();
    s.scheduler.arbitrate(now_us, |owner| {
        let _ = blocked.push(owner);
    });
    // A displaced committed slot may already hold the radio hardware.
    if let Some(p) = prev {
        if !p.started && s.scheduler.committed().map(|c| c.item) != Some(p.item) {
            disarm_slot(s, p.item.owner);
        }
    }
    for owner in blocked {
        match owner {
            Owner::Timeslot => s.session.on_blocked(&WORK_QUEUE),
            Owner::LinkLayer(handle) => {
                if let Some(hooks) = &s.hooks {
                    (hooks.on_event_blocked)(handle);
                }
            }
            Owner::Maintenance(MaintKind::RcCalibration) => {
                warn!("calibration slot missed its deadline, retrying next interval");
                lfclk::restart_cal_timer();
            }
        }
    }
    rearm(s);
}

fn rearm(s: &mut State) {
    match s.scheduler.committed() {
        Some(c) if !c.started => {
            if c.item.hfclk == HfclkMode::XtalGuaranteed && !s.hfclk_held {
                hfclk::request();
                s.hfclk_held = true;
            }
            lfclk::set_wakeup_at(c.start_us.wrapping_sub(FINE_LEAD_US));
        }
        Some(_) => {}
        None => {
            lfclk::clear_wakeup();
            if s.hfclk_held {
                hfclk::release();
                s.hfclk_held = false;
            }
        }
    }
}

/// Move the session's handed-off request into the arbiter.
pub(crate) fn submit_session_request(s: &mut State, req: &TimeslotRequest) -> Result<(), Error> {
    let now = lfclk::now_us();
    let item = WorkItem::from_request(req, now, s.anchor_us, hfclk::is_running())?;
    s.scheduler.submit(item)?;
    run_arbitration(s, now);
    Ok(())
}

pub(crate) fn rtc0_isr() {
    if lfclk::on_rtc_interrupt() {
        with_state(arm_fine_timer);
    }
}

// The coarse wakeup fired: take the radio hardware for the committed owner
// and let TIMER0 hit the exact start.
fn arm_fine_timer(s: &mut State) {
    let Some(c) = s.scheduler.committed().copied() else { return };
    if c.started {
        return;
    }
    if let Err(holder) = POL.try_acquire(pol_owner(c.item.owner)) {
        error!("radio still owned by {:?} at slot start", holder);
        WORK_QUEUE.post(WorkEvent::Fault {
            file: file!(),
            line: line!(),
        });
        return;
    }
    s.slot_armed = true;

    let t = pac::TIMER0;
    t.tasks_stop().write_value(1);
    t.tasks_clear().write_value(1);
    t.mode().write(|w| w.0 = 0);
    t.bitmode().write(|w| w.0 = 3);
    t.prescaler().write(|w| w.0 = 4);
    for i in 0..4 {
        t.events_compare(i).write_value(0);
    }
    let now = lfclk::now_us();
    let to_start = delta(now, c.start_us).max(1) as u32;
    t.cc(0).write_value(to_start);
    t.cc(3).write_value(to_start.wrapping_add(c.item.length_us));
    t.intenset().write(|w| w.0 = TIMER_INT_COMPARE0 | TIMER_INT_COMPARE3);
    t.tasks_start().write_value(1);
}

// Where an in-slot signal goes: the session's handler or a link-layer hook.
// Resolved under the state lock, invoked with the lock dropped.
enum InSlotTarget {
    Session,
    Hook(fn(u8), u8),
}

pub(crate) fn timer0_isr() {
    let t = pac::TIMER0;
    if POL.owner() == RadioOwner::None {
        // Spurious: nobody owns the timer.
        t.intenclr().write(|w| w.0 = 0xFFFF_FFFF);
        return;
    }

    let started = t.events_compare(0).read() != 0;
    if started {
        t.events_compare(0).write_value(0);
        t.intenclr().write(|w| w.0 = TIMER_INT_COMPARE0);
    }
    let in_slot_timer = t.events_compare(1).read() != 0 || t.events_compare(2).read() != 0;
    if in_slot_timer {
        t.events_compare(1).write_value(0);
        t.events_compare(2).write_value(0);
    }
    let expired = t.events_compare(3).read() != 0;
    if expired {
        t.events_compare(3).write_value(0);
        t.intenclr().write(|w| w.0 = TIMER_INT_COMPARE3);
    }

    if started {
        let signal = with_state(|s| {
            let c = s.scheduler.committed().copied()?;
            if c.started {
                return None;
            }
            s.scheduler.on_started();
            match c.item.owner {
                Owner::Timeslot => {
                    s.anchor_us = Some(c.start_us);
                    Some(s.session.on_slot_start())
                }
                Owner::LinkLayer(handle) => {
                    if let Some(hooks) = &s.hooks {
                        (hooks.on_event_start)(handle);
                    }
                    None
                }
                Owner::Maintenance(MaintKind::RcCalibration) => {
                    lfclk::start_calibration();
                    None
                }
            }
        })
        .flatten();
        if let Some(signal) = signal {
            run_session_signal(signal);
        }
    }

    if in_slot_timer {
        forward_in_slot(Signal::Timer0, |hooks| hooks.on_timer);
    }

    if expired {
        // The granted window is over. An owner that left the radio active
        // past its window has overstayed; a quiet expiry is the normal end
        // of a slot that ran its course.
        let ended = with_state(|s| {
            let c = s.scheduler.committed().copied()?;
            let hook = match c.item.owner {
                Owner::Timeslot => {
                    if pac::RADIO.state().read().0 != 0 {
                        WORK_QUEUE.post(WorkEvent::Overstayed);
                    }
                    None
                }
                Owner::LinkLayer(handle) => s.hooks.map(|h| (h.on_event_end, handle)),
                Owner::Maintenance(_) => None,
            };
            teardown_slot(s);
            hook
        })
        .flatten();
        if let Some((hook, handle)) = ended {
            hook(handle);
        }
    }
}

pub(crate) fn radio_isr() {
    match POL.owner() {
        RadioOwner::Timeslot => run_session_signal(Signal::Radio),
        RadioOwner::Controller => forward_in_slot(Signal::Radio, |hooks| hooks.on_radio),
        RadioOwner::None => {
            // Spurious: nobody owns the radio.
            pac::RADIO.intenclr().write(|w| w.0 = 0xFFFF_FFFF);
        }
    }
}

fn forward_in_slot(signal: Signal, pick: impl Fn(&crate::controller::LinkLayerHooks) -> fn(u8)) {
    let target = with_state(|s| {
        let c = s.scheduler.committed()?;
        match c.item.owner {
            Owner::Timeslot => Some(InSlotTarget::Session),
            Owner::LinkLayer(handle) => s.hooks.as_ref().map(|h| InSlotTarget::Hook(pick(h), handle)),
            Owner::Maintenance(_) => None,
        }
    })
    .flatten();
    match target {
        Some(InSlotTarget::Session) => run_session_signal(signal),
        Some(InSlotTarget::Hook(hook, handle)) => hook(handle),
        None => {}
    }
}

// Put `signal` to the session's handler with the state lock dropped, so the
// handler may call back into the controller API, then fold its answer back
// into the state machine. An extension answer produces a follow-up signal.
fn run_session_signal(signal: Signal) {
    let mut signal = signal;
    loop {
        let Some(handler) = with_state(|s| s.session.handler()).flatten() else { return };
        let action = handler(signal);
        let next = with_state(|s| {
            match s.session.apply_in_slot_action(action, &WORK_QUEUE) {
                SlotDirective::Continue => None,
                SlotDirective::End => {
                    teardown_slot(s);
                    None
                }
                SlotDirective::TryExtend { length_us } => {
                    let now = lfclk::now_us();
                    let granted = s.scheduler.try_extend(now, length_us);
                    if granted {
                        let t = pac::TIMER0;
                        let end = t.cc(3).read();
                        t.cc(3).write_value(end.wrapping_add(length_us));
                        t.intenset().write(|w| w.0 = TIMER_INT_COMPARE3);
                    }
                    Some(s.session.on_extend_result(granted))
                }
            }
        })
        .flatten();
        match next {
            Some(follow_up) => signal = follow_up,
            None => return,
        }
    }
}

pub(crate) fn power_clock_isr() {
    let clock = pac::CLOCK;
    if clock.events_hfclkstarted().read() != 0 {
        clock.events_hfclkstarted().write_value(0);
        hfclk::on_started();
        WORK_QUEUE.post(WorkEvent::HfclkStarted);
    }
    if clock.events_ctto().read() != 0 {
        clock.events_ctto().write_value(0);
        if lfclk::on_cal_interval() {
            with_state(submit_calibration);
        } else {
            lfclk::restart_cal_timer();
        }
    }
    if clock.events_done().read() != 0 {
        clock.events_done().write_value(0);
        trace!("rc calibration done");
        lfclk::restart_cal_timer();
    }
}

pub(crate) fn rng_isr() {
    rng::on_interrupt();
}

fn submit_calibration(s: &mut State) {
    let now = lfclk::now_us();
    let item = WorkItem {
        owner: Owner::Maintenance(MaintKind::RcCalibration),
        earliest_us: now.wrapping_add(GUARD_US),
        latest_start_us: now.wrapping_add(CAL_SLOT_DEADLINE_US),
        length_us: CAL_SLOT_LENGTH_US,
        priority: Priority::High,
        hfclk: HfclkMode::XtalGuaranteed,
    };
    if s.scheduler.submit(item).is_err() {
        warn!("no room for calibration slot, retrying next interval");
        lfclk::restart_cal_timer();
        return;
    }
    run_arbitration(s, now);
}

/// Release the radio hardware held for a committed slot that was withdrawn
/// between the coarse wakeup and its start.
pub(crate) fn disarm_slot(s: &mut State, owner: Owner) {
    if !s.slot_armed {
        return;
    }
    s.slot_armed = false;
    // Releasing the lock quiesces RADIO and TIMER0.
    if POL.release(pol_owner(owner)).is_err() {
        WORK_QUEUE.post(WorkEvent::Fault {
            file: file!(),
            line: line!(),
        });
    }
}

pub(crate) fn teardown_slot(s: &mut State) {
    let Some(owner) = s.scheduler.complete() else { return };
    s.slot_armed = false;
    if POL.release(pol_owner(owner)).is_err() {
        WORK_QUEUE.post(WorkEvent::Fault {
            file: file!(),
            line: line!(),
        });
    }
    if s.hfclk_held {
        hfclk::release();
        s.hfclk_held = false;
    }
    if owner == Owner::Timeslot {
        s.session.on_slot_end(&WORK_QUEUE);
        if let Some(req) = s.session.take_pending() {
            if submit_session_request(s, &req).is_err() {
                s.session.on_blocked(&WORK_QUEUE);
            }
            return;
        }
    }
    let now = lfclk::now_us();
    run_arbitration(s, now);
}
