//! Timeslot session state machine.
//!
//! A session is the caller's handle on the shared radio hardware. While a
//! session is open the caller submits timeslot requests, and the signal
//! handler is invoked at the start of each granted slot and for every radio
//! and timer interrupt inside it. The handler's return value steers the slot:
//! it can keep going, extend, end, or end and request the next slot in one
//! step.
//!
//! Signal handlers for in-slot signals run at the highest interrupt priority
//! and must be short. Session-level outcomes (blocked, cancelled, idle,
//! closed) are delivered from the low-priority work queue instead.
use crate::error::Error;
use crate::lpwq::{WorkEvent, WorkQueue};
use crate::time::HORIZON_MAX_US;

/// Shortest grantable timeslot, in microseconds.
pub const LENGTH_MIN_US: u32 = 100;

/// Longest grantable timeslot, in microseconds.
pub const LENGTH_MAX_US: u32 = 100_000;

/// Shortest permitted extension, in microseconds.
pub const EXTENSION_MIN_US: u32 = 200;

/// Worst-case deviation of the actual slot start from the requested start.
pub const START_JITTER_US: u32 = 2;

/// High-frequency clock guarantee for a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HfclkMode {
    /// The crystal oscillator is running before the slot starts.
    XtalGuaranteed,
    /// No oscillator guarantee, the slot starts on whatever source is active.
    NoGuarantee,
}

/// Scheduling priority of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Priority {
    Normal,
    High,
}

/// A timeslot request.
///
/// The first request in a session must be [`TimeslotRequest::Earliest`].
/// Subsequent requests may be [`TimeslotRequest::Normal`], placed relative to
/// the start of the previous slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimeslotRequest {
    /// Request the earliest possible slot within `timeout_us`.
    Earliest {
        hfclk: HfclkMode,
        priority: Priority,
        length_us: u32,
        timeout_us: u32,
    },
    /// Request a slot starting `distance_us` after the previous slot's start.
    Normal {
        hfclk: HfclkMode,
        priority: Priority,
        distance_us: u32,
        length_us: u32,
    },
}

impl TimeslotRequest {
    pub fn length_us(&self) -> u32 {
        match *self {
            TimeslotRequest::Earliest { length_us, .. } => length_us,
            TimeslotRequest::Normal { length_us, .. } => length_us,
        }
    }

    pub fn priority(&self) -> Priority {
        match *self {
            TimeslotRequest::Earliest { priority, .. } => priority,
            TimeslotRequest::Normal { priority, .. } => priority,
        }
    }

    pub fn hfclk(&self) -> HfclkMode {
        match *self {
            TimeslotRequest::Earliest { hfclk, .. } => hfclk,
            TimeslotRequest::Normal { hfclk, .. } => hfclk,
        }
    }

    fn validate(&self) -> Result<(), Error> {
        let length = self.length_us();
        if !(LENGTH_MIN_US..=LENGTH_MAX_US).contains(&length) {
            return Err(Error::EINVAL);
        }
        match *self {
            TimeslotRequest::Earliest { timeout_us, .. } => {
                if timeout_us < length || timeout_us > HORIZON_MAX_US {
                    return Err(Error::EINVAL);
                }
            }
            TimeslotRequest::Normal { distance_us, .. } => {
                if distance_us == 0 || distance_us > HORIZON_MAX_US {
                    return Err(Error::EINVAL);
                }
            }
        }
        Ok(())
    }
}

/// A signal delivered to the session's signal handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Signal {
    /// The granted slot has started. Delivered at the start of every slot.
    Start,
    /// TIMER0 interrupt inside the slot.
    Timer0,
    /// RADIO interrupt inside the slot.
    Radio,
    /// A requested extension was granted.
    ExtendSucceeded,
    /// A requested extension was denied.
    ExtendFailed,
    /// The pending request could not be scheduled.
    Blocked,
    /// The pending request was discarded.
    Cancelled,
    /// The slot ended with no request pending.
    SessionIdle,
    /// A previous handler return was invalid and the slot was ended.
    InvalidReturn,
    /// The previous slot ran past its granted window.
    Overstayed,
    /// The session close has completed.
    Closed,
}

/// The handler's answer to a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// Nothing to do.
    None,
    /// End the current slot.
    End,
    /// Extend the current slot by `length_us` microseconds.
    Extend { length_us: u32 },
    /// End the current slot and request the next one.
    Request(&'static TimeslotRequest),
}

/// In-slot signal handler. Runs at the highest interrupt priority.
pub type SignalHandler = fn(Signal) -> SignalAction;

/// What the hardware layer must do after a handler return was processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotDirective {
    /// Keep the slot running.
    Continue,
    /// Tear the slot down and call [`Session::on_slot_end`].
    End,
    /// Ask the arbiter for an extension, then call
    /// [`Session::on_extend_result`].
    TryExtend { length_us: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SessionState {
    Closed,
    /// Open with no request pending.
    OpenIdle,
    /// A request is pending with the arbiter.
    Requested,
    /// A granted slot is running.
    Running,
    /// An extension request is in flight.
    Extending,
}

/// One timeslot session.
pub struct Session {
    state: SessionState,
    handler: Option<SignalHandler>,
    pending: Option<TimeslotRequest>,
    // A Normal request needs a previous slot start to anchor to.
    has_anchor: bool,
    closing: bool,
}

impl Session {
    pub const fn new() -> Self {
        Session {
            state: SessionState::Closed,
            handler: None,
            pending: None,
            has_anchor: false,
            closing: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The request waiting to be handed to the arbiter, if any.
    pub fn take_pending(&mut self) -> Option<TimeslotRequest> {
        self.pending.take()
    }

    pub fn is_open(&self) -> bool {
        !matches!(self.state, SessionState::Closed)
    }

    /// Open the session with `handler` as its signal handler.
    pub fn open(&mut self, handler: SignalHandler) -> Result<(), Error> {
        if self.is_open() {
            return Err(Error::EAGAIN);
        }
        self.state = SessionState::OpenIdle;
        self.handler = Some(handler);
        self.pending = None;
        self.has_anchor = false;
        self.closing = false;
        trace!("timeslot session opened");
        Ok(())
    }

    /// Close the session.
    ///
    /// A pending request is discarded with a [`Signal::Cancelled`]
    /// notification. If a slot is running the close completes when the slot
    /// ends; otherwise it completes immediately with [`Signal::Closed`].
    pub fn close(&mut self, wq: &WorkQueue) -> Result<(), Error> {
        match self.state {
            // Already closed; retryable once a session is opened again.
            SessionState::Closed => Err(Error::EAGAIN),
            SessionState::OpenIdle => {
                self.finish_close(wq);
                Ok(())
            }
            SessionState::Requested => {
                self.pending = None;
                wq.post(WorkEvent::Cancelled);
                self.finish_close(wq);
                Ok(())
            }
            SessionState::Running | SessionState::Extending => {
                // A request held for the slot's end is discarded.
                if self.pending.take().is_some() {
                    wq.post(WorkEvent::Cancelled);
                }
                self.closing = true;
                Ok(())
            }
        }
    }

    fn finish_close(&mut self, wq: &WorkQueue) {
        self.state = SessionState::Closed;
        self.pending = None;
        self.closing = false;
        wq.post(WorkEvent::SessionClosed);
        trace!("timeslot session closed");
    }

    /// Record a request arriving through the request entry point.
    ///
    /// From the idle state the request becomes pending immediately. From
    /// inside a running slot a distance-anchored request is accepted and
    /// held until the slot ends; an earliest-type request is not allowed
    /// there.
    pub fn request(&mut self, req: &TimeslotRequest) -> Result<(), Error> {
        match self.state {
            SessionState::Closed => return Err(Error::EAGAIN),
            SessionState::OpenIdle => {}
            SessionState::Running | SessionState::Extending => {
                // Only one request may be in flight per session.
                if self.closing || self.pending.is_some() {
                    return Err(Error::EAGAIN);
                }
                if matches!(req, TimeslotRequest::Earliest { .. }) {
                    return Err(Error::EINVAL);
                }
            }
            SessionState::Requested => return Err(Error::EAGAIN),
        }
        req.validate()?;
        if matches!(req, TimeslotRequest::Normal { .. }) && !self.has_anchor {
            return Err(Error::EINVAL);
        }
        self.pending = Some(*req);
        if self.state == SessionState::OpenIdle {
            self.state = SessionState::Requested;
        }
        Ok(())
    }

    /// Withdraw a request that was never handed to the arbiter.
    ///
    /// Used when submission fails synchronously and the error is reported to
    /// the caller directly, so no notification is posted.
    pub fn rescind(&mut self) {
        if self.state == SessionState::Requested {
            self.pending = None;
            self.state = SessionState::OpenIdle;
        }
    }

    /// The installed signal handler.
    ///
    /// The caller invokes it with the session state lock dropped, so the
    /// handler may call back into the request entry point, and feeds the
    /// returned action to [`Session::apply_in_slot_action`] or
    /// [`Session::apply_low_prio_action`].
    pub fn handler(&self) -> Option<SignalHandler> {
        self.handler
    }

    /// The arbiter granted the pending request and the slot has started.
    ///
    /// Called from the timer interrupt at slot start. Returns the signal to
    /// put to the handler.
    pub fn on_slot_start(&mut self) -> Signal {
        debug_assert_eq!(self.state, SessionState::Requested);
        self.state = SessionState::Running;
        self.has_anchor = true;
        Signal::Start
    }

    /// The arbiter answered an extension request. Returns the signal to put
    /// to the handler.
    pub fn on_extend_result(&mut self, granted: bool) -> Signal {
        debug_assert_eq!(self.state, SessionState::Extending);
        self.state = SessionState::Running;
        if granted {
            Signal::ExtendSucceeded
        } else {
            Signal::ExtendFailed
        }
    }

    /// The slot has been torn down.
    ///
    /// Moves the session to its next resting state and posts the matching
    /// notification.
    pub fn on_slot_end(&mut self, wq: &WorkQueue) {
        debug_assert!(matches!(self.state, SessionState::Running | SessionState::Extending));
        if self.closing {
            self.finish_close(wq);
        } else if self.pending.is_some() {
            self.state = SessionState::Requested;
        } else {
            self.state = SessionState::OpenIdle;
            wq.post(WorkEvent::SessionIdle);
        }
    }

    /// The arbiter rejected the pending request.
    pub fn on_blocked(&mut self, wq: &WorkQueue) {
        debug_assert_eq!(self.state, SessionState::Requested);
        self.pending = None;
        self.state = SessionState::OpenIdle;
        wq.post(WorkEvent::Blocked);
    }

    /// The arbiter discarded the pending request.
    pub fn on_cancelled(&mut self, wq: &WorkQueue) {
        debug_assert_eq!(self.state, SessionState::Requested);
        self.pending = None;
        self.state = SessionState::OpenIdle;
        wq.post(WorkEvent::Cancelled);
    }

    /// Whether `signal` should reach the handler in the current state.
    pub fn wants_low_prio(&self, signal: Signal) -> bool {
        self.handler.is_some() && (self.is_open() || signal == Signal::Closed)
    }

    /// Process the handler's answer to a session-level signal.
    ///
    /// Only [`SignalAction::None`] and [`SignalAction::Request`] are valid
    /// here. A new request from the handler is validated and queued exactly
    /// as one submitted from thread context.
    pub fn apply_low_prio_action(&mut self, action: SignalAction, wq: &WorkQueue) {
        match action {
            SignalAction::None => {}
            SignalAction::Request(req) => {
                if self.request(req).is_err() {
                    wq.post(WorkEvent::InvalidReturn);
                }
            }
            SignalAction::End | SignalAction::Extend { .. } => {
                wq.post(WorkEvent::InvalidReturn);
            }
        }
    }

    /// Process the handler's answer to an in-slot signal.
    pub fn apply_in_slot_action(&mut self, action: SignalAction, wq: &WorkQueue) -> SlotDirective {
        match action {
            SignalAction::None => SlotDirective::Continue,
            SignalAction::End => SlotDirective::End,
            SignalAction::Extend { length_us } => {
                if length_us < EXTENSION_MIN_US || length_us > LENGTH_MAX_US {
                    wq.post(WorkEvent::InvalidReturn);
                    return SlotDirective::End;
                }
                self.state = SessionState::Extending;
                SlotDirective::TryExtend { length_us }
            }
            SignalAction::Request(req) => {
                // Requesting the next slot ends this one. An earliest-type
                // request is not allowed from inside a slot.
                if matches!(req, TimeslotRequest::Earliest { .. }) || req.validate().is_err() {
                    wq.post(WorkEvent::InvalidReturn);
                    return SlotDirective::End;
                }
                self.pending = Some(*req);
                SlotDirective::End
            }
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};
    use std::vec::Vec;

    static NEXT_ACTION: AtomicU32 = AtomicU32::new(0);

    const ACT_NONE: u32 = 0;
    const ACT_END: u32 = 1;
    const ACT_EXTEND: u32 = 2;
    const ACT_EXTEND_SHORT: u32 = 3;
    const ACT_REQUEST_NORMAL: u32 = 4;
    const ACT_REQUEST_EARLIEST: u32 = 5;

    static NORMAL_REQ: TimeslotRequest = TimeslotRequest::Normal {
        hfclk: HfclkMode::XtalGuaranteed,
        priority: Priority::Normal,
        distance_us: 20_000,
        length_us: 5_000,
    };

    static EARLIEST_REQ: TimeslotRequest = TimeslotRequest::Earliest {
        hfclk: HfclkMode::XtalGuaranteed,
        priority: Priority::Normal,
        length_us: 5_000,
        timeout_us: 100_000,
    };

    fn scripted_handler(_signal: Signal) -> SignalAction {
        match NEXT_ACTION.load(Ordering::Relaxed) {
            ACT_END => SignalAction::End,
            ACT_EXTEND => SignalAction::Extend { length_us: 1_000 },
            ACT_EXTEND_SHORT => SignalAction::Extend { length_us: 100 },
            ACT_REQUEST_NORMAL => SignalAction::Request(&NORMAL_REQ),
            ACT_REQUEST_EARLIEST => SignalAction::Request(&EARLIEST_REQ),
            _ => SignalAction::None,
        }
    }

    fn drained(wq: &WorkQueue) -> Vec<WorkEvent> {
        let mut seen = Vec::new();
        wq.drain(|e| seen.push(e));
        seen
    }

    fn open_session() -> (Session, WorkQueue) {
        let mut s = Session::new();
        NEXT_ACTION.store(ACT_NONE, Ordering::Relaxed);
        s.open(scripted_handler).unwrap();
        (s, WorkQueue::new())
    }

    // Mirrors the request entry point: the pending request goes straight to
    // the arbiter.
    fn request_and_hand_off(s: &mut Session, req: &TimeslotRequest) {
        s.request(req).unwrap();
        assert_eq!(s.take_pending(), Some(*req));
    }

    // Mirrors the interrupt layer: the handler runs with the state lock
    // dropped and its answer is folded back in.
    fn in_slot(s: &mut Session, signal: Signal, wq: &WorkQueue) -> SlotDirective {
        let handler = s.handler().unwrap();
        s.apply_in_slot_action(handler(signal), wq)
    }

    fn start_slot(s: &mut Session, wq: &WorkQueue) -> SlotDirective {
        let signal = s.on_slot_start();
        assert_eq!(signal, Signal::Start);
        in_slot(s, signal, wq)
    }

    fn low_prio(s: &mut Session, signal: Signal, wq: &WorkQueue) {
        if !s.wants_low_prio(signal) {
            return;
        }
        let handler = s.handler().unwrap();
        s.apply_low_prio_action(handler(signal), wq);
    }

    #[test]
    fn open_is_exclusive() {
        let (mut s, _wq) = open_session();
        assert_eq!(s.open(scripted_handler), Err(Error::EAGAIN));
    }

    #[test]
    fn first_request_must_be_earliest() {
        let (mut s, _wq) = open_session();
        assert_eq!(s.request(&NORMAL_REQ), Err(Error::EINVAL));
        s.request(&EARLIEST_REQ).unwrap();
        assert_eq!(s.state(), SessionState::Requested);
    }

    #[test]
    fn only_one_request_in_flight() {
        let (mut s, _wq) = open_session();
        s.request(&EARLIEST_REQ).unwrap();
        assert_eq!(s.request(&EARLIEST_REQ), Err(Error::EAGAIN));
    }

    #[test]
    fn request_validation_rejects_bad_lengths() {
        let (mut s, _wq) = open_session();
        let too_short = TimeslotRequest::Earliest {
            hfclk: HfclkMode::NoGuarantee,
            priority: Priority::Normal,
            length_us: 99,
            timeout_us: 50_000,
        };
        assert_eq!(s.request(&too_short), Err(Error::EINVAL));
        let too_long = TimeslotRequest::Earliest {
            hfclk: HfclkMode::NoGuarantee,
            priority: Priority::Normal,
            length_us: 100_001,
            timeout_us: 120_000_000,
        };
        assert_eq!(s.request(&too_long), Err(Error::EINVAL));
    }

    #[test]
    fn slot_lifecycle_end_without_new_request_goes_idle() {
        let (mut s, wq) = open_session();
        request_and_hand_off(&mut s, &EARLIEST_REQ);
        NEXT_ACTION.store(ACT_END, Ordering::Relaxed);
        assert_eq!(start_slot(&mut s, &wq), SlotDirective::End);
        s.on_slot_end(&wq);
        assert_eq!(s.state(), SessionState::OpenIdle);
        assert_eq!(drained(&wq), [WorkEvent::SessionIdle]);
    }

    #[test]
    fn request_from_handler_chains_to_next_slot() {
        let (mut s, wq) = open_session();
        request_and_hand_off(&mut s, &EARLIEST_REQ);
        NEXT_ACTION.store(ACT_REQUEST_NORMAL, Ordering::Relaxed);
        assert_eq!(start_slot(&mut s, &wq), SlotDirective::End);
        s.on_slot_end(&wq);
        assert_eq!(s.state(), SessionState::Requested);
        assert_eq!(s.take_pending(), Some(NORMAL_REQ));
        assert!(drained(&wq).is_empty());
    }

    #[test]
    fn earliest_from_inside_slot_is_invalid() {
        let (mut s, wq) = open_session();
        request_and_hand_off(&mut s, &EARLIEST_REQ);
        NEXT_ACTION.store(ACT_REQUEST_EARLIEST, Ordering::Relaxed);
        assert_eq!(start_slot(&mut s, &wq), SlotDirective::End);
        s.on_slot_end(&wq);
        assert_eq!(s.state(), SessionState::OpenIdle);
        assert_eq!(drained(&wq), [WorkEvent::InvalidReturn, WorkEvent::SessionIdle]);
    }

    #[test]
    fn normal_request_from_inside_slot_is_held_for_slot_end() {
        let (mut s, wq) = open_session();
        request_and_hand_off(&mut s, &EARLIEST_REQ);
        assert_eq!(start_slot(&mut s, &wq), SlotDirective::Continue);

        // The handler calls back into the request entry point. An
        // earliest-type request is rejected, a distance-anchored one is
        // held until the slot ends.
        assert_eq!(s.request(&EARLIEST_REQ), Err(Error::EINVAL));
        s.request(&NORMAL_REQ).unwrap();
        assert_eq!(s.state(), SessionState::Running);
        assert_eq!(s.request(&NORMAL_REQ), Err(Error::EAGAIN));

        s.on_slot_end(&wq);
        assert_eq!(s.state(), SessionState::Requested);
        assert_eq!(s.take_pending(), Some(NORMAL_REQ));
        assert!(drained(&wq).is_empty());
    }

    #[test]
    fn extension_round_trip() {
        let (mut s, wq) = open_session();
        request_and_hand_off(&mut s, &EARLIEST_REQ);
        NEXT_ACTION.store(ACT_EXTEND, Ordering::Relaxed);
        assert_eq!(start_slot(&mut s, &wq), SlotDirective::TryExtend { length_us: 1_000 });
        assert_eq!(s.state(), SessionState::Extending);
        NEXT_ACTION.store(ACT_NONE, Ordering::Relaxed);
        let signal = s.on_extend_result(true);
        assert_eq!(signal, Signal::ExtendSucceeded);
        assert_eq!(in_slot(&mut s, signal, &wq), SlotDirective::Continue);
        assert_eq!(s.state(), SessionState::Running);
    }

    #[test]
    fn failed_extension_can_end_slot() {
        let (mut s, wq) = open_session();
        request_and_hand_off(&mut s, &EARLIEST_REQ);
        NEXT_ACTION.store(ACT_EXTEND, Ordering::Relaxed);
        assert_eq!(start_slot(&mut s, &wq), SlotDirective::TryExtend { length_us: 1_000 });
        NEXT_ACTION.store(ACT_END, Ordering::Relaxed);
        let signal = s.on_extend_result(false);
        assert_eq!(signal, Signal::ExtendFailed);
        assert_eq!(in_slot(&mut s, signal, &wq), SlotDirective::End);
    }

    #[test]
    fn extension_below_minimum_is_invalid() {
        let (mut s, wq) = open_session();
        request_and_hand_off(&mut s, &EARLIEST_REQ);
        NEXT_ACTION.store(ACT_EXTEND_SHORT, Ordering::Relaxed);
        assert_eq!(start_slot(&mut s, &wq), SlotDirective::End);
        assert_eq!(drained(&wq), [WorkEvent::InvalidReturn]);
    }

    #[test]
    fn blocked_returns_session_to_idle() {
        let (mut s, wq) = open_session();
        request_and_hand_off(&mut s, &EARLIEST_REQ);
        s.on_blocked(&wq);
        assert_eq!(s.state(), SessionState::OpenIdle);
        assert_eq!(drained(&wq), [WorkEvent::Blocked]);
    }

    #[test]
    fn close_cancels_pending_request() {
        let (mut s, wq) = open_session();
        request_and_hand_off(&mut s, &EARLIEST_REQ);
        s.close(&wq).unwrap();
        assert_eq!(s.state(), SessionState::Closed);
        assert_eq!(drained(&wq), [WorkEvent::Cancelled, WorkEvent::SessionClosed]);
    }

    #[test]
    fn close_during_slot_completes_at_slot_end() {
        let (mut s, wq) = open_session();
        request_and_hand_off(&mut s, &EARLIEST_REQ);
        assert_eq!(start_slot(&mut s, &wq), SlotDirective::Continue);
        s.close(&wq).unwrap();
        assert_eq!(s.state(), SessionState::Running);
        s.on_slot_end(&wq);
        assert_eq!(s.state(), SessionState::Closed);
        assert_eq!(drained(&wq), [WorkEvent::SessionClosed]);
    }

    #[test]
    fn closed_session_operations_are_retryable() {
        let mut s = Session::new();
        let wq = WorkQueue::new();
        assert_eq!(s.close(&wq), Err(Error::EAGAIN));
        assert_eq!(s.request(&EARLIEST_REQ), Err(Error::EAGAIN));
    }

    #[test]
    fn low_prio_delivery_rejects_in_slot_actions() {
        let (mut s, wq) = open_session();
        NEXT_ACTION.store(ACT_END, Ordering::Relaxed);
        low_prio(&mut s, Signal::SessionIdle, &wq);
        assert_eq!(drained(&wq), [WorkEvent::InvalidReturn]);
    }

    #[test]
    fn low_prio_delivery_accepts_new_request() {
        let (mut s, wq) = open_session();
        NEXT_ACTION.store(ACT_REQUEST_EARLIEST, Ordering::Relaxed);
        low_prio(&mut s, Signal::SessionIdle, &wq);
        assert_eq!(s.state(), SessionState::Requested);
        assert!(drained(&wq).is_empty());
    }
}
