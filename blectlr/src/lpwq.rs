//! Low-priority work queue.
//!
//! High-priority interrupt handlers must not run caller code. Anything that
//! ends in a caller-visible notification is instead recorded here as a pending
//! event and drained later from a low-priority software interrupt. Each event
//! kind has one pending slot, posting an already-pending kind coalesces.
use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};

/// An event deferred from a high-priority interrupt handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WorkEvent {
    /// A timeslot request could not be scheduled.
    Blocked,
    /// A pending timeslot request was discarded.
    Cancelled,
    /// A signal handler returned an action that is invalid in its context.
    InvalidReturn,
    /// A timeslot event ran past its granted window.
    Overstayed,
    /// No timeslot request is pending in an open session.
    SessionIdle,
    /// A session close has completed.
    SessionClosed,
    /// The high-frequency crystal oscillator has started.
    HfclkStarted,
    /// An HCI message is ready for the caller to fetch.
    HciAvailable,
    /// An unrecoverable internal error was detected.
    Fault { file: &'static str, line: u32 },
}

// Drain order is causal: terminal session outcomes first, then clock and
// transport notifications, with fault handling last so that everything
// already recorded is delivered before the fault handler runs.
const KIND_COUNT: usize = 9;
const KIND_ORDER: [u32; KIND_COUNT] = [
    bit(Kind::Blocked),
    bit(Kind::Cancelled),
    bit(Kind::InvalidReturn),
    bit(Kind::Overstayed),
    bit(Kind::SessionIdle),
    bit(Kind::SessionClosed),
    bit(Kind::HfclkStarted),
    bit(Kind::HciAvailable),
    bit(Kind::Fault),
];

#[derive(Clone, Copy)]
enum Kind {
    Blocked = 0,
    Cancelled = 1,
    InvalidReturn = 2,
    Overstayed = 3,
    SessionIdle = 4,
    SessionClosed = 5,
    HfclkStarted = 6,
    HciAvailable = 7,
    Fault = 8,
}

const fn bit(kind: Kind) -> u32 {
    1 << kind as u32
}

fn kind_of(event: WorkEvent) -> Kind {
    match event {
        WorkEvent::Blocked => Kind::Blocked,
        WorkEvent::Cancelled => Kind::Cancelled,
        WorkEvent::InvalidReturn => Kind::InvalidReturn,
        WorkEvent::Overstayed => Kind::Overstayed,
        WorkEvent::SessionIdle => Kind::SessionIdle,
        WorkEvent::SessionClosed => Kind::SessionClosed,
        WorkEvent::HfclkStarted => Kind::HfclkStarted,
        WorkEvent::HciAvailable => Kind::HciAvailable,
        WorkEvent::Fault { .. } => Kind::Fault,
    }
}

/// Single-producer-per-kind pending-event set.
///
/// `post` is safe from any interrupt priority. `drain` must only run from the
/// low-priority context.
pub struct WorkQueue {
    pending: AtomicU32,
    fault_file: AtomicPtr<u8>,
    fault_file_len: AtomicUsize,
    fault_line: AtomicU32,
    pend_fn: AtomicPtr<()>,
}

impl WorkQueue {
    pub const fn new() -> Self {
        WorkQueue {
            pending: AtomicU32::new(0),
            fault_file: AtomicPtr::new(core::ptr::null_mut()),
            fault_file_len: AtomicUsize::new(0),
            fault_line: AtomicU32::new(0),
            pend_fn: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Install the hook that pends the low-priority interrupt.
    pub fn set_pend_hook(&self, hook: fn()) {
        self.pend_fn.store(hook as *mut (), Ordering::Release);
    }

    pub fn clear_pend_hook(&self) {
        self.pend_fn.store(core::ptr::null_mut(), Ordering::Release);
    }

    /// Record `event` and pend the drain interrupt.
    pub fn post(&self, event: WorkEvent) {
        if let WorkEvent::Fault { file, line } = event {
            // The first recorded fault wins, later ones keep the bit set but
            // must not overwrite the location being reported.
            if self.pending.load(Ordering::Relaxed) & bit(Kind::Fault) == 0 {
                self.fault_file.store(file.as_ptr() as *mut u8, Ordering::Relaxed);
                self.fault_file_len.store(file.len(), Ordering::Relaxed);
                self.fault_line.store(line, Ordering::Relaxed);
            }
        }
        self.pending.fetch_or(bit(kind_of(event)), Ordering::Release);
        let hook = self.pend_fn.load(Ordering::Acquire);
        if !hook.is_null() {
            let hook: fn() = unsafe { core::mem::transmute(hook) };
            hook();
        }
    }

    /// Returns `true` if any event is pending.
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire) != 0
    }

    /// Take every pending event at once and hand each to `f` in causal order.
    pub fn drain(&self, mut f: impl FnMut(WorkEvent)) {
        let taken = self.pending.swap(0, Ordering::AcqRel);
        if taken == 0 {
            return;
        }
        for mask in KIND_ORDER {
            if taken & mask == 0 {
                continue;
            }
            let event = if mask == bit(Kind::Fault) {
                let ptr = self.fault_file.load(Ordering::Relaxed);
                let len = self.fault_file_len.load(Ordering::Relaxed);
                let file = if ptr.is_null() {
                    ""
                } else {
                    unsafe { core::str::from_utf8_unchecked(core::slice::from_raw_parts(ptr, len)) }
                };
                WorkEvent::Fault {
                    file,
                    line: self.fault_line.load(Ordering::Relaxed),
                }
            } else {
                match mask {
                    m if m == bit(Kind::Blocked) => WorkEvent::Blocked,
                    m if m == bit(Kind::Cancelled) => WorkEvent::Cancelled,
                    m if m == bit(Kind::InvalidReturn) => WorkEvent::InvalidReturn,
                    m if m == bit(Kind::Overstayed) => WorkEvent::Overstayed,
                    m if m == bit(Kind::SessionIdle) => WorkEvent::SessionIdle,
                    m if m == bit(Kind::SessionClosed) => WorkEvent::SessionClosed,
                    m if m == bit(Kind::HfclkStarted) => WorkEvent::HfclkStarted,
                    _ => WorkEvent::HciAvailable,
                }
            };
            f(event);
        }
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_and_drain_single_event() {
        let q = WorkQueue::new();
        q.post(WorkEvent::Blocked);
        assert!(q.is_pending());
        let mut seen = std::vec::Vec::new();
        q.drain(|e| seen.push(e));
        assert_eq!(seen, [WorkEvent::Blocked]);
        assert!(!q.is_pending());
    }

    #[test]
    fn posting_same_kind_twice_coalesces() {
        let q = WorkQueue::new();
        q.post(WorkEvent::HciAvailable);
        q.post(WorkEvent::HciAvailable);
        let mut count = 0;
        q.drain(|_| count += 1);
        assert_eq!(count, 1);
    }

    #[test]
    fn drain_order_is_causal() {
        let q = WorkQueue::new();
        q.post(WorkEvent::HciAvailable);
        q.post(WorkEvent::SessionClosed);
        q.post(WorkEvent::Cancelled);
        q.post(WorkEvent::Blocked);
        let mut seen = std::vec::Vec::new();
        q.drain(|e| seen.push(e));
        assert_eq!(
            seen,
            [
                WorkEvent::Blocked,
                WorkEvent::Cancelled,
                WorkEvent::SessionClosed,
                WorkEvent::HciAvailable,
            ]
        );
    }

    #[test]
    fn first_fault_location_wins() {
        let q = WorkQueue::new();
        q.post(WorkEvent::Fault { file: "a.rs", line: 10 });
        q.post(WorkEvent::Fault { file: "b.rs", line: 20 });
        let mut seen = std::vec::Vec::new();
        q.drain(|e| seen.push(e));
        assert_eq!(seen, [WorkEvent::Fault { file: "a.rs", line: 10 }]);
    }

    #[test]
    fn pend_hook_fires_on_post() {
        use core::sync::atomic::AtomicU32;
        static PENDS: AtomicU32 = AtomicU32::new(0);
        fn hook() {
            PENDS.fetch_add(1, Ordering::Relaxed);
        }
        let q = WorkQueue::new();
        q.set_pend_hook(hook);
        q.post(WorkEvent::SessionIdle);
        q.post(WorkEvent::Blocked);
        assert_eq!(PENDS.load(Ordering::Relaxed), 2);
    }
}
