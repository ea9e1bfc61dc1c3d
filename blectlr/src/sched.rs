//! Radio time arbitration.
//!
//! Every activity that needs the radio or its timer, link-layer connection
//! events, caller timeslots and internal maintenance work, is expressed as a
//! work item with a start window and a length. The scheduler owns the
//! pending set, commits at most one item at a time, and decides contention by
//! priority first, then by the tighter start deadline, then by submission
//! order.
//!
//! The scheduler is pure bookkeeping: it never touches hardware and takes the
//! current time as an argument, which is what makes it testable off target.
use heapless::Vec;

use crate::error::Error;
use crate::time::{delta, is_before, later, HORIZON_MAX_US};
use crate::timeslot::{HfclkMode, Priority, TimeslotRequest, LENGTH_MAX_US};

/// Maximum number of pending work items.
pub const MAX_PENDING: usize = 8;

/// Time needed to tear one activity down and set the next one up.
pub const TURNAROUND_US: u32 = 100;

/// Worst-case crystal oscillator ramp-up time.
pub const HFCLK_RAMP_US: u32 = 1_400;

/// Lead time required between a request and a crystal-guaranteed start.
pub const GUARD_US: u32 = HFCLK_RAMP_US + 2 * crate::timeslot::START_JITTER_US;

/// Minimum remaining slot time for an extension request to be decidable.
pub const EXTEND_MARGIN_US: u32 = 79;

/// Who a work item runs on behalf of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Owner {
    /// A link-layer connection event for the given connection handle.
    LinkLayer(u8),
    /// The caller's timeslot session.
    Timeslot,
    /// Internal maintenance work.
    Maintenance(MaintKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MaintKind {
    /// RC oscillator calibration against the HF crystal.
    RcCalibration,
}

/// One schedulable unit of radio time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct WorkItem {
    pub owner: Owner,
    /// Earliest permitted start.
    pub earliest_us: u32,
    /// Latest permitted start. Equal to `earliest_us` for fixed-anchor items.
    pub latest_start_us: u32,
    pub length_us: u32,
    pub priority: Priority,
    pub hfclk: HfclkMode,
}

impl WorkItem {
    /// Translate a session request into a work item.
    ///
    /// `anchor_us` is the start of the session's previous slot, required for
    /// distance-anchored requests. `hfclk_running` decides whether a
    /// crystal-guaranteed earliest start must absorb the oscillator ramp.
    pub fn from_request(req: &TimeslotRequest, now_us: u32, anchor_us: Option<u32>, hfclk_running: bool) -> Result<WorkItem, Error> {
        match *req {
            TimeslotRequest::Earliest {
                hfclk,
                priority,
                length_us,
                timeout_us,
            } => {
                let ramp = match hfclk {
                    HfclkMode::XtalGuaranteed if !hfclk_running => GUARD_US,
                    _ => 0,
                };
                Ok(WorkItem {
                    owner: Owner::Timeslot,
                    earliest_us: now_us.wrapping_add(ramp),
                    latest_start_us: now_us.wrapping_add(timeout_us),
                    length_us,
                    priority,
                    hfclk,
                })
            }
            TimeslotRequest::Normal {
                hfclk,
                priority,
                distance_us,
                length_us,
            } => {
                let anchor = anchor_us.ok_or(Error::EINVAL)?;
                let start = anchor.wrapping_add(distance_us);
                Ok(WorkItem {
                    owner: Owner::Timeslot,
                    earliest_us: start,
                    latest_start_us: start,
                    length_us,
                    priority,
                    hfclk,
                })
            }
        }
    }
}

/// The slot the scheduler has committed radio time to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Committed {
    pub item: WorkItem,
    pub start_us: u32,
    pub end_us: u32,
    pub started: bool,
}

struct Pending {
    item: WorkItem,
    seq: u32,
}

/// The arbiter.
pub struct Scheduler {
    pending: Vec<Pending, MAX_PENDING>,
    committed: Option<Committed>,
    seq: u32,
}

impl Scheduler {
    pub const fn new() -> Self {
        Scheduler {
            pending: Vec::new(),
            committed: None,
            seq: 0,
        }
    }

    /// Add a work item to the pending set.
    pub fn submit(&mut self, item: WorkItem) -> Result<(), Error> {
        if item.length_us == 0 || item.length_us > LENGTH_MAX_US {
            return Err(Error::EINVAL);
        }
        let window = delta(item.earliest_us, item.latest_start_us);
        if window < 0 || window as u32 > HORIZON_MAX_US {
            return Err(Error::EINVAL);
        }
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        self.pending.push(Pending { item, seq }).map_err(|_| Error::ENOBUFS)?;
        Ok(())
    }

    /// Remove every pending item belonging to `owner`.
    ///
    /// An uncommitted item disappears silently; a committed but not yet
    /// started slot is withdrawn too. A started slot is never cancelled here,
    /// it runs to its end.
    pub fn cancel(&mut self, owner: Owner) -> bool {
        let before = self.pending.len();
        self.pending.retain(|p| p.item.owner != owner);
        let mut removed = before != self.pending.len();
        if let Some(c) = self.committed {
            if !c.started && c.item.owner == owner {
                self.committed = None;
                removed = true;
            }
        }
        removed
    }

    pub fn committed(&self) -> Option<&Committed> {
        self.committed.as_ref()
    }

    /// Re-run arbitration at time `now_us`.
    ///
    /// Picks the next slot to commit, if any, and reports every pending item
    /// whose start deadline can no longer be met through `blocked`. A started
    /// slot is immovable. A committed but not yet started slot may be
    /// displaced only by a strictly higher-priority item, and only when the
    /// committed item can still be re-placed within its own start deadline;
    /// a preemptor that would strand it is blocked instead.
    pub fn arbitrate(&mut self, now_us: u32, mut blocked: impl FnMut(Owner)) -> Option<&Committed> {
        if let Some(c) = self.committed {
            if c.started {
                return self.committed.as_ref();
            }
            loop {
                let Some(best) = self.pick_best() else { break };
                if self.pending[best].item.priority <= c.item.priority {
                    break;
                }
                let p = self.pending[best].item;
                let start = later(p.earliest_us, now_us.wrapping_add(TURNAROUND_US));
                if is_before(p.latest_start_us, start) {
                    // The preemptor's own deadline is already unmakeable.
                    self.pending.swap_remove(best);
                    blocked(p.owner);
                    continue;
                }
                let refit = later(
                    c.item.earliest_us,
                    start.wrapping_add(p.length_us).wrapping_add(TURNAROUND_US),
                );
                if is_before(c.item.latest_start_us, refit) {
                    // The committed item has no slack to move aside.
                    self.pending.swap_remove(best);
                    blocked(p.owner);
                    continue;
                }
                // Withdraw and re-pick. The withdrawn item keeps a sequence
                // number older than anything pending so arbitration is stable
                // when nothing else changed.
                let oldest = self
                    .pending
                    .iter()
                    .map(|q| q.seq)
                    .reduce(|a, b| if (b.wrapping_sub(a) as i32) < 0 { b } else { a })
                    .unwrap_or(self.seq);
                self.committed = None;
                if self.pending.push(Pending { item: c.item, seq: oldest.wrapping_sub(1) }).is_err() {
                    blocked(c.item.owner);
                }
                break;
            }
            if let Some(c) = self.committed {
                // The committed slot stays; drop whatever can no longer
                // start after it.
                let end = c.end_us;
                self.pending.retain(|q| {
                    let feasible = later(q.item.earliest_us, end.wrapping_add(TURNAROUND_US));
                    if is_before(q.item.latest_start_us, feasible) {
                        blocked(q.item.owner);
                        false
                    } else {
                        true
                    }
                });
                return self.committed.as_ref();
            }
        }

        loop {
            let Some(best) = self.pick_best() else {
                return None;
            };
            let p = self.pending.swap_remove(best);
            let start = later(p.item.earliest_us, now_us.wrapping_add(TURNAROUND_US));
            if is_before(p.item.latest_start_us, start) {
                // Deadline already unmakeable.
                blocked(p.item.owner);
                continue;
            }
            let end = start.wrapping_add(p.item.length_us);
            self.committed = Some(Committed {
                item: p.item,
                start_us: start,
                end_us: end,
                started: false,
            });
            // Everything that cannot start after this slot is out.
            self.pending.retain(|q| {
                let feasible = later(q.item.earliest_us, end.wrapping_add(TURNAROUND_US));
                if is_before(q.item.latest_start_us, feasible) {
                    blocked(q.item.owner);
                    false
                } else {
                    true
                }
            });
            return self.committed.as_ref();
        }
    }

    /// The committed slot's start has been reached and its activity is live.
    pub fn on_started(&mut self) {
        if let Some(c) = &mut self.committed {
            c.started = true;
        }
    }

    /// Try to push the running slot's end out by `extra_us`.
    ///
    /// Fails when the decision point is inside the end margin, when the total
    /// slot length would exceed the maximum, or when the widened slot would
    /// collide with a pending item's start deadline.
    pub fn try_extend(&mut self, now_us: u32, extra_us: u32) -> bool {
        let Some(c) = &mut self.committed else { return false };
        if !c.started {
            return false;
        }
        if delta(now_us, c.end_us) < EXTEND_MARGIN_US as i32 {
            return false;
        }
        let new_end = c.end_us.wrapping_add(extra_us);
        let total = new_end.wrapping_sub(c.start_us);
        if total > LENGTH_MAX_US {
            return false;
        }
        let collides = self.pending.iter().any(|p| {
            let feasible = later(p.item.earliest_us, new_end.wrapping_add(TURNAROUND_US));
            is_before(p.item.latest_start_us, feasible)
        });
        if collides {
            return false;
        }
        c.end_us = new_end;
        true
    }

    /// The committed slot is over. Returns its owner.
    pub fn complete(&mut self) -> Option<Owner> {
        self.committed.take().map(|c| c.item.owner)
    }

    pub fn is_idle(&self) -> bool {
        self.committed.is_none() && self.pending.is_empty()
    }

    // Highest priority first, then the tighter start deadline, then
    // submission order.
    fn pick_best(&self) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (i, p) in self.pending.iter().enumerate() {
            let Some(b) = best else {
                best = Some(i);
                continue;
            };
            let cur = &self.pending[b];
            let wins = match p.item.priority.cmp(&cur.item.priority) {
                core::cmp::Ordering::Greater => true,
                core::cmp::Ordering::Less => false,
                core::cmp::Ordering::Equal => {
                    if p.item.latest_start_us != cur.item.latest_start_us {
                        is_before(p.item.latest_start_us, cur.item.latest_start_us)
                    } else {
                        (p.seq.wrapping_sub(cur.seq) as i32) < 0
                    }
                }
            };
            if wins {
                best = Some(i);
            }
        }
        best
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec as StdVec;

    fn item(owner: Owner, earliest: u32, latest: u32, length: u32, priority: Priority) -> WorkItem {
        WorkItem {
            owner,
            earliest_us: earliest,
            latest_start_us: latest,
            length_us: length,
            priority,
            hfclk: HfclkMode::NoGuarantee,
        }
    }

    fn arbitrate_collecting(s: &mut Scheduler, now: u32) -> (Option<Committed>, StdVec<Owner>) {
        let mut blocked = StdVec::new();
        let c = s.arbitrate(now, |o| blocked.push(o)).copied();
        (c, blocked)
    }

    #[test]
    fn single_item_commits_at_earliest() {
        let mut s = Scheduler::new();
        s.submit(item(Owner::Timeslot, 10_000, 50_000, 5_000, Priority::Normal)).unwrap();
        let (c, blocked) = arbitrate_collecting(&mut s, 0);
        let c = c.unwrap();
        assert_eq!(c.start_us, 10_000);
        assert_eq!(c.end_us, 15_000);
        assert!(blocked.is_empty());
    }

    #[test]
    fn late_arbitration_slides_start_within_window() {
        let mut s = Scheduler::new();
        s.submit(item(Owner::Timeslot, 10_000, 50_000, 5_000, Priority::Normal)).unwrap();
        let (c, _) = arbitrate_collecting(&mut s, 20_000);
        assert_eq!(c.unwrap().start_us, 20_000 + TURNAROUND_US);
    }

    #[test]
    fn missed_deadline_reports_blocked() {
        let mut s = Scheduler::new();
        s.submit(item(Owner::Timeslot, 10_000, 12_000, 5_000, Priority::Normal)).unwrap();
        let (c, blocked) = arbitrate_collecting(&mut s, 20_000);
        assert!(c.is_none());
        assert_eq!(blocked, [Owner::Timeslot]);
    }

    #[test]
    fn anchored_request_starts_at_exact_distance() {
        // A distance-anchored follow-up slot lands exactly at anchor + distance.
        let req = TimeslotRequest::Normal {
            hfclk: HfclkMode::NoGuarantee,
            priority: Priority::Normal,
            distance_us: 20_000,
            length_us: 5_000,
        };
        let anchor = 100_000;
        let it = WorkItem::from_request(&req, 104_000, Some(anchor), true).unwrap();
        assert_eq!(it.earliest_us, 120_000);
        assert_eq!(it.latest_start_us, 120_000);

        let mut s = Scheduler::new();
        s.submit(it).unwrap();
        let (c, blocked) = arbitrate_collecting(&mut s, 104_000);
        assert_eq!(c.unwrap().start_us, 120_000);
        assert!(blocked.is_empty());
    }

    #[test]
    fn earliest_request_absorbs_crystal_ramp() {
        let req = TimeslotRequest::Earliest {
            hfclk: HfclkMode::XtalGuaranteed,
            priority: Priority::Normal,
            length_us: 5_000,
            timeout_us: 100_000,
        };
        let it = WorkItem::from_request(&req, 1_000, None, false).unwrap();
        assert_eq!(it.earliest_us, 1_000 + GUARD_US);
        let it = WorkItem::from_request(&req, 1_000, None, true).unwrap();
        assert_eq!(it.earliest_us, 1_000);
    }

    #[test]
    fn high_priority_wins_contention() {
        let mut s = Scheduler::new();
        s.submit(item(Owner::LinkLayer(0), 10_000, 10_000, 5_000, Priority::Normal)).unwrap();
        s.submit(item(Owner::Timeslot, 10_000, 10_000, 5_000, Priority::High)).unwrap();
        let (c, blocked) = arbitrate_collecting(&mut s, 0);
        assert_eq!(c.unwrap().item.owner, Owner::Timeslot);
        // The fixed-anchor loser cannot be re-placed and is blocked.
        assert_eq!(blocked, [Owner::LinkLayer(0)]);
    }

    #[test]
    fn loser_with_slack_stays_pending() {
        let mut s = Scheduler::new();
        s.submit(item(Owner::Timeslot, 10_000, 10_000, 5_000, Priority::High)).unwrap();
        s.submit(item(Owner::LinkLayer(0), 10_000, 40_000, 5_000, Priority::Normal)).unwrap();
        let (c, blocked) = arbitrate_collecting(&mut s, 0);
        assert_eq!(c.unwrap().item.owner, Owner::Timeslot);
        assert!(blocked.is_empty());
        // After the first slot completes the loser gets its turn.
        s.on_started();
        assert_eq!(s.complete(), Some(Owner::Timeslot));
        let (c, blocked) = arbitrate_collecting(&mut s, 15_000);
        assert_eq!(c.unwrap().item.owner, Owner::LinkLayer(0));
        assert!(blocked.is_empty());
    }

    #[test]
    fn equal_priority_resolves_by_deadline() {
        let mut s = Scheduler::new();
        s.submit(item(Owner::LinkLayer(0), 10_000, 60_000, 5_000, Priority::Normal)).unwrap();
        s.submit(item(Owner::LinkLayer(1), 10_000, 30_000, 5_000, Priority::Normal)).unwrap();
        let (c, _) = arbitrate_collecting(&mut s, 0);
        assert_eq!(c.unwrap().item.owner, Owner::LinkLayer(1));
    }

    #[test]
    fn high_arrival_displaces_uncommitted_normal() {
        let mut s = Scheduler::new();
        s.submit(item(Owner::LinkLayer(0), 10_000, 40_000, 5_000, Priority::Normal)).unwrap();
        let (c, _) = arbitrate_collecting(&mut s, 0);
        assert_eq!(c.unwrap().item.owner, Owner::LinkLayer(0));

        s.submit(item(Owner::Timeslot, 10_000, 12_000, 5_000, Priority::High)).unwrap();
        let (c, blocked) = arbitrate_collecting(&mut s, 0);
        let c = c.unwrap();
        assert_eq!(c.item.owner, Owner::Timeslot);
        assert!(blocked.is_empty());
    }

    #[test]
    fn preemptor_blocked_when_committed_normal_has_no_slack() {
        let mut s = Scheduler::new();
        s.submit(item(Owner::LinkLayer(0), 10_000, 10_000, 5_000, Priority::Normal)).unwrap();
        arbitrate_collecting(&mut s, 0);

        // A fixed-anchor committed slot cannot move aside, so the arriving
        // high-priority contender loses instead.
        s.submit(item(Owner::Timeslot, 10_000, 12_000, 5_000, Priority::High)).unwrap();
        let (c, blocked) = arbitrate_collecting(&mut s, 0);
        let c = c.unwrap();
        assert_eq!(c.item.owner, Owner::LinkLayer(0));
        assert_eq!(c.start_us, 10_000);
        assert_eq!(blocked, [Owner::Timeslot]);
    }

    #[test]
    fn normal_arrival_never_preempts_committed() {
        let mut s = Scheduler::new();
        s.submit(item(Owner::LinkLayer(0), 10_000, 40_000, 5_000, Priority::Normal)).unwrap();
        arbitrate_collecting(&mut s, 0);

        // Equal priority does not displace, and the newcomer cannot start
        // after the committed slot within its own deadline.
        s.submit(item(Owner::Timeslot, 10_000, 12_000, 5_000, Priority::Normal)).unwrap();
        let (c, blocked) = arbitrate_collecting(&mut s, 0);
        assert_eq!(c.unwrap().item.owner, Owner::LinkLayer(0));
        assert_eq!(blocked, [Owner::Timeslot]);
    }

    #[test]
    fn started_slot_is_never_displaced() {
        let mut s = Scheduler::new();
        s.submit(item(Owner::LinkLayer(0), 10_000, 40_000, 5_000, Priority::Normal)).unwrap();
        arbitrate_collecting(&mut s, 0);
        s.on_started();

        s.submit(item(Owner::Timeslot, 10_000, 12_000, 5_000, Priority::High)).unwrap();
        let (c, _) = arbitrate_collecting(&mut s, 10_500);
        assert_eq!(c.unwrap().item.owner, Owner::LinkLayer(0));
    }

    #[test]
    fn extend_succeeds_with_margin_and_no_conflict() {
        let mut s = Scheduler::new();
        s.submit(item(Owner::Timeslot, 10_000, 10_000, 5_000, Priority::Normal)).unwrap();
        arbitrate_collecting(&mut s, 0);
        s.on_started();
        // 1 ms before the end, comfortably outside the margin.
        assert!(s.try_extend(14_000, 2_000));
        assert_eq!(s.committed().unwrap().end_us, 17_000);
    }

    #[test]
    fn extend_fails_inside_end_margin() {
        let mut s = Scheduler::new();
        s.submit(item(Owner::Timeslot, 10_000, 10_000, 5_000, Priority::Normal)).unwrap();
        arbitrate_collecting(&mut s, 0);
        s.on_started();
        assert!(!s.try_extend(15_000 - EXTEND_MARGIN_US + 1, 2_000));
        // Exactly at the margin is still decidable.
        assert!(s.try_extend(15_000 - EXTEND_MARGIN_US, 2_000));
    }

    #[test]
    fn extend_fails_past_maximum_length() {
        let mut s = Scheduler::new();
        s.submit(item(Owner::Timeslot, 10_000, 10_000, 99_000, Priority::Normal)).unwrap();
        arbitrate_collecting(&mut s, 0);
        s.on_started();
        assert!(!s.try_extend(50_000, 2_000));
        assert!(s.try_extend(50_000, 1_000));
    }

    #[test]
    fn extend_fails_on_collision_with_pending_deadline() {
        let mut s = Scheduler::new();
        s.submit(item(Owner::Timeslot, 10_000, 10_000, 5_000, Priority::Normal)).unwrap();
        arbitrate_collecting(&mut s, 0);
        s.on_started();
        s.submit(item(Owner::LinkLayer(0), 15_200, 15_500, 1_000, Priority::Normal)).unwrap();
        assert!(!s.try_extend(14_000, 2_000));
    }

    #[test]
    fn cancel_withdraws_pending_and_uncommitted() {
        let mut s = Scheduler::new();
        s.submit(item(Owner::Timeslot, 10_000, 40_000, 5_000, Priority::Normal)).unwrap();
        arbitrate_collecting(&mut s, 0);
        assert!(s.cancel(Owner::Timeslot));
        assert!(s.is_idle());
        assert!(!s.cancel(Owner::Timeslot));
    }

    #[test]
    fn capacity_overflow_is_enobufs() {
        let mut s = Scheduler::new();
        for i in 0..MAX_PENDING {
            s.submit(item(Owner::LinkLayer(i as u8), 10_000, 40_000, 1_000, Priority::Normal)).unwrap();
        }
        assert_eq!(
            s.submit(item(Owner::Timeslot, 10_000, 40_000, 1_000, Priority::Normal)),
            Err(Error::ENOBUFS)
        );
    }
}
