//! Periodic gate schedule construction
//!
//! A [`Scheduler`] owns the set of traffics accepted on one interface and
//! derives the cycle from it: the period is the least common multiple of the
//! stream intervals, every stream occupies one slot per interval repetition,
//! and best effort fills whatever is left. The schedule is regenerated from
//! the traffic set on every change instead of patched in place, which keeps
//! the partition invariant trivially true.
use std::cmp::Ordering;

use anyhow::anyhow;
use itertools::Itertools;
use num::integer::lcm;

use crate::error::{SystemError, TypedError, TypedResult};
use crate::mapping::BEST_EFFORT_TC;
use crate::stream::{Configuration, MacAddress};

const S_TO_NS: u128 = 1_000_000_000;
const BYTES_TO_BITS: u128 = 8;

/// A stream accepted into the schedule, with its on-wire timing resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledTraffic {
    /// Transmission interval in ns
    pub interval: u64,
    /// Frame size in bytes
    pub size: u32,
    /// Offset of the frame inside the cycle, ns
    pub start: u64,
    /// `start` plus the time the frame occupies the wire, ns
    pub end: u64,
    /// Time the frame occupies the wire at the interface rate, ns
    pub length: u64,
    pub addr: MacAddress,
    pub vid: u16,
    pub pcp: u8,
    /// Traffic class assigned by the mapping
    pub tc: u8,
}

impl ScheduledTraffic {
    /// Resolves a stream configuration against the interface rate in bits
    /// per second.
    pub fn new(config: &Configuration, rate: u64, tc: u8) -> TypedResult<Self> {
        if rate == 0 {
            return Err(TypedError::new(
                SystemError::LinkDown,
                anyhow!("Interface rate is zero"),
            ));
        }

        let size = config.traffic.size;
        let interval = config.traffic.interval;
        let start = config.stream.txoffset;

        let length = (u128::from(size) * BYTES_TO_BITS * S_TO_NS / u128::from(rate)) as u64;
        if length == 0 {
            return Err(TypedError::new(
                SystemError::InvalidArgument,
                anyhow!("Frame of {size} bytes rounds to zero wire time at {rate} bps"),
            ));
        }
        if length >= interval {
            return Err(TypedError::new(
                SystemError::InvalidArgument,
                anyhow!("Frame wire time {length} ns does not fit interval {interval} ns"),
            ));
        }
        // The frame must also fit between its offset and the end of the
        // interval, otherwise the slots of consecutive cycles would overlap
        if start + length > interval {
            return Err(TypedError::new(
                SystemError::InvalidArgument,
                anyhow!(
                    "Frame at offset {start} ns runs past the interval {interval} ns"
                ),
            ));
        }

        Ok(Self {
            interval,
            size,
            start,
            end: start + length,
            length,
            addr: config.stream.addr,
            vid: config.stream.vid,
            pcp: config.stream.pcp,
            tc,
        })
    }
}

/// One entry of the traffic set: either a scheduled stream or best effort
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Traffic {
    BestEffort,
    Scheduled(ScheduledTraffic),
}

impl Traffic {
    pub fn tc(&self) -> u8 {
        match self {
            Traffic::BestEffort => BEST_EFFORT_TC,
            Traffic::Scheduled(t) => t.tc,
        }
    }

    pub fn scheduled(&self) -> Option<&ScheduledTraffic> {
        match self {
            Traffic::BestEffort => None,
            Traffic::Scheduled(t) => Some(t),
        }
    }
}

/// A gate-open interval inside the cycle.
/// `start` and `end` are ns offsets from the cycle start.
#[derive(Debug, Clone)]
pub struct Slot {
    pub start: u64,
    pub end: u64,
    pub length: u64,
    pub traffic: Traffic,
}

impl Slot {
    fn new(start: u64, end: u64, traffic: Traffic) -> Self {
        debug_assert!(start < end);
        Self {
            start,
            end,
            length: end - start,
            traffic,
        }
    }
}

impl PartialEq for Slot {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Slot {}

impl Ord for Slot {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.start.cmp(&other.start) {
            Ordering::Equal => self.end.cmp(&other.end),
            other => other,
        }
    }
}

impl PartialOrd for Slot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The cycle as an ordered sequence of non-overlapping slots covering
/// `[0, period)` without gaps. Empty (period 0) while no stream is accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schedule {
    slots: Vec<Slot>,
    period: u64,
}

impl Schedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn period(&self) -> u64 {
        self.period
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn add_scheduled_traffic(&mut self, start: u64, end: u64, traffic: Traffic) {
        self.slots.push(Slot::new(start, end, traffic));
        self.slots.sort();
    }

    /// Fills every gap between scheduled slots with a best effort slot, plus
    /// a closing one up to the period.
    fn add_best_effort_padding(&mut self) {
        let mut padding = Vec::new();

        let mut end = 0;
        for slot in &self.slots {
            debug_assert!(end <= slot.start);
            if end < slot.start {
                padding.push(Slot::new(end, slot.start, Traffic::BestEffort));
            }
            end = slot.end;
        }

        self.slots.append(&mut padding);
        self.slots.sort();

        if let Some(last) = self.slots.last() {
            if last.end < self.period {
                let slot = Slot::new(last.end, self.period, Traffic::BestEffort);
                self.slots.push(slot);
            }
        }
    }

    /// True when the new traffic's first frame would start or end inside a
    /// slot already claimed by a scheduled stream.
    pub fn conflicts_with_traffic(&self, traffic: &ScheduledTraffic) -> bool {
        for slot in self.slots.iter().filter(|s| s.traffic.scheduled().is_some()) {
            if traffic.start >= slot.start && traffic.start <= slot.end {
                return true;
            }
            if traffic.end >= slot.start && traffic.end <= slot.end {
                return true;
            }
        }

        false
    }

    /// True if any gate opens more than once over the same cycle.
    ///
    /// Some devices do not allow a hardware queue to be opened more than
    /// once in the same cycle.
    pub fn opens_gate_multiple_times_per_cycle(&self) -> bool {
        let mut opened_once: Vec<&Traffic> = Vec::new();

        for (i, slot) in self.slots.iter().enumerate() {
            let traffic = &slot.traffic;
            if opened_once.contains(&traffic) {
                // The gate simply stays open when the previous slot carries
                // the same traffic
                let previous = &self.slots[i - 1].traffic;
                if previous != traffic {
                    return true;
                }
            } else {
                opened_once.push(traffic);
            }
        }

        false
    }

    /// Number of distinct traffics claiming slots, best effort included
    pub fn num_traffics(&self) -> usize {
        let mut seen: Vec<&Traffic> = Vec::new();
        for slot in &self.slots {
            if !seen.contains(&&slot.traffic) {
                seen.push(&slot.traffic);
            }
        }

        seen.len()
    }

    /// Whether the slots partition `[0, period)` exactly
    pub fn is_contiguous(&self) -> bool {
        if self.slots.is_empty() {
            return self.period == 0;
        }
        if self.slots[0].start != 0 || self.slots.last().unwrap().end != self.period {
            return false;
        }

        self.slots
            .iter()
            .tuple_windows()
            .all(|(prev, next)| prev.end == next.start)
    }
}

/// Maintains the traffic set of one interface and the schedule derived from
/// it. Entry 0 of the traffic set is always best effort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scheduler {
    traffics: Vec<Traffic>,
    schedule: Schedule,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            traffics: vec![Traffic::BestEffort],
            schedule: Schedule::new(),
        }
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn traffics(&self) -> &[Traffic] {
        &self.traffics
    }

    /// Accepts a new scheduled traffic and regenerates the cycle.
    pub fn add(&mut self, traffic: ScheduledTraffic) -> TypedResult<()> {
        info!("Adding traffic to schedule");

        if self.schedule.conflicts_with_traffic(&traffic) {
            return Err(TypedError::new(
                SystemError::Conflict,
                anyhow!(
                    "Traffic [{} {}] conflicts with existing schedule",
                    traffic.start,
                    traffic.end
                ),
            ));
        }

        self.traffics.push(Traffic::Scheduled(traffic));
        self.reschedule();

        Ok(())
    }

    /// Drops a previously accepted traffic and regenerates the cycle.
    pub fn remove(&mut self, traffic: &ScheduledTraffic) -> TypedResult<()> {
        let index = self
            .traffics
            .iter()
            .position(|t| t.scheduled() == Some(traffic))
            .ok_or_else(|| {
                TypedError::new(
                    SystemError::InvariantViolation,
                    anyhow!("Traffic to remove is not part of the schedule"),
                )
            })?;

        self.traffics.remove(index);
        self.reschedule();

        Ok(())
    }

    fn reschedule(&mut self) {
        let scheduled: Vec<ScheduledTraffic> = self
            .traffics
            .iter()
            .filter_map(|t| t.scheduled().cloned())
            .collect();

        if scheduled.is_empty() {
            self.schedule = Schedule::new();
            return;
        }

        let mut schedule = Schedule::new();
        schedule.period = scheduled.iter().map(|t| t.interval).fold(1, lcm);

        for traffic in &scheduled {
            // One slot per repetition of the traffic inside the period
            let repetitions = schedule.period / traffic.interval;
            for i in 0..repetitions {
                let start = traffic.start + traffic.interval * i;
                let end = start + traffic.length;
                schedule.add_scheduled_traffic(start, end, Traffic::Scheduled(traffic.clone()));
            }
        }

        schedule.add_best_effort_padding();
        debug_assert!(schedule.is_contiguous());

        self.schedule = schedule;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{StreamConfiguration, TrafficSpecification};

    const US_TO_NS: u64 = 1_000;
    const MS_TO_NS: u64 = 1_000_000;
    const GBPS: u64 = 1_000_000_000;

    fn traffic_helper(txoffset: u64, interval: u64) -> ScheduledTraffic {
        let stream = StreamConfiguration::new(
            "7a:b9:ed:d6:d2:12".parse().unwrap(),
            3,
            6,
            txoffset,
            None,
        )
        .unwrap();
        let spec = TrafficSpecification::new(interval, 1522).unwrap();
        let config = Configuration::new("eth0".into(), stream, spec, None).unwrap();

        ScheduledTraffic::new(&config, GBPS, 1).unwrap()
    }

    fn assert_slot(scheduler: &Scheduler, index: usize, start: u64, end: u64) {
        let slot = &scheduler.schedule().slots()[index];
        assert_eq!(slot.start, start, "slot {index} start");
        assert_eq!(slot.end, end, "slot {index} end");
        assert_eq!(slot.length, end - start, "slot {index} length");
    }

    fn assert_schedule_empty(schedule: &Schedule) {
        assert_eq!(schedule.period(), 0);
        assert_eq!(schedule.len(), 0);
    }

    #[test]
    fn frame_length_at_one_gbps() {
        let traffic = traffic_helper(0, 20 * MS_TO_NS);
        assert_eq!(traffic.length, 12_176);
        assert_eq!(traffic.end, 12_176);
    }

    #[test]
    fn frame_larger_than_interval_is_rejected() {
        let stream = StreamConfiguration::new(
            "7a:b9:ed:d6:d2:12".parse().unwrap(),
            3,
            6,
            0,
            None,
        )
        .unwrap();
        let spec = TrafficSpecification::new(10_000, 1522).unwrap();
        let config = Configuration::new("eth0".into(), stream, spec, None).unwrap();

        let err = ScheduledTraffic::new(&config, GBPS, 1).unwrap_err();
        assert_eq!(err.err(), SystemError::InvalidArgument);
    }

    #[test]
    fn add_single_scheduled_traffic_start_0() {
        let mut scheduler = Scheduler::new();

        scheduler.add(traffic_helper(0, 20 * MS_TO_NS)).unwrap();

        assert_eq!(scheduler.schedule().period(), 20_000_000);
        assert_eq!(scheduler.schedule().len(), 2);
        assert_slot(&scheduler, 0, 0, 12_176);
        assert_slot(&scheduler, 1, 12_176, 20_000_000);
        assert!(scheduler.schedule().is_contiguous());
    }

    #[test]
    fn add_remove_single_scheduled_traffic_start_0() {
        let mut scheduler = Scheduler::new();
        let pristine = scheduler.clone();

        let traffic = traffic_helper(0, 20 * MS_TO_NS);
        scheduler.add(traffic.clone()).unwrap();
        scheduler.remove(&traffic).unwrap();

        assert_schedule_empty(scheduler.schedule());
        assert_eq!(scheduler, pristine);
    }

    #[test]
    fn add_single_scheduled_traffic_start_non_0() {
        let mut scheduler = Scheduler::new();

        scheduler
            .add(traffic_helper(250 * US_TO_NS, 20 * MS_TO_NS))
            .unwrap();

        assert_slot(&scheduler, 0, 0, 250_000);
        assert_slot(&scheduler, 1, 250_000, 262_176);
        assert_slot(&scheduler, 2, 262_176, 20_000_000);
    }

    #[test]
    fn add_two_scheduled_traffics_same_interval() {
        let mut scheduler = Scheduler::new();

        scheduler
            .add(traffic_helper(250 * US_TO_NS, MS_TO_NS))
            .unwrap();
        scheduler
            .add(traffic_helper(550 * US_TO_NS, MS_TO_NS))
            .unwrap();

        assert_eq!(scheduler.schedule().period(), 1_000_000);
        assert_eq!(scheduler.schedule().len(), 5);

        assert_slot(&scheduler, 0, 0, 250_000);
        assert_slot(&scheduler, 1, 250_000, 262_176);
        assert_slot(&scheduler, 2, 262_176, 550_000);
        assert_slot(&scheduler, 3, 550_000, 562_176);
        assert_slot(&scheduler, 4, 562_176, 1_000_000);
    }

    #[test]
    fn add_two_scheduled_traffics_coprime_intervals() {
        let mut scheduler = Scheduler::new();

        scheduler
            .add(traffic_helper(250 * US_TO_NS, 2 * MS_TO_NS))
            .unwrap();
        scheduler
            .add(traffic_helper(750 * US_TO_NS, 3 * MS_TO_NS))
            .unwrap();

        // Period is the product of the coprime intervals; the 2 ms stream
        // repeats three times, the 3 ms stream twice
        assert_eq!(scheduler.schedule().period(), 6_000_000);
        assert_eq!(scheduler.schedule().len(), 11);

        assert_slot(&scheduler, 0, 0, 250_000);
        assert_slot(&scheduler, 1, 250_000, 262_176);
        assert_slot(&scheduler, 2, 262_176, 750_000);
        assert_slot(&scheduler, 3, 750_000, 762_176);
        assert_slot(&scheduler, 4, 762_176, 2_250_000);
        assert_slot(&scheduler, 5, 2_250_000, 2_262_176);
        assert_slot(&scheduler, 6, 2_262_176, 3_750_000);
        assert_slot(&scheduler, 7, 3_750_000, 3_762_176);
        assert_slot(&scheduler, 8, 3_762_176, 4_250_000);
        assert_slot(&scheduler, 9, 4_250_000, 4_262_176);
        assert_slot(&scheduler, 10, 4_262_176, 6_000_000);
    }

    #[test]
    fn remove_regenerates_remaining_schedule() {
        let mut scheduler = Scheduler::new();

        let traffic1 = traffic_helper(250 * US_TO_NS, 2 * MS_TO_NS);
        let traffic2 = traffic_helper(750 * US_TO_NS, 3 * MS_TO_NS);
        scheduler.add(traffic1.clone()).unwrap();
        scheduler.add(traffic2.clone()).unwrap();

        scheduler.remove(&traffic2).unwrap();

        assert_eq!(scheduler.schedule().period(), 2_000_000);
        assert_slot(&scheduler, 0, 0, 250_000);
        assert_slot(&scheduler, 1, 250_000, 262_176);
        assert_slot(&scheduler, 2, 262_176, 2_000_000);

        scheduler.remove(&traffic1).unwrap();
        assert_schedule_empty(scheduler.schedule());
    }

    #[test]
    fn remove_first_added_keeps_second() {
        let mut scheduler = Scheduler::new();

        let traffic1 = traffic_helper(250 * US_TO_NS, 2 * MS_TO_NS);
        let traffic2 = traffic_helper(750 * US_TO_NS, 3 * MS_TO_NS);
        scheduler.add(traffic1.clone()).unwrap();
        scheduler.add(traffic2.clone()).unwrap();

        scheduler.remove(&traffic1).unwrap();

        assert_eq!(scheduler.schedule().period(), 3_000_000);
        assert_slot(&scheduler, 0, 0, 750_000);
        assert_slot(&scheduler, 1, 750_000, 762_176);
        assert_slot(&scheduler, 2, 762_176, 3_000_000);
    }

    #[test]
    fn remove_unknown_traffic_is_rejected() {
        let mut scheduler = Scheduler::new();
        let traffic = traffic_helper(0, 20 * MS_TO_NS);

        let err = scheduler.remove(&traffic).unwrap_err();
        assert_eq!(err.err(), SystemError::InvariantViolation);
    }

    #[test]
    fn conflict_full_match() {
        let mut scheduler = Scheduler::new();
        scheduler
            .add(traffic_helper(100 * US_TO_NS, 20 * MS_TO_NS))
            .unwrap();

        let traffic = traffic_helper(100 * US_TO_NS, 20 * MS_TO_NS);
        assert!(scheduler.schedule().conflicts_with_traffic(&traffic));

        let err = scheduler.add(traffic).unwrap_err();
        assert_eq!(err.err(), SystemError::Conflict);
    }

    #[test]
    fn conflict_no_match() {
        let mut scheduler = Scheduler::new();
        scheduler
            .add(traffic_helper(100 * US_TO_NS, 20 * MS_TO_NS))
            .unwrap();

        let traffic = traffic_helper(500 * US_TO_NS, 20 * MS_TO_NS);
        assert!(!scheduler.schedule().conflicts_with_traffic(&traffic));
    }

    #[test]
    fn conflict_left_overlap() {
        let mut scheduler = Scheduler::new();
        scheduler
            .add(traffic_helper(100 * US_TO_NS, 20 * MS_TO_NS))
            .unwrap();

        // Ends inside the existing slot
        let traffic = traffic_helper(99 * US_TO_NS, 20 * MS_TO_NS);
        assert!(scheduler.schedule().conflicts_with_traffic(&traffic));
    }

    #[test]
    fn conflict_right_overlap() {
        let mut scheduler = Scheduler::new();
        scheduler
            .add(traffic_helper(100 * US_TO_NS, 20 * MS_TO_NS))
            .unwrap();

        // Starts inside the existing slot
        let traffic = traffic_helper(110 * US_TO_NS, 20 * MS_TO_NS);
        assert!(scheduler.schedule().conflicts_with_traffic(&traffic));
    }

    #[test]
    fn conflict_leaves_state_untouched() {
        let mut scheduler = Scheduler::new();
        scheduler
            .add(traffic_helper(0, 20 * MS_TO_NS))
            .unwrap();
        let before = scheduler.clone();

        let err = scheduler
            .add(traffic_helper(5 * US_TO_NS, 20 * MS_TO_NS))
            .unwrap_err();
        assert_eq!(err.err(), SystemError::Conflict);
        assert_eq!(scheduler, before);
    }

    #[test]
    fn single_stream_opens_gates_once() {
        let mut scheduler = Scheduler::new();
        scheduler
            .add(traffic_helper(250 * US_TO_NS, MS_TO_NS))
            .unwrap();

        assert!(!scheduler.schedule().opens_gate_multiple_times_per_cycle());
    }

    #[test]
    fn repeated_stream_opens_gate_multiple_times() {
        let mut scheduler = Scheduler::new();

        // Coprime intervals make the 2 ms stream reappear after best effort
        scheduler
            .add(traffic_helper(250 * US_TO_NS, 2 * MS_TO_NS))
            .unwrap();
        scheduler
            .add(traffic_helper(750 * US_TO_NS, 3 * MS_TO_NS))
            .unwrap();

        assert!(scheduler.schedule().opens_gate_multiple_times_per_cycle());
        assert_eq!(scheduler.schedule().num_traffics(), 3);
    }

    #[test]
    fn schedule_repetitions_follow_interval() {
        let mut scheduler = Scheduler::new();
        let traffic = traffic_helper(250 * US_TO_NS, 2 * MS_TO_NS);
        scheduler.add(traffic.clone()).unwrap();
        scheduler
            .add(traffic_helper(750 * US_TO_NS, 3 * MS_TO_NS))
            .unwrap();

        let period = scheduler.schedule().period();
        let copies: Vec<&Slot> = scheduler
            .schedule()
            .slots()
            .iter()
            .filter(|s| s.traffic.scheduled() == Some(&traffic))
            .collect();

        assert_eq!(copies.len() as u64, period / traffic.interval);
        for (k, slot) in copies.iter().enumerate() {
            assert_eq!(slot.start, traffic.start + k as u64 * traffic.interval);
        }
    }
}
