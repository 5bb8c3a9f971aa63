//! # Timer/Scheduler Adapter
//!
//! Deadlines a connection needs the host to honour. Purely advisory: the
//! host asks for the earliest deadline, sleeps however it likes, and calls
//! back with the current time. Nothing here reads a clock or performs I/O.

#![forbid(unsafe_code)]

use core::time::Duration;

use crate::types::Instant;

/// Connection timers, in the order expired timers are handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Draining period ends; the connection becomes `Closed`
    Drain,
    /// No activity within the negotiated idle timeout
    Idle,
    /// Engine loss-recovery / ack timer
    Engine,
}

impl TimerKind {
    pub const ALL: [TimerKind; 3] = [TimerKind::Drain, TimerKind::Idle, TimerKind::Engine];

    fn index(self) -> usize {
        match self {
            TimerKind::Drain => 0,
            TimerKind::Idle => 1,
            TimerKind::Engine => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimerSet {
    deadlines: [Option<Instant>; 3],
}

impl TimerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, kind: TimerKind, deadline: Instant) {
        self.deadlines[kind.index()] = Some(deadline);
    }

    /// Set or clear in one call
    pub fn update(&mut self, kind: TimerKind, deadline: Option<Instant>) {
        self.deadlines[kind.index()] = deadline;
    }

    pub fn clear(&mut self, kind: TimerKind) {
        self.deadlines[kind.index()] = None;
    }

    pub fn clear_all(&mut self) {
        self.deadlines = [None; 3];
    }

    pub fn get(&self, kind: TimerKind) -> Option<Instant> {
        self.deadlines[kind.index()]
    }

    /// Earliest armed deadline
    pub fn next_deadline(&self) -> Option<(TimerKind, Instant)> {
        TimerKind::ALL
            .iter()
            .filter_map(|&kind| self.get(kind).map(|at| (kind, at)))
            .min_by_key(|&(_, at)| at)
    }

    /// Time left until the earliest deadline; zero if already due
    pub fn timeout(&self, now: Instant) -> Option<Duration> {
        self.next_deadline()
            .map(|(_, at)| now.saturating_duration_until(at))
    }

    /// Timers due at `now`, in handling order
    pub fn expired(&self, now: Instant) -> Vec<TimerKind> {
        TimerKind::ALL
            .into_iter()
            .filter(|&kind| self.get(kind).map_or(false, |at| at <= now))
            .collect()
    }
}
