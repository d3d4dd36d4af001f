//! NAS Timer Management
//!
//! Cooperative timer wheel polled by the owning task. Expired timers are
//! returned to the caller, which turns them into queued events; nothing fires
//! asynchronously.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{Duration, Instant};

// ============================================================================
// Timer IDs
// ============================================================================

/// NAS procedure timers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NasTimer {
    /// T3450 - Attach accept / TAU accept sent
    T3450,
    /// T3460 - Authentication request / Security mode command sent
    T3460,
    /// T3470 - Identity request sent
    T3470,
    /// T3422 - Detach request sent
    T3422,
    /// T3485 - Activate bearer context request sent
    T3485,
    /// T3486 - Modify bearer context request sent
    T3486,
    /// T3495 - Deactivate bearer context request sent
    T3495,
    /// S6a authentication information request guard
    S6a,
    /// S10 context request guard
    S10,
}

impl NasTimer {
    /// Get timer name
    pub fn name(&self) -> &'static str {
        match self {
            Self::T3450 => "T3450",
            Self::T3460 => "T3460",
            Self::T3470 => "T3470",
            Self::T3422 => "T3422",
            Self::T3485 => "T3485",
            Self::T3486 => "T3486",
            Self::T3495 => "T3495",
            Self::S6a => "S6A_GUARD",
            Self::S10 => "S10_GUARD",
        }
    }
}

impl fmt::Display for NasTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Handle of an armed timer, unique for the lifetime of the wheel
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

// ============================================================================
// Timer Wheel
// ============================================================================

/// Ordered set of pending timers carrying a payload
#[derive(Debug)]
pub struct TimerWheel<T> {
    next_id: u64,
    entries: BTreeMap<(Instant, TimerId), T>,
    deadlines: HashMap<TimerId, Instant>,
}

impl<T> Default for TimerWheel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerWheel<T> {
    /// Create an empty wheel
    pub fn new() -> Self {
        Self {
            next_id: 1,
            entries: BTreeMap::new(),
            deadlines: HashMap::new(),
        }
    }

    /// Arm a timer expiring `after` from `now`
    pub fn start(&mut self, now: Instant, after: Duration, payload: T) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        let deadline = now + after;
        self.entries.insert((deadline, id), payload);
        self.deadlines.insert(id, deadline);
        id
    }

    /// Cancel a timer. Returns its payload if it was still armed.
    pub fn cancel(&mut self, id: TimerId) -> Option<T> {
        let deadline = self.deadlines.remove(&id)?;
        self.entries.remove(&(deadline, id))
    }

    /// Check if a timer is still armed
    pub fn is_armed(&self, id: TimerId) -> bool {
        self.deadlines.contains_key(&id)
    }

    /// Payloads of every armed timer, earliest first
    pub fn payloads(&self) -> impl Iterator<Item = &T> {
        self.entries.values()
    }

    /// Mutable payloads of every armed timer
    pub fn payloads_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.entries.values_mut()
    }

    /// Remove and return every timer whose deadline is at or before `now`,
    /// earliest first
    pub fn expired(&mut self, now: Instant) -> Vec<(TimerId, T)> {
        let mut fired = Vec::new();
        while let Some(entry) = self.entries.first_entry() {
            let (deadline, id) = *entry.key();
            if deadline > now {
                break;
            }
            let payload = entry.remove();
            self.deadlines.remove(&id);
            fired.push((id, payload));
        }
        fired
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Number of armed timers
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if no timer is armed
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every armed timer
    pub fn clear(&mut self) {
        self.entries.clear();
        self.deadlines.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expired_in_order() {
        let now = Instant::now();
        let mut wheel = TimerWheel::new();
        let late = wheel.start(now, Duration::from_secs(5), "late");
        let early = wheel.start(now, Duration::from_secs(1), "early");

        assert!(wheel.expired(now).is_empty());
        let fired = wheel.expired(now + Duration::from_secs(10));
        assert_eq!(fired, vec![(early, "early"), (late, "late")]);
        assert!(wheel.is_empty());
    }

    #[test]
    fn test_cancel_prevents_fire() {
        let now = Instant::now();
        let mut wheel = TimerWheel::new();
        let id = wheel.start(now, Duration::from_secs(1), 42);
        assert!(wheel.is_armed(id));
        assert_eq!(wheel.cancel(id), Some(42));
        assert!(!wheel.is_armed(id));
        assert_eq!(wheel.cancel(id), None);
        assert!(wheel.expired(now + Duration::from_secs(2)).is_empty());
    }

    #[test]
    fn test_same_deadline_distinct_ids() {
        let now = Instant::now();
        let mut wheel = TimerWheel::new();
        let a = wheel.start(now, Duration::from_secs(1), 'a');
        let b = wheel.start(now, Duration::from_secs(1), 'b');
        assert_ne!(a, b);
        assert_eq!(wheel.len(), 2);
        assert_eq!(wheel.next_deadline(), Some(now + Duration::from_secs(1)));
    }

    #[test]
    fn test_payloads_mut() {
        let now = Instant::now();
        let mut wheel = TimerWheel::new();
        let id = wheel.start(now, Duration::from_secs(1), 7u32);
        for payload in wheel.payloads_mut().filter(|p| **p == 7) {
            *payload = 9;
        }
        assert_eq!(wheel.payloads().copied().collect::<Vec<_>>(), vec![9]);
        assert_eq!(wheel.expired(now + Duration::from_secs(1)), vec![(id, 9)]);
    }

    #[test]
    fn test_timer_names() {
        assert_eq!(NasTimer::T3450.name(), "T3450");
        assert_eq!(NasTimer::S6a.to_string(), "S6A_GUARD");
    }
}
