// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Registry of pending wakeups (task waits and interval timers)
//! OWNERS: @kernel-sched-team
//! PUBLIC API: AdventRegistry::{register_wait, create_timer, cancel_timer,
//!             expire, wake_listener, purge_task, sweep_task}, NotifyTarget,
//!             Notification
//! DEPENDS_ON: types::{Pid, Listener, TimerId}
//! INVARIANTS: Every advent sits in the deadline index iff it has a deadline;
//!             a task's wait advents are removed together, exactly once,
//!             before the task is made runnable
//!
//! Advents live in a slot arena. Three indices point into it: the global
//! deadline order `(deadline, id)`, the per-task list of wait advents, and a
//! FIFO per listener. Ties on the deadline resolve by advent id, which is
//! the registration order for ids that have not been recycled.

use alloc::collections::{BTreeMap, BTreeSet, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use crate::types::{Listener, Pid, TimerId};

/// Receiver of interval-timer expirations. Called without kernel locks held.
pub trait NotifyTarget: Send + Sync {
    fn notify(&self, note: Notification);
}

/// One delivery of an interval timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notification {
    pub timer: TimerId,
    /// Periods elapsed since the previous delivery; more than one when ticks
    /// were missed.
    pub expirations: u64,
    pub now_us: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct AdventId(u32);

impl AdventId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

enum Owner {
    Task { pid: Pid, listener: Option<Listener> },
    Timer { id: TimerId, target: Arc<dyn NotifyTarget>, interval_us: u64, owner: Option<Pid> },
}

struct Advent {
    deadline: Option<u64>,
    owner: Owner,
}

/// Result of one expiry pass.
#[derive(Default)]
pub struct Expired {
    /// Tasks whose wait advents were all removed; to be made runnable.
    pub woken: Vec<Pid>,
    /// Timer deliveries, to be made after every lock is released.
    pub notifications: Vec<(Arc<dyn NotifyTarget>, Notification)>,
}

impl fmt::Debug for Expired {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Expired")
            .field("woken", &self.woken)
            .field("notifications", &self.notifications.len())
            .finish()
    }
}

#[derive(Default)]
pub struct AdventRegistry {
    slots: Vec<Option<Advent>>,
    free: Vec<AdventId>,
    by_deadline: BTreeSet<(u64, AdventId)>,
    by_owner: BTreeMap<Pid, Vec<AdventId>>,
    by_listener: BTreeMap<Listener, VecDeque<AdventId>>,
    timers: BTreeMap<TimerId, AdventId>,
    next_timer: u32,
}

impl AdventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live advents, timers included.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<u64> {
        self.by_deadline.first().map(|(deadline, _)| *deadline)
    }

    /// True while `pid` has at least one wait advent registered.
    pub fn is_waiting(&self, pid: Pid) -> bool {
        self.by_owner.contains_key(&pid)
    }

    /// Registers a wait of `pid` on `listener`, `deadline`, or both. A wait
    /// with neither only ends through an explicit resume.
    pub fn register_wait(&mut self, pid: Pid, listener: Option<Listener>, deadline: Option<u64>) {
        let id = self.insert(Advent { deadline, owner: Owner::Task { pid, listener } });
        self.by_owner.entry(pid).or_default().push(id);
        if let Some(listener) = listener {
            self.by_listener.entry(listener).or_default().push_back(id);
        }
    }

    /// Arms a timer firing at `deadline` and then every `interval_us`
    /// (one-shot when zero). `owner` ties its lifetime to a task.
    pub fn create_timer(
        &mut self,
        target: Arc<dyn NotifyTarget>,
        deadline: u64,
        interval_us: u64,
        owner: Option<Pid>,
    ) -> TimerId {
        self.next_timer = self.next_timer.wrapping_add(1);
        while self.next_timer == 0 || self.timers.contains_key(&TimerId::from_raw(self.next_timer)) {
            self.next_timer = self.next_timer.wrapping_add(1);
        }
        let id = TimerId::from_raw(self.next_timer);
        let advent = self.insert(Advent {
            deadline: Some(deadline),
            owner: Owner::Timer { id, target, interval_us, owner },
        });
        self.timers.insert(id, advent);
        id
    }

    /// Disarms a timer. Returns false if it does not exist (or a one-shot
    /// timer already fired).
    pub fn cancel_timer(&mut self, id: TimerId) -> bool {
        match self.timers.remove(&id) {
            Some(advent) => {
                self.remove(advent);
                true
            }
            None => false,
        }
    }

    /// Removes every advent due at `now`, in deadline order.
    pub fn expire(&mut self, now: u64) -> Expired {
        let mut expired = Expired::default();
        while let Some(&(deadline, id)) = self.by_deadline.first() {
            if deadline > now {
                break;
            }
            self.by_deadline.remove(&(deadline, id));
            let rearm = match self.slot(id).map(|advent| &advent.owner) {
                Some(Owner::Task { pid, .. }) => {
                    let pid = *pid;
                    self.purge_task(pid);
                    expired.woken.push(pid);
                    None
                }
                Some(Owner::Timer { id: timer, target, interval_us, .. }) => {
                    let expirations = match *interval_us {
                        0 => 1,
                        interval => 1 + (now - deadline) / interval,
                    };
                    let note = Notification { timer: *timer, expirations, now_us: now };
                    expired.notifications.push((Arc::clone(target), note));
                    match *interval_us {
                        0 => Some(None),
                        interval => Some(Some(deadline.saturating_add(expirations * interval))),
                    }
                }
                None => panic!("advent: deadline index names free slot {}", id.0),
            };
            match rearm {
                Some(Some(next)) => {
                    if let Some(advent) = self.slot_mut(id) {
                        advent.deadline = Some(next);
                    }
                    self.by_deadline.insert((next, id));
                }
                Some(None) => {
                    if let Some(Advent { owner: Owner::Timer { id: timer, .. }, .. }) = self.slot(id) {
                        let timer = *timer;
                        self.timers.remove(&timer);
                    }
                    self.remove(id);
                }
                None => {}
            }
        }
        expired
    }

    /// Ends the waits of up to `limit` tasks queued on `listener`, oldest
    /// first. Each woken task loses all of its wait advents.
    pub fn wake_listener(&mut self, listener: Listener, limit: Option<usize>) -> Vec<Pid> {
        let mut woken = Vec::new();
        while limit.map_or(true, |limit| woken.len() < limit) {
            let Some(id) = self.by_listener.get_mut(&listener).and_then(VecDeque::pop_front) else {
                break;
            };
            let pid = match self.slot(id).map(|advent| &advent.owner) {
                Some(Owner::Task { pid, .. }) => *pid,
                _ => panic!("advent: listener queue names non-wait advent {}", id.0),
            };
            self.purge_task(pid);
            woken.push(pid);
        }
        woken
    }

    /// Removes every wait advent of `pid`. Timers it owns stay armed.
    pub fn purge_task(&mut self, pid: Pid) -> usize {
        let ids = self.by_owner.remove(&pid).unwrap_or_default();
        for id in &ids {
            self.remove(*id);
        }
        ids.len()
    }

    /// Removes every advent tied to `pid`, timers included.
    pub fn sweep_task(&mut self, pid: Pid) -> usize {
        let owned: Vec<TimerId> = self
            .timers
            .iter()
            .filter(|(_, advent)| {
                matches!(
                    self.slot(**advent).map(|advent| &advent.owner),
                    Some(Owner::Timer { owner: Some(owner), .. }) if *owner == pid
                )
            })
            .map(|(timer, _)| *timer)
            .collect();
        let timers = owned.iter().filter(|timer| self.cancel_timer(**timer)).count();
        self.purge_task(pid) + timers
    }

    fn insert(&mut self, advent: Advent) -> AdventId {
        let deadline = advent.deadline;
        let id = self.claim_slot(advent);
        if let Some(deadline) = deadline {
            self.by_deadline.insert((deadline, id));
        }
        id
    }

    fn claim_slot(&mut self, advent: Advent) -> AdventId {
        match self.free.pop() {
            Some(id) => {
                self.slots[id.index()] = Some(advent);
                id
            }
            None => {
                let id = AdventId(self.slots.len() as u32);
                self.slots.push(Some(advent));
                id
            }
        }
    }

    fn slot(&self, id: AdventId) -> Option<&Advent> {
        self.slots.get(id.index()).and_then(Option::as_ref)
    }

    fn slot_mut(&mut self, id: AdventId) -> Option<&mut Advent> {
        self.slots.get_mut(id.index()).and_then(Option::as_mut)
    }

    /// Unlinks an advent from the deadline and listener indices and frees its
    /// slot. The owner index is the caller's business.
    fn remove(&mut self, id: AdventId) {
        let advent = match self.slots.get_mut(id.index()).and_then(Option::take) {
            Some(advent) => advent,
            None => panic!("advent: double removal of {}", id.0),
        };
        if let Some(deadline) = advent.deadline {
            self.by_deadline.remove(&(deadline, id));
        }
        if let Owner::Task { listener: Some(listener), .. } = advent.owner {
            if let Some(queue) = self.by_listener.get_mut(&listener) {
                queue.retain(|queued| *queued != id);
                if queue.is_empty() {
                    self.by_listener.remove(&listener);
                }
            }
        }
        self.free.push(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Sink(spin::Mutex<Vec<Notification>>);

    impl NotifyTarget for Sink {
        fn notify(&self, note: Notification) {
            self.0.lock().push(note);
        }
    }

    fn pid(raw: u32) -> Pid {
        Pid::from_raw(raw)
    }

    #[test]
    fn expiry_is_inclusive_and_ordered() {
        let mut reg = AdventRegistry::new();
        reg.register_wait(pid(2), None, Some(30));
        reg.register_wait(pid(1), None, Some(20));
        reg.register_wait(pid(3), None, Some(31));
        assert!(reg.expire(19).woken.is_empty());
        assert_eq!(reg.expire(30).woken, vec![pid(1), pid(2)]);
        assert_eq!(reg.next_deadline(), Some(31));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn siblings_go_with_the_first_expiry() {
        let mut reg = AdventRegistry::new();
        let chan = Listener::Channel(4);
        reg.register_wait(pid(1), Some(chan), Some(50));
        reg.register_wait(pid(1), None, Some(10));
        assert_eq!(reg.expire(10).woken, vec![pid(1)]);
        assert!(reg.is_empty());
        assert!(!reg.is_waiting(pid(1)));
        assert!(reg.wake_listener(chan, None).is_empty());
    }

    #[test]
    fn listener_wakes_fifo_with_limit() {
        let mut reg = AdventRegistry::new();
        let chan = Listener::Channel(1);
        for raw in 1..=3 {
            reg.register_wait(pid(raw), Some(chan), None);
        }
        assert_eq!(reg.wake_listener(chan, Some(2)), vec![pid(1), pid(2)]);
        assert_eq!(reg.wake_listener(chan, None), vec![pid(3)]);
        assert!(reg.is_empty());
    }

    #[test]
    fn timers_rearm_and_count_missed_periods() {
        let mut reg = AdventRegistry::new();
        let sink = Arc::new(Sink(spin::Mutex::new(Vec::new())));
        let periodic = reg.create_timer(sink.clone(), 10, 20, None);
        let once = reg.create_timer(sink.clone(), 15, 0, None);

        let expired = reg.expire(100);
        assert!(expired.woken.is_empty());
        for (target, note) in expired.notifications {
            target.notify(note);
        }
        let notes = sink.0.lock().clone();
        assert_eq!(
            notes,
            vec![
                Notification { timer: periodic, expirations: 5, now_us: 100 },
                Notification { timer: once, expirations: 1, now_us: 100 },
            ]
        );
        assert_eq!(reg.next_deadline(), Some(110));
        assert!(!reg.cancel_timer(once));
        assert!(reg.cancel_timer(periodic));
        assert!(reg.is_empty());
    }

    #[test]
    fn sweep_takes_owned_timers_too() {
        let mut reg = AdventRegistry::new();
        let sink = Arc::new(Sink(spin::Mutex::new(Vec::new())));
        reg.register_wait(pid(5), Some(Listener::ChildExit(pid(5))), Some(1_000));
        reg.create_timer(sink.clone(), 50, 50, Some(pid(5)));
        let foreign = reg.create_timer(sink, 50, 50, Some(pid(6)));
        assert_eq!(reg.purge_task(pid(5)), 1);
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.sweep_task(pid(5)), 1);
        assert_eq!(reg.len(), 1);
        assert!(reg.cancel_timer(foreign));
    }

    #[test]
    fn recycled_slots_keep_indices_consistent() {
        let mut reg = AdventRegistry::new();
        reg.register_wait(pid(1), None, Some(5));
        reg.purge_task(pid(1));
        reg.register_wait(pid(2), None, Some(7));
        reg.register_wait(pid(3), None, None);
        assert_eq!(reg.expire(10).woken, vec![pid(2)]);
        assert!(reg.is_waiting(pid(3)));
        assert_eq!(reg.next_deadline(), None);
    }
}
