// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Doubly-linked FIFO over handle-indexed link slots
//! OWNERS: @kernel-sched-team
//! PUBLIC API: IndexList::{push_back, pop_front, remove, contains, iter}
//! DEPENDS_ON: collections::Handle
//! INVARIANTS: A handle is linked at most once; push/remove/pop are O(1)
//!
//! The links live in the list, not in the element, so membership of one
//! handle in two different lists is visible to both owners and can be
//! asserted against.

use alloc::vec::Vec;
use core::marker::PhantomData;

use super::Handle;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Link {
    prev: Option<usize>,
    next: Option<usize>,
}

/// FIFO of handles with constant-time removal from the middle.
#[derive(Debug)]
pub struct IndexList<K: Handle> {
    links: Vec<Option<Link>>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
    _key: PhantomData<K>,
}

impl<K: Handle> IndexList<K> {
    pub const fn new() -> Self {
        Self { links: Vec::new(), head: None, tail: None, len: 0, _key: PhantomData }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, key: K) -> bool {
        matches!(self.links.get(key.index()), Some(Some(_)))
    }

    pub fn front(&self) -> Option<K> {
        self.head.map(K::from_index)
    }

    /// Links `key` at the tail. Returns false if it was already linked.
    pub fn push_back(&mut self, key: K) -> bool {
        let idx = key.index();
        if self.links.len() <= idx {
            self.links.resize(idx + 1, None);
        }
        if self.links[idx].is_some() {
            return false;
        }
        self.links[idx] = Some(Link { prev: self.tail, next: None });
        match self.tail {
            Some(tail) => self.link_mut(tail).next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
        self.len += 1;
        true
    }

    pub fn pop_front(&mut self) -> Option<K> {
        let head = self.head?;
        self.unlink(head);
        Some(K::from_index(head))
    }

    /// Unlinks `key`. Returns false if it was not linked.
    pub fn remove(&mut self, key: K) -> bool {
        if !self.contains(key) {
            return false;
        }
        self.unlink(key.index());
        true
    }

    pub fn iter(&self) -> Iter<'_, K> {
        Iter { list: self, cursor: self.head }
    }

    fn link_mut(&mut self, idx: usize) -> &mut Link {
        match self.links.get_mut(idx) {
            Some(Some(link)) => link,
            _ => panic!("index list: dangling link to slot {idx}"),
        }
    }

    fn unlink(&mut self, idx: usize) {
        let link = match self.links.get_mut(idx).and_then(Option::take) {
            Some(link) => link,
            None => panic!("index list: slot {idx} not linked"),
        };
        match link.prev {
            Some(prev) => self.link_mut(prev).next = link.next,
            None => self.head = link.next,
        }
        match link.next {
            Some(next) => self.link_mut(next).prev = link.prev,
            None => self.tail = link.prev,
        }
        self.len -= 1;
    }
}

impl<K: Handle> Default for IndexList<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Front-to-back iterator over an [`IndexList`].
pub struct Iter<'a, K: Handle> {
    list: &'a IndexList<K>,
    cursor: Option<usize>,
}

impl<'a, K: Handle> Iterator for Iter<'a, K> {
    type Item = K;

    fn next(&mut self) -> Option<K> {
        let idx = self.cursor?;
        self.cursor = self.list.links.get(idx).copied().flatten().and_then(|link| link.next);
        Some(K::from_index(idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Pid;

    fn pid(raw: u32) -> Pid {
        Pid::from_raw(raw)
    }

    #[test]
    fn fifo_order_is_preserved() {
        let mut list = IndexList::new();
        for raw in [3, 1, 4] {
            assert!(list.push_back(pid(raw)));
        }
        assert_eq!(list.len(), 3);
        assert_eq!(list.pop_front(), Some(pid(3)));
        assert_eq!(list.pop_front(), Some(pid(1)));
        assert_eq!(list.pop_front(), Some(pid(4)));
        assert_eq!(list.pop_front(), None);
        assert!(list.is_empty());
    }

    #[test]
    fn second_push_of_same_handle_is_rejected() {
        let mut list = IndexList::new();
        assert!(list.push_back(pid(2)));
        assert!(!list.push_back(pid(2)));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn remove_from_middle_relinks_neighbours() {
        let mut list = IndexList::new();
        for raw in 0..5 {
            list.push_back(pid(raw));
        }
        assert!(list.remove(pid(2)));
        assert!(!list.remove(pid(2)));
        assert!(list.remove(pid(4)));
        assert!(list.remove(pid(0)));
        let order: Vec<_> = list.iter().collect();
        assert_eq!(order, vec![pid(1), pid(3)]);
        assert_eq!(list.front(), Some(pid(1)));
        list.push_back(pid(2));
        let order: Vec<_> = list.iter().map(Pid::as_raw).collect();
        assert_eq!(order, vec![1, 3, 2]);
    }
}
