/* This file is part of Ferroshare
 *
 * Copyright (C) 2024-2026 Ferroshare Contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as
 * published by the Free Software Foundation, either version 3 of the
 * License, or (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use std::collections::HashMap;

use super::host::SharedHostPtr;
use crate::net::endpoint::Endpoint;

/// Slot key of a detached entry.
pub(super) const NO_SLOT: usize = usize::MAX;

/// One position in the sequence: either a cached hub or a sentinel marking
/// the start of a failure bucket.
struct Slot {
    prev: usize,
    next: usize,
    host: Option<SharedHostPtr>,
}

/// The ordered container behind the host cache.
///
/// A single doubly linked sequence over a slab of slots, partitioned into
/// failure buckets by `max_failures + 2` sentinel slots. The sentinels act
/// as access points: `access[k]` marks the start of the bucket holding
/// entries with exactly `k` failures, sorted by descending timestamp, and
/// `access[max_failures + 1]` is the tail with nothing after it. Slot keys
/// are stable, so each entry carries its own key as a back-reference and
/// removal needs no search.
///
/// An address-to-slot map backs `find`; the sequence itself stays the one
/// source of ordering truth.
pub(super) struct BucketList {
    slots: Vec<Slot>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    access: Vec<usize>,
    index: HashMap<Endpoint, usize>,
    len: usize,
}

impl BucketList {
    pub fn new(max_failures: u8) -> Self {
        let mut list = Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: NO_SLOT,
            tail: NO_SLOT,
            access: Vec::new(),
            index: HashMap::new(),
            len: 0,
        };

        for _ in 0..(max_failures as usize + 2) {
            let idx = list.alloc();
            list.link_tail(idx);
            list.access.push(idx);
        }

        list
    }

    /// Number of hubs in the sequence, sentinels excluded.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn max_failures(&self) -> u8 {
        (self.access.len() - 2) as u8
    }

    /// Insert a hub into its failure bucket, keeping the bucket sorted by
    /// descending timestamp. Writes the slot key into the entry.
    pub fn insert(&mut self, host: SharedHostPtr) {
        let bucket = host.failures() as usize;
        debug_assert!(bucket + 1 < self.access.len());

        // Walk forward past every entry with a strictly greater timestamp.
        // The walk terminates at the latest on the next sentinel.
        let mut pos = self.slots[self.access[bucket]].next;
        while let Some(other) = &self.slots[pos].host {
            if other.timestamp() > host.timestamp() {
                pos = self.slots[pos].next;
            } else {
                break
            }
        }

        let idx = self.alloc();
        self.link_before(pos, idx);
        host.set_slot(idx);
        self.index.insert(host.addr().clone(), idx);
        self.slots[idx].host = Some(host);
        self.len += 1;

        #[cfg(debug_assertions)]
        self.check_invariants();
    }

    /// Remove the hub at `idx`. Never called on a sentinel. Returns the
    /// successor slot key.
    pub fn remove(&mut self, idx: usize) -> usize {
        debug_assert!(self.slots[idx].host.is_some());

        if let Some(host) = self.slots[idx].host.take() {
            self.index.remove(host.addr());
            host.clear_slot();
            self.len -= 1;
        }

        let next = self.slots[idx].next;
        self.unlink(idx);
        self.free.push(idx);

        #[cfg(debug_assertions)]
        self.check_invariants();

        next
    }

    /// Slot key of the hub with the given address, if cached.
    pub fn find(&self, addr: &Endpoint) -> Option<usize> {
        self.index.get(addr).copied()
    }

    pub fn host_at(&self, idx: usize) -> Option<&SharedHostPtr> {
        self.slots[idx].host.as_ref()
    }

    /// Remove the oldest entry in the highest non-empty failure bucket at
    /// or below `failures`, decreasing `failures` to the bucket the entry
    /// was actually taken from. No-op on an empty sequence.
    pub fn remove_worst(&mut self, failures: &mut u8) -> bool {
        let max = self.max_failures();
        if *failures > max {
            *failures = max;
        }

        // The predecessor of the access point above the requested bucket
        // is the oldest entry at or below it, sentinels in between
        // notwithstanding.
        let mut pos = self.slots[self.access[*failures as usize + 1]].prev;
        while self.slots[pos].host.is_none() && pos != self.head {
            pos = self.slots[pos].prev;
            *failures = failures.saturating_sub(1);
        }

        if self.slots[pos].host.is_some() {
            self.remove(pos);
            return true
        }

        false
    }

    /// Reshape the sentinel skeleton for a new failure ceiling. Shrinking
    /// evicts exactly the entries in buckets above the new ceiling before
    /// dropping their access points. Returns the number of evicted hubs.
    pub fn set_max_failures(&mut self, new_max: u8) -> usize {
        let old_max = self.max_failures();
        let mut evicted = 0;

        if new_max < old_max {
            for bucket in (new_max as usize + 1)..=(old_max as usize) {
                loop {
                    let pos = self.slots[self.access[bucket]].next;
                    if self.slots[pos].host.is_none() {
                        break
                    }
                    self.remove(pos);
                    evicted += 1;
                }
            }

            // Drop the now unnecessary access points. Each is the tail
            // since nothing may follow the last sentinel.
            for _ in 0..(old_max - new_max) {
                if let Some(sentinel) = self.access.pop() {
                    debug_assert_eq!(sentinel, self.tail);
                    debug_assert!(self.slots[sentinel].host.is_none());
                    self.unlink(sentinel);
                    self.free.push(sentinel);
                }
            }
        } else {
            for _ in 0..(new_max - old_max) {
                let idx = self.alloc();
                self.link_tail(idx);
                self.access.push(idx);
            }
        }

        #[cfg(debug_assertions)]
        self.check_invariants();

        evicted
    }

    /// Drop every hub, keeping the sentinel skeleton intact.
    pub fn clear(&mut self) {
        let mut pos = self.head;
        while pos != NO_SLOT {
            let next = self.slots[pos].next;
            if self.slots[pos].host.is_some() {
                self.remove(pos);
            }
            pos = next;
        }
    }

    /// Iterate the sequence in order. Sentinels yield `None`.
    pub fn iter(&self) -> SlotIter<'_> {
        SlotIter { list: self, pos: self.head }
    }

    /// Iterate the sequence from the tail towards the head.
    pub fn iter_rev(&self) -> RevSlotIter<'_> {
        RevSlotIter { list: self, pos: self.tail }
    }

    fn alloc(&mut self) -> usize {
        match self.free.pop() {
            Some(idx) => idx,
            None => {
                self.slots.push(Slot { prev: NO_SLOT, next: NO_SLOT, host: None });
                self.slots.len() - 1
            }
        }
    }

    fn link_tail(&mut self, idx: usize) {
        if self.tail == NO_SLOT {
            self.head = idx;
        } else {
            self.slots[self.tail].next = idx;
            self.slots[idx].prev = self.tail;
        }
        self.slots[idx].next = NO_SLOT;
        self.tail = idx;
    }

    fn link_before(&mut self, pos: usize, idx: usize) {
        let prev = self.slots[pos].prev;
        self.slots[idx].prev = prev;
        self.slots[idx].next = pos;
        self.slots[pos].prev = idx;
        if prev == NO_SLOT {
            self.head = idx;
        } else {
            self.slots[prev].next = idx;
        }
    }

    fn unlink(&mut self, idx: usize) {
        let Slot { prev, next, .. } = self.slots[idx];
        if prev == NO_SLOT {
            self.head = next;
        } else {
            self.slots[prev].next = next;
        }
        if next == NO_SLOT {
            self.tail = prev;
        } else {
            self.slots[next].prev = prev;
        }
        self.slots[idx].prev = NO_SLOT;
        self.slots[idx].next = NO_SLOT;
    }

    /// Verify every container invariant. Runs after each mutation in debug
    /// builds and is called directly by tests.
    pub fn check_invariants(&self) {
        assert!(self.access.len() >= 2);
        assert_eq!(self.head, self.access[0]);
        assert_eq!(self.access[self.access.len() - 1], self.tail);

        let mut sentinels_seen = 0;
        let mut hosts_seen = 0;
        let mut bucket: isize = -1;
        let mut last_ts: Option<u32> = None;
        let mut prev = NO_SLOT;
        let mut pos = self.head;

        while pos != NO_SLOT {
            let slot = &self.slots[pos];
            assert_eq!(slot.prev, prev);

            match &slot.host {
                Some(host) => {
                    // Bucket position reflects the failure count
                    assert_eq!(host.failures() as isize, bucket);
                    // The back-reference points at this very slot
                    assert_eq!(host.slot(), pos);
                    assert_eq!(self.index.get(host.addr()), Some(&pos));
                    // Non-increasing timestamps within the bucket
                    if let Some(ts) = last_ts {
                        assert!(ts >= host.timestamp());
                    }
                    last_ts = Some(host.timestamp());
                    hosts_seen += 1;
                }
                None => {
                    assert_eq!(self.access[sentinels_seen], pos);
                    sentinels_seen += 1;
                    bucket += 1;
                    last_ts = None;
                }
            }

            prev = pos;
            pos = slot.next;
        }

        assert_eq!(prev, self.tail);
        assert_eq!(sentinels_seen, self.access.len());
        assert_eq!(hosts_seen, self.len);
        assert_eq!(self.index.len(), self.len);
    }
}

pub(super) struct SlotIter<'a> {
    list: &'a BucketList,
    pos: usize,
}

impl<'a> Iterator for SlotIter<'a> {
    type Item = (usize, Option<&'a SharedHostPtr>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos == NO_SLOT {
            return None
        }
        let idx = self.pos;
        self.pos = self.list.slots[idx].next;
        Some((idx, self.list.slots[idx].host.as_ref()))
    }
}

pub(super) struct RevSlotIter<'a> {
    list: &'a BucketList,
    pos: usize,
}

impl<'a> Iterator for RevSlotIter<'a> {
    type Item = (usize, Option<&'a SharedHostPtr>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos == NO_SLOT {
            return None
        }
        let idx = self.pos;
        self.pos = self.list.slots[idx].prev;
        Some((idx, self.list.slots[idx].host.as_ref()))
    }
}
