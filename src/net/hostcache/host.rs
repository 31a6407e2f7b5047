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

use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
    Arc, Mutex,
};

use super::bucket::NO_SLOT;
use crate::net::endpoint::Endpoint;

/// Shared read-only handle to a cached hub. Handles stay valid as long as
/// the caller holds the cache mutex; the entry object itself stays alive
/// for as long as any handle does.
pub type SharedHostPtr = Arc<HostEntry>;

static NEXT_ID: AtomicU32 = AtomicU32::new(1);

/// A cached G2 hub.
///
/// The address, UI id, last-seen timestamp and failure count are frozen at
/// construction. The cache changes timestamp or failures by replacing the
/// entry through [`HostEntry::renew`], which keeps an entry's position in
/// the ordered container truthful at all times. The remaining fields are
/// metadata the cache does not order by, held in atomics so they can be
/// read through shared handles while the actor mutates the container.
pub struct HostEntry {
    addr: Endpoint,
    id: u32,
    timestamp: u32,
    failures: u8,

    // G2 query key triple
    query_key: AtomicU32,
    key_time: AtomicU32,
    key_host: Mutex<Option<Endpoint>>,

    /// Last operation that required an acknowledgement, 0 = never
    ack: AtomicU32,
    last_query: AtomicU32,
    retry_after: AtomicU32,
    last_connect: AtomicU32,
    connectable: AtomicBool,
    /// Set by a failure at the ceiling; maintenance evicts marked entries
    evict: AtomicBool,

    /// Back-reference into the ordered container, `NO_SLOT` when detached
    slot: AtomicUsize,
}

impl HostEntry {
    pub fn new(addr: Endpoint, timestamp: u32, failures: u8) -> Self {
        Self {
            addr,
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            timestamp,
            failures,
            query_key: AtomicU32::new(0),
            key_time: AtomicU32::new(0),
            key_host: Mutex::new(None),
            ack: AtomicU32::new(0),
            last_query: AtomicU32::new(0),
            retry_after: AtomicU32::new(0),
            last_connect: AtomicU32::new(0),
            connectable: AtomicBool::new(false),
            evict: AtomicBool::new(false),
            slot: AtomicUsize::new(NO_SLOT),
        }
    }

    /// Clone this entry with a new timestamp and failure count, carrying
    /// over all other metadata. The id is kept so the UI can track the hub
    /// across the replacement.
    pub fn renew(&self, timestamp: u32, failures: u8) -> Self {
        Self {
            addr: self.addr.clone(),
            id: self.id,
            timestamp,
            failures,
            query_key: AtomicU32::new(self.query_key()),
            key_time: AtomicU32::new(self.key_time()),
            key_host: Mutex::new(self.key_host()),
            ack: AtomicU32::new(self.ack()),
            last_query: AtomicU32::new(self.last_query()),
            retry_after: AtomicU32::new(self.retry_after()),
            last_connect: AtomicU32::new(self.last_connect()),
            connectable: AtomicBool::new(self.connectable()),
            evict: AtomicBool::new(false),
            slot: AtomicUsize::new(NO_SLOT),
        }
    }

    pub fn addr(&self) -> &Endpoint {
        &self.addr
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn failures(&self) -> u8 {
        self.failures
    }

    pub fn query_key(&self) -> u32 {
        self.query_key.load(Ordering::Relaxed)
    }

    pub fn key_time(&self) -> u32 {
        self.key_time.load(Ordering::Relaxed)
    }

    pub fn key_host(&self) -> Option<Endpoint> {
        self.key_host.lock().unwrap().clone()
    }

    pub fn ack(&self) -> u32 {
        self.ack.load(Ordering::Relaxed)
    }

    pub fn last_query(&self) -> u32 {
        self.last_query.load(Ordering::Relaxed)
    }

    pub fn retry_after(&self) -> u32 {
        self.retry_after.load(Ordering::Relaxed)
    }

    pub fn last_connect(&self) -> u32 {
        self.last_connect.load(Ordering::Relaxed)
    }

    pub fn connectable(&self) -> bool {
        self.connectable.load(Ordering::Relaxed)
    }

    /// Attach a query key received at `now`, optionally on behalf of a
    /// proxying neighbour.
    pub fn set_key(&self, key: u32, now: u32, key_host: Option<Endpoint>) {
        self.query_key.store(key, Ordering::Relaxed);
        self.key_time.store(now, Ordering::Relaxed);
        *self.key_host.lock().unwrap() = key_host;
    }

    pub fn set_ack(&self, ack: u32) {
        self.ack.store(ack, Ordering::Relaxed);
    }

    pub fn set_last_query(&self, last_query: u32) {
        self.last_query.store(last_query, Ordering::Relaxed);
    }

    pub fn set_retry_after(&self, retry_after: u32) {
        self.retry_after.store(retry_after, Ordering::Relaxed);
    }

    pub fn set_last_connect(&self, last_connect: u32) {
        self.last_connect.store(last_connect, Ordering::Relaxed);
    }

    pub fn set_connectable(&self, connectable: bool) {
        self.connectable.store(connectable, Ordering::Relaxed);
    }

    /// Whether a query may be issued to this hub right now. Governed by
    /// the hub-announced retry window and the configured query throttle.
    pub fn can_query(&self, now: u32, query_throttle: u32) -> bool {
        let retry_after = self.retry_after();
        if retry_after != 0 && now < retry_after {
            return false
        }

        let last_query = self.last_query();
        last_query == 0 || now >= last_query.saturating_add(query_throttle)
    }

    pub(super) fn marked_for_eviction(&self) -> bool {
        self.evict.load(Ordering::Relaxed)
    }

    pub(super) fn mark_for_eviction(&self) {
        self.evict.store(true, Ordering::Relaxed);
    }

    pub(super) fn slot(&self) -> usize {
        self.slot.load(Ordering::Relaxed)
    }

    pub(super) fn set_slot(&self, slot: usize) {
        self.slot.store(slot, Ordering::Relaxed);
    }

    pub(super) fn clear_slot(&self) {
        self.slot.store(NO_SLOT, Ordering::Relaxed);
    }
}
