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

use std::{
    collections::HashSet,
    io::Cursor,
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use darkfi_serial::{Decodable, Encodable, ReadExt, WriteExt};
use log::{debug, error, info, warn};
use smol::{channel, lock::Mutex};

use super::{
    bucket::{BucketList, NO_SLOT},
    host::{HostEntry, SharedHostPtr},
};
use crate::{
    net::{
        endpoint::{Endpoint, COUNTRY_NONE},
        security::SecurityPtr,
        settings::SettingsPtr,
    },
    system::{sleep, ExecutorPtr, StoppableTask, StoppableTaskPtr, Subscriber, SubscriberPtr,
             Subscription},
    util::{
        file::{load_file_bytes, secured_save_file},
        time::{format_iso_minute, parse_iso_minute, tnow},
    },
    Error, Result,
};

/// Atomic pointer to the host cache.
pub type HostCachePtr = Arc<HostCache>;

/// Snapshot file format version. A snapshot carrying any other version is
/// discarded on load and the cache starts empty.
pub const SNAPSHOT_VERSION: u16 = 6;

/// Seconds between maintenance passes.
pub const MAINTENANCE_INTERVAL: u64 = 10;

/// Seconds between periodic snapshot saves.
const SAVE_INTERVAL: u32 = 600;

/// Maximum number of hubs advertised in an X-Try-Hubs header.
const XTRY_MAX_HOSTS: usize = 10;

/// Mutation messages, processed in FIFO order by the cache actor.
enum CacheOp {
    Add { addr: Endpoint, timestamp: u32 },
    AddWithKey { addr: Endpoint, timestamp: u32, key: u32, key_host: Option<Endpoint> },
    AddWithAck { addr: Endpoint, timestamp: u32, ack: u32 },
    AddXTry { header: String },
    UpdateFailures { addr: Endpoint, failures: u32 },
    ConnectFailure { addr: Endpoint },
    Remove { addr: Endpoint },
    LocalAddressChanged { addr: Option<Endpoint> },
    SanityCheck,
    Maintain,
}

/// State owned by the actor, guarded by the cache mutex.
struct CacheInner {
    list: BucketList,
    /// Failure ceiling the skeleton is currently shaped for
    max_failures: u8,
    t_last_save: u32,
    /// Our own external address, blocked from self-insertion
    local_addr: Option<Endpoint>,
}

/// The G2 host cache.
///
/// A single actor task owns all mutable state. Producers post typed
/// messages through the non-blocking entry points (`add`, `add_with_key`,
/// `add_with_ack`, `add_xtry`, `update_failures`, `connect_failure`,
/// `remove`, `local_address_changed`) and observe effects only by querying
/// later. Inspectors that expose live entry handles (`get`, `contains`,
/// `get_connectable`, `get_xtry`, `request_host_info`) acquire the cache
/// mutex, which is the sole guarantor of handle validity. `count` and
/// `is_empty` read a relaxed atomic mirror of the container size and never
/// lock.
///
/// A periodic signal drives `maintain` every [`MAINTENANCE_INTERVAL`]
/// seconds, and the security manager's sanity-check broadcasts are
/// forwarded into the mailbox so denied hubs get swept between passes.
pub struct HostCache {
    inner: Mutex<CacheInner>,
    /// Mirrors the number of cached hubs for lock-free inspectors
    size: AtomicUsize,
    settings: SettingsPtr,
    security: SecurityPtr,
    op_tx: channel::Sender<CacheOp>,
    op_rx: channel::Receiver<CacheOp>,
    /// Notified once per entry on request_host_info()
    host_info: SubscriberPtr<SharedHostPtr>,
    /// Mailbox loop
    process: StoppableTaskPtr,
    /// Periodic maintenance signal
    maintainer: StoppableTaskPtr,
    /// Forwards security sanity-check requests into the mailbox
    sanity_watch: StoppableTaskPtr,
}

impl HostCache {
    pub async fn new(settings: SettingsPtr, security: SecurityPtr) -> HostCachePtr {
        let max_failures = settings.read().await.failure_limit;
        let (op_tx, op_rx) = channel::unbounded();

        Arc::new(Self {
            inner: Mutex::new(CacheInner {
                list: BucketList::new(max_failures),
                max_failures,
                t_last_save: 0,
                local_addr: None,
            }),
            size: AtomicUsize::new(0),
            settings,
            security,
            op_tx,
            op_rx,
            host_info: Subscriber::new(),
            process: StoppableTask::new(),
            maintainer: StoppableTask::new(),
            sanity_watch: StoppableTask::new(),
        })
    }

    /// Load the snapshot, run a first maintenance pass and spawn the actor
    /// tasks on the given executor.
    pub async fn start(self: Arc<Self>, executor: ExecutorPtr) -> Result<()> {
        debug!(target: "net::hostcache::store::start()", "Starting host cache");

        match self.load().await {
            Ok(n) => info!(target: "net::hostcache::store::start()", "Loaded {} hosts", n),
            Err(e) => {
                warn!(target: "net::hostcache::store::start()", "Error loading hosts: {}", e)
            }
        }

        self.maintain().await;

        // Mailbox loop
        self.process.clone().start(
            self.clone().run(),
            |_| async {},
            Error::ServiceStopped,
            executor.clone(),
        );

        // Periodic maintenance signal
        let self_ = self.clone();
        self.maintainer.clone().start(
            async move {
                loop {
                    sleep(MAINTENANCE_INTERVAL).await;
                    self_.op_tx.send(CacheOp::Maintain).await?;
                }
            },
            |_| async {},
            Error::ServiceStopped,
            executor.clone(),
        );

        // Forward sanity-check requests. Subscribed here, not inside the
        // task, so no request published during startup can be missed.
        let sanity_sub = self.security.subscribe_sanity_check().await;
        let self_ = self.clone();
        self.sanity_watch.clone().start(
            async move {
                loop {
                    sanity_sub.receive().await;
                    self_.op_tx.send(CacheOp::SanityCheck).await?;
                }
            },
            |_| async {},
            Error::ServiceStopped,
            executor,
        );

        Ok(())
    }

    /// Stop the actor tasks, drain the mailbox, write a final snapshot and
    /// destroy all entries.
    pub async fn stop(&self) {
        debug!(target: "net::hostcache::store::stop()", "Stopping host cache");

        self.maintainer.stop().await;
        self.sanity_watch.stop().await;
        self.process.stop().await;

        while let Ok(op) = self.op_rx.try_recv() {
            self.handle_op(op).await;
        }

        let now = tnow();
        let path = self.settings.read().await.cache_path.clone();
        let mut inner = self.inner.lock().await;
        self.save(&mut inner, now, &path);
        inner.list.clear();
        self.sync_size(&inner);
    }

    async fn run(self: Arc<Self>) -> Result<()> {
        loop {
            let op = self.op_rx.recv().await?;
            self.handle_op(op).await;
        }
    }

    // Producer entry points. All of them post to the mailbox and return
    // immediately; effects become visible once the actor gets to the
    // message.

    /// Record a hub sighted at `timestamp`.
    pub fn add(&self, addr: Endpoint, timestamp: u32) {
        self.post(CacheOp::Add { addr, timestamp });
    }

    /// Record a hub together with a query key, optionally received via a
    /// proxying neighbour.
    pub fn add_with_key(
        &self,
        addr: Endpoint,
        timestamp: u32,
        key: u32,
        key_host: Option<Endpoint>,
    ) {
        self.post(CacheOp::AddWithKey { addr, timestamp, key, key_host });
    }

    /// Record a hub together with the time of its last acknowledged
    /// operation.
    pub fn add_with_ack(&self, addr: Endpoint, timestamp: u32, ack: u32) {
        self.post(CacheOp::AddWithAck { addr, timestamp, ack });
    }

    /// Ingest the value of an X-Try-Hubs header:
    /// `ip:port yyyy-MM-ddThh:mmZ,ip:port yyyy-MM-ddThh:mmZ,...`
    pub fn add_xtry(&self, header: &str) {
        self.post(CacheOp::AddXTry { header: header.to_string() });
    }

    /// Overwrite the failure count of a cached hub. Counts beyond the
    /// ceiling drop the hub.
    pub fn update_failures(&self, addr: Endpoint, failures: u32) {
        self.post(CacheOp::UpdateFailures { addr, failures });
    }

    /// Record one more consecutive connection failure for a hub.
    pub fn connect_failure(&self, addr: Endpoint) {
        self.post(CacheOp::ConnectFailure { addr });
    }

    /// Drop a hub from the cache.
    pub fn remove(&self, addr: Endpoint) {
        self.post(CacheOp::Remove { addr });
    }

    /// Snapshot our own external address so it never enters the cache.
    pub fn local_address_changed(&self, addr: Option<Endpoint>) {
        self.post(CacheOp::LocalAddressChanged { addr });
    }

    fn post(&self, op: CacheOp) {
        if let Err(e) = self.op_tx.try_send(op) {
            error!(target: "net::hostcache::store::post()", "Failed queueing cache op: {}", e);
        }
    }

    // Inspectors

    /// Number of cached hubs. Lock-free; may briefly trail the container.
    pub fn count(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Look up the entry for an address.
    pub async fn get(&self, addr: &Endpoint) -> Option<SharedHostPtr> {
        let inner = self.inner.lock().await;
        let slot = inner.list.find(addr)?;
        inner.list.host_at(slot).cloned()
    }

    /// Whether this very handle is still part of the cache.
    pub async fn contains(&self, host: &SharedHostPtr) -> bool {
        let inner = self.inner.lock().await;
        let slot = host.slot();
        slot != NO_SLOT && inner.list.host_at(slot).is_some_and(|h| Arc::ptr_eq(h, host))
    }

    /// Pick the best connectable hub: lowest failure count first, most
    /// recently seen second. Hubs whose id is in `except` are skipped.
    ///
    /// The first pass honors the country preference unless it is `"ZZ"`.
    /// If nothing matches, one inline maintenance pass refreshes the
    /// connectable flags and the scan retries ignoring country; a second
    /// miss returns `None`.
    pub async fn get_connectable(
        &self,
        except: &HashSet<u32>,
        country: &str,
    ) -> Option<SharedHostPtr> {
        let mut inner = self.inner.lock().await;
        self.get_connectable_core(&mut inner, except, country).await
    }

    pub async fn has_connectable(&self) -> bool {
        self.get_connectable(&HashSet::new(), COUNTRY_NONE).await.is_some()
    }

    async fn get_connectable_core(
        &self,
        inner: &mut CacheInner,
        except: &HashSet<u32>,
        country: &str,
    ) -> Option<SharedHostPtr> {
        if self.size.load(Ordering::Relaxed) == 0 {
            return None
        }

        let mut second_attempt = false;
        loop {
            let by_country = !second_attempt && country != COUNTRY_NONE;

            for (_, slot) in inner.list.iter() {
                if let Some(host) = slot {
                    if by_country && host.addr().country() != country {
                        continue
                    }
                    if host.connectable() && !except.contains(&host.id()) {
                        return Some(host.clone())
                    }
                }
            }

            if second_attempt {
                return None
            }

            // Refresh connectable flags without re-entering the lock, then
            // retry once ignoring the country preference.
            self.maintain_core(inner).await;
            second_attempt = true;
        }
    }

    /// Produce an X-Try-Hubs header advertising our best hubs, or `None`
    /// when the cache is empty.
    pub async fn get_xtry(&self) -> Option<String> {
        if self.size.load(Ordering::Relaxed) == 0 {
            return None
        }

        let inner = self.inner.lock().await;
        let mut items = Vec::new();
        let mut sentinels = 0;

        for (_, slot) in inner.list.iter() {
            match slot {
                Some(host) => {
                    items.push(format!(
                        "{} {}",
                        host.addr(),
                        format_iso_minute(host.timestamp())
                    ));
                    if items.len() == XTRY_MAX_HOSTS {
                        break
                    }
                }
                None => {
                    sentinels += 1;
                    // Advertise hubs from the first two failure buckets only
                    if sentinels == 3 {
                        break
                    }
                }
            }
        }

        if items.is_empty() {
            return None
        }

        Some(format!("X-Try-Hubs: {}", items.join(",")))
    }

    /// Emit a host_info event for every cached hub. Returns the number of
    /// events emitted.
    pub async fn request_host_info(&self) -> usize {
        let inner = self.inner.lock().await;
        let mut count = 0;

        for (_, slot) in inner.list.iter() {
            if let Some(host) = slot {
                self.host_info.notify(host.clone()).await;
                count += 1;
            }
        }

        debug_assert_eq!(count, self.size.load(Ordering::Relaxed));
        count
    }

    pub async fn subscribe_host_info(&self) -> Subscription<SharedHostPtr> {
        self.host_info.clone().subscribe().await
    }

    /// Remove every hub, keeping the bucket skeleton.
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.list.clear();
        self.sync_size(&inner);
    }

    /// Drop hubs whose last acknowledged operation is older than the query
    /// host deadline. Called by the query engine on its own schedule.
    pub async fn prune_by_query_ack(&self) {
        let now = tnow();
        let deadline = self.settings.read().await.query_host_deadline;
        let expire = now.saturating_sub(deadline);

        let mut inner = self.inner.lock().await;
        let stale: Vec<usize> = inner
            .list
            .iter()
            .filter_map(|(idx, h)| h.filter(|h| h.ack() != 0 && h.ack() < expire).map(|_| idx))
            .collect();
        for idx in stale {
            inner.list.remove(idx);
        }
        self.sync_size(&inner);
    }

    // Actor internals

    async fn handle_op(&self, op: CacheOp) {
        match op {
            CacheOp::Add { addr, timestamp } => {
                self.add_host(addr, timestamp, None, None).await;
            }
            CacheOp::AddWithKey { addr, timestamp, key, key_host } => {
                self.add_host(addr, timestamp, Some((key, key_host)), None).await;
            }
            CacheOp::AddWithAck { addr, timestamp, ack } => {
                self.add_host(addr, timestamp, None, Some(ack)).await;
            }
            CacheOp::AddXTry { header } => self.handle_add_xtry(&header).await,
            CacheOp::UpdateFailures { addr, failures } => {
                self.handle_update_failures(addr, failures).await
            }
            CacheOp::ConnectFailure { addr } => self.handle_connect_failure(addr).await,
            CacheOp::Remove { addr } => self.handle_remove(addr).await,
            CacheOp::LocalAddressChanged { addr } => {
                self.inner.lock().await.local_addr = addr;
            }
            CacheOp::SanityCheck => self.sanity_check().await,
            CacheOp::Maintain => self.maintain().await,
        }
    }

    async fn add_host(
        &self,
        addr: Endpoint,
        timestamp: u32,
        key: Option<(u32, Option<Endpoint>)>,
        ack: Option<u32>,
    ) -> Option<SharedHostPtr> {
        let now = tnow();
        // The security verdict is collected before the cache mutex; the
        // rule lock strictly precedes it in the global lock order.
        let denied = self.security.is_denied(&addr).await;

        let mut inner = self.inner.lock().await;
        let host = self.add_core(&mut inner, addr, timestamp, now, 0, denied)?;
        if let Some((key, key_host)) = key {
            host.set_key(key, now, key_host);
        }
        if let Some(ack) = ack {
            host.set_ack(ack);
        }
        Some(host)
    }

    /// The one mutation primitive behind every add. Validates the input,
    /// clamps future timestamps, and either inserts a fresh entry or
    /// replaces an existing one through the uniform remove-then-insert
    /// path so bucket order never drifts.
    fn add_core(
        &self,
        inner: &mut CacheInner,
        addr: Endpoint,
        mut timestamp: u32,
        now: u32,
        failures: u8,
        denied: bool,
    ) -> Option<SharedHostPtr> {
        if !addr.is_valid() || addr.is_firewalled() {
            return None
        }

        if failures > inner.max_failures {
            return None
        }

        if denied {
            debug!(target: "net::hostcache::store::add_core()", "Denied host {}", addr);
            return None
        }

        if Some(&addr) == inner.local_addr.as_ref() {
            return None
        }

        if timestamp > now {
            timestamp = now - 60;
        }

        if let Some(slot) = inner.list.find(&addr) {
            return self.update_slot(inner, slot, timestamp, failures)
        }

        let host = Arc::new(HostEntry::new(addr, timestamp, failures));
        inner.list.insert(host.clone());
        self.sync_size(inner);
        Some(host)
    }

    /// Replace the entry at `slot` with a clone carrying new `(timestamp,
    /// failures)`. A failure count beyond the ceiling drops the entry.
    fn update_slot(
        &self,
        inner: &mut CacheInner,
        slot: usize,
        timestamp: u32,
        failures: u8,
    ) -> Option<SharedHostPtr> {
        let old = inner.list.host_at(slot).cloned()?;
        inner.list.remove(slot);

        let replacement = if failures <= inner.max_failures {
            let host = Arc::new(old.renew(timestamp, failures));
            inner.list.insert(host.clone());
            Some(host)
        } else {
            None
        };

        self.sync_size(inner);
        replacement
    }

    async fn handle_add_xtry(&self, header: &str) {
        let now = tnow();

        // X-Try-Hubs: 86.141.203.14:6346 2010-02-23T16:17Z,91.78.12.117:1164
        // 2010-02-23T16:17Z,89.74.83.103:7972 2010-02-23T16:17Z,...
        let mut parsed = Vec::new();
        for item in header.split(',') {
            let mut parts = item.split_whitespace();
            let Some(addr_str) = parts.next() else { continue };
            let Ok(addr) = addr_str.parse::<Endpoint>() else { continue };
            if !addr.is_valid() {
                continue
            }
            let timestamp = parts.next().and_then(parse_iso_minute).unwrap_or(now);
            parsed.push((addr, timestamp));
        }

        let mut allowed = Vec::with_capacity(parsed.len());
        for (addr, timestamp) in parsed {
            if self.security.is_denied(&addr).await {
                continue
            }
            allowed.push((addr, timestamp));
        }

        let mut inner = self.inner.lock().await;
        for (addr, timestamp) in allowed {
            self.add_core(&mut inner, addr, timestamp, now, 0, false);
        }
    }

    async fn handle_update_failures(&self, addr: Endpoint, failures: u32) {
        let mut inner = self.inner.lock().await;
        let Some(slot) = inner.list.find(&addr) else { return };

        if failures > inner.max_failures as u32 {
            inner.list.remove(slot);
            self.sync_size(&inner);
            return
        }

        let Some(timestamp) = inner.list.host_at(slot).map(|h| h.timestamp()) else { return };
        self.update_slot(&mut inner, slot, timestamp, failures as u8);
    }

    async fn handle_connect_failure(&self, addr: Endpoint) {
        let mut inner = self.inner.lock().await;
        let Some(slot) = inner.list.find(&addr) else { return };
        let Some(host) = inner.list.host_at(slot).cloned() else { return };

        if host.failures() < inner.max_failures {
            self.update_slot(&mut inner, slot, host.timestamp(), host.failures() + 1);
        } else {
            // At the ceiling the entry stays put until the next
            // maintenance pass evicts it.
            host.mark_for_eviction();
        }
    }

    async fn handle_remove(&self, addr: Endpoint) {
        let mut inner = self.inner.lock().await;
        if let Some(slot) = inner.list.find(&addr) {
            inner.list.remove(slot);
            self.sync_size(&inner);
        }
    }

    /// Sweep entries denied by security rules added since the last sweep.
    /// The rule lock is taken first and the cache mutex second, keeping
    /// the cache lockdown as short as possible.
    pub async fn sanity_check(&self) {
        let removed;
        {
            let rules = self.security.read_rules().await;
            let mut inner = self.inner.lock().await;

            let denied: Vec<usize> = inner
                .list
                .iter()
                .filter_map(|(idx, h)| h.filter(|h| rules.is_newly_denied(h.addr())).map(|_| idx))
                .collect();
            removed = denied.len();
            for idx in denied {
                inner.list.remove(idx);
            }
            self.sync_size(&inner);
        }

        self.security.sanity_check_performed(removed).await;
        debug!(
            target: "net::hostcache::store::sanity_check()",
            "Finished sanity checking. {} hosts removed.", removed
        );
    }

    /// Run one maintenance pass.
    pub async fn maintain(&self) {
        let mut inner = self.inner.lock().await;
        self.maintain_core(&mut inner).await;
    }

    async fn maintain_core(&self, inner: &mut CacheInner) {
        let now = tnow();
        let settings = self.settings.read().await.clone();

        // Reshape the bucket skeleton if the failure ceiling changed
        if inner.max_failures != settings.failure_limit {
            inner.list.set_max_failures(settings.failure_limit);
            inner.max_failures = settings.failure_limit;
            self.sync_size(inner);
        }

        // Expire hubs unseen for too long, plus those that failed at the
        // ceiling since the last pass
        self.prune_old_hosts(inner, now.saturating_sub(settings.host_expire));
        let doomed: Vec<usize> = inner
            .list
            .iter()
            .filter_map(|(idx, h)| h.filter(|h| h.marked_for_eviction()).map(|_| idx))
            .collect();
        for idx in doomed {
            inner.list.remove(idx);
        }
        self.sync_size(inner);

        // Size cap: free 25% headroom in one pass, worst hubs first,
        // then persist. Otherwise persist on the periodic schedule.
        let cap = settings.host_cache_size;
        if cap != 0 && inner.list.len() > cap as usize {
            let target = (cap - cap / 4) as usize;
            let mut failures = inner.max_failures;
            while inner.list.len() > target {
                if !inner.list.remove_worst(&mut failures) {
                    break
                }
            }
            self.sync_size(inner);
            self.save(inner, now, &settings.cache_path);
        } else if now > inner.t_last_save + SAVE_INTERVAL {
            self.save(inner, now, &settings.cache_path);
        }

        // Recompute connectable for all throttled hubs. The running
        // throttle is connect_throttle + k * failure_penalty in bucket k;
        // crossing a sentinel bumps it, the leading one immediately.
        let penalty = settings.failure_penalty as i64;
        let mut throttle = settings.connect_throttle as i64 - penalty;
        for (_, slot) in inner.list.iter() {
            match slot {
                Some(host) => {
                    // A host with last_connect == 0 satisfies this at once
                    if !host.connectable() {
                        host.set_connectable(now as i64 > host.last_connect() as i64 + throttle);
                    }
                }
                None => throttle += penalty,
            }
        }
    }

    /// Drop hubs last seen before `expire`. Sentinels are skipped; every
    /// entry is visited.
    fn prune_old_hosts(&self, inner: &mut CacheInner, expire: u32) {
        let stale: Vec<usize> = inner
            .list
            .iter_rev()
            .filter_map(|(idx, h)| h.filter(|h| h.timestamp() < expire).map(|_| idx))
            .collect();
        for idx in stale {
            inner.list.remove(idx);
        }
        self.sync_size(inner);
    }

    fn sync_size(&self, inner: &CacheInner) {
        self.size.store(inner.list.len(), Ordering::Relaxed);
    }

    // Persistence

    fn encode_snapshot(inner: &CacheInner) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.write_u16(SNAPSHOT_VERSION)?;
        buf.write_u32(inner.list.len() as u32)?;

        for (_, slot) in inner.list.iter() {
            if let Some(host) = slot {
                host.addr().encode(&mut buf)?;
                buf.write_u8(host.failures())?;
                buf.write_u32(host.timestamp())?;
                buf.write_u32(host.last_connect())?;
            }
        }

        Ok(buf)
    }

    fn decode_snapshot(bytes: &[u8]) -> Result<Vec<(Endpoint, u8, u32, u32)>> {
        let mut cursor = Cursor::new(bytes);

        let version = cursor.read_u16()?;
        if version != SNAPSHOT_VERSION {
            warn!(
                target: "net::hostcache::store::load()",
                "Snapshot version {} does not match {}, discarding", version, SNAPSHOT_VERSION
            );
            return Ok(Vec::new())
        }

        let count = cursor.read_u32()?;
        let mut records = Vec::new();
        for _ in 0..count {
            let addr = Endpoint::decode(&mut cursor)?;
            let failures = cursor.read_u8()?;
            let timestamp = cursor.read_u32()?;
            let last_connect = cursor.read_u32()?;
            records.push((addr, failures, timestamp, last_connect));
        }

        Ok(records)
    }

    /// Write a snapshot through the secured-save helper. On failure the
    /// previous snapshot survives and `t_last_save` stays put, so the next
    /// tick retries.
    fn save(&self, inner: &mut CacheInner, now: u32, path: &Path) {
        let bytes = match Self::encode_snapshot(inner) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(target: "net::hostcache::store::save()", "Failed encoding snapshot: {}", e);
                return
            }
        };

        match secured_save_file(path, &bytes) {
            Ok(()) => {
                inner.t_last_save = now;
                debug!(target: "net::hostcache::store::save()", "Saved {} hosts", inner.list.len());
            }
            Err(e) => {
                warn!(target: "net::hostcache::store::save()", "Failed saving host cache: {}", e)
            }
        }
    }

    /// Read the snapshot back. A missing, short or wrong-version file
    /// yields an empty cache. Returns the number of hubs loaded.
    pub async fn load(&self) -> Result<usize> {
        let now = tnow();
        let (path, host_expire) = {
            let settings = self.settings.read().await;
            (settings.cache_path.clone(), settings.host_expire)
        };

        let bytes = match load_file_bytes(&path) {
            Ok(bytes) => bytes,
            Err(Error::Io(std::io::ErrorKind::NotFound)) => return Ok(0),
            Err(e) => return Err(e),
        };

        let records = match Self::decode_snapshot(&bytes) {
            Ok(records) => records,
            Err(e) => {
                warn!(target: "net::hostcache::store::load()", "Discarding snapshot: {}", e);
                Vec::new()
            }
        };

        // Security verdicts are collected before the cache mutex is taken
        let mut allowed = Vec::with_capacity(records.len());
        for record in records {
            if self.security.is_denied(&record.0).await {
                continue
            }
            allowed.push(record);
        }

        let mut inner = self.inner.lock().await;
        let mut loaded = 0;
        for (addr, failures, timestamp, mut last_connect) in allowed {
            if let Some(host) = self.add_core(&mut inner, addr, timestamp, now, failures, false) {
                if last_connect > now {
                    last_connect = now - 60;
                }
                host.set_last_connect(last_connect);
                loaded += 1;
            }
        }

        self.prune_old_hosts(&mut inner, now.saturating_sub(host_expire));
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        net::{security::SecurityManager, settings::Settings},
        system::msleep,
    };
    use smol::lock::RwLock;

    fn test_settings(name: &str) -> SettingsPtr {
        let mut settings = Settings::default();
        let mut path = std::env::temp_dir();
        path.push(format!("ferroshare_store_{}_{}.dat", name, std::process::id()));
        let _ = std::fs::remove_file(&path);
        settings.cache_path = path;
        Arc::new(RwLock::new(settings))
    }

    async fn test_cache(name: &str) -> HostCachePtr {
        HostCache::new(test_settings(name), SecurityManager::new()).await
    }

    fn ep(s: &str) -> Endpoint {
        s.parse().unwrap()
    }

    async fn order(cache: &HostCache) -> Vec<String> {
        let inner = cache.inner.lock().await;
        inner.list.iter().filter_map(|(_, h)| h.map(|h| h.addr().to_string())).collect()
    }

    #[test]
    fn add_then_connectable() {
        smol::block_on(async {
            let cache = test_cache("add_then_connectable").await;
            let addr = ep("86.141.203.14:6346");

            cache.handle_op(CacheOp::Add { addr: addr.clone(), timestamp: tnow() - 100 }).await;
            assert_eq!(cache.count(), 1);
            assert!(!cache.is_empty());

            let host = cache.get(&addr).await.unwrap();
            assert_eq!(host.failures(), 0);
            assert!(cache.contains(&host).await);

            // A fresh entry is not connectable yet; the selection API runs
            // an inline maintenance pass and retries.
            let picked = cache.get_connectable(&HashSet::new(), COUNTRY_NONE).await.unwrap();
            assert_eq!(picked.addr(), &addr);
            assert!(picked.connectable());
            assert!(cache.has_connectable().await);

            // Excluded ids are never returned
            let mut except = HashSet::new();
            except.insert(picked.id());
            assert!(cache.get_connectable(&except, COUNTRY_NONE).await.is_none());
        });
    }

    #[test]
    fn duplicate_add_is_idempotent() {
        smol::block_on(async {
            let cache = test_cache("duplicate_add").await;
            let addr = ep("88.183.80.110:6346");
            let timestamp = tnow() - 50;

            cache.handle_op(CacheOp::Add { addr: addr.clone(), timestamp }).await;
            let first_id = cache.get(&addr).await.unwrap().id();

            cache.handle_op(CacheOp::Add { addr: addr.clone(), timestamp }).await;
            assert_eq!(cache.count(), 1);
            // The replacement entry keeps the UI id
            assert_eq!(cache.get(&addr).await.unwrap().id(), first_id);
        });
    }

    #[test]
    fn future_timestamp_clamped() {
        smol::block_on(async {
            let cache = test_cache("future_timestamp").await;
            let addr = ep("24.226.149.80:6346");
            let now = tnow();

            cache.handle_op(CacheOp::Add { addr: addr.clone(), timestamp: now + 5000 }).await;
            let host = cache.get(&addr).await.unwrap();
            assert!(host.timestamp() >= now - 60);
            assert!(host.timestamp() <= tnow() - 60);
        });
    }

    #[test]
    fn local_address_not_cached() {
        smol::block_on(async {
            let cache = test_cache("local_address").await;
            let local = ep("89.142.217.180:9633");

            cache.handle_op(CacheOp::LocalAddressChanged { addr: Some(local.clone()) }).await;
            cache.handle_op(CacheOp::Add { addr: local.clone(), timestamp: tnow() }).await;
            assert_eq!(cache.count(), 0);

            cache.handle_op(CacheOp::Add { addr: ep("83.219.112.111:6346"), timestamp: tnow() })
                .await;
            assert_eq!(cache.count(), 1);
        });
    }

    #[test]
    fn invalid_and_firewalled_rejected() {
        smol::block_on(async {
            let cache = test_cache("rejects").await;
            cache.handle_op(CacheOp::Add { addr: ep("192.168.10.65:6346"), timestamp: tnow() })
                .await;
            cache.handle_op(CacheOp::Add { addr: ep("127.0.0.1:6346"), timestamp: tnow() }).await;
            cache.handle_op(CacheOp::Add { addr: ep("77.209.25.104:0"), timestamp: tnow() }).await;
            assert_eq!(cache.count(), 0);
        });
    }

    #[test]
    fn failure_bucketing() {
        smol::block_on(async {
            let cache = test_cache("failure_bucketing").await;
            let a = ep("201.17.187.205:6346");
            let b = ep("213.29.19.41:6346");
            let now = tnow();

            cache.handle_op(CacheOp::Add { addr: a.clone(), timestamp: now - 100 }).await;
            cache.handle_op(CacheOp::Add { addr: b.clone(), timestamp: now - 500 }).await;

            cache.handle_op(CacheOp::ConnectFailure { addr: a.clone() }).await;
            cache.handle_op(CacheOp::ConnectFailure { addr: a.clone() }).await;

            let host = cache.get(&a).await.unwrap();
            assert_eq!(host.failures(), 2);
            // Timestamp survives the re-bucketing
            assert_eq!(host.timestamp(), now - 100);

            // Global order: bucket 0 first, then the twice-failed hub
            assert_eq!(order(&cache).await, [b.to_string(), a.to_string()]);
        });
    }

    #[test]
    fn ceiling_failure_evicted_by_maintenance() {
        smol::block_on(async {
            let cache = test_cache("ceiling_eviction").await;
            let addr = ep("78.231.224.180:6346");

            cache.handle_op(CacheOp::Add { addr: addr.clone(), timestamp: tnow() - 10 }).await;

            // failure_limit + 1 failures in a row
            for _ in 0..4 {
                cache.handle_op(CacheOp::ConnectFailure { addr: addr.clone() }).await;
            }
            // Still cached, parked at the ceiling bucket
            assert_eq!(cache.count(), 1);
            assert_eq!(cache.get(&addr).await.unwrap().failures(), 3);

            cache.maintain().await;
            assert_eq!(cache.count(), 0);
        });
    }

    #[test]
    fn size_cap_keeps_headroom() {
        smol::block_on(async {
            let settings = test_settings("size_cap");
            settings.write().await.host_cache_size = 8;
            let cache = HostCache::new(settings, SecurityManager::new()).await;

            let now = tnow();
            for i in 0..10u32 {
                let addr = ep(&format!("77.1.1.{}:6346", i + 1));
                cache.handle_op(CacheOp::Add { addr, timestamp: now - i }).await;
            }
            assert_eq!(cache.count(), 10);

            cache.maintain().await;
            // Cap minus 25% headroom
            assert_eq!(cache.count(), 6);

            // The oldest hubs went first
            let inner = cache.inner.lock().await;
            for (_, slot) in inner.list.iter() {
                if let Some(host) = slot {
                    assert!(host.timestamp() > now - 6);
                }
            }
        });
    }

    #[test]
    fn xtry_emission() {
        smol::block_on(async {
            let cache = test_cache("xtry_emission").await;
            assert!(cache.get_xtry().await.is_none());

            let now = tnow();
            let newer = ep("86.220.168.24:59153");
            let older = ep("93.89.196.113:5649");
            let failed_once = ep("89.74.83.103:7972");
            let failed_twice = ep("91.78.12.117:1164");

            cache.handle_op(CacheOp::Add { addr: older.clone(), timestamp: now - 2000 }).await;
            cache.handle_op(CacheOp::Add { addr: newer.clone(), timestamp: now - 1000 }).await;
            cache.handle_op(CacheOp::Add { addr: failed_once.clone(), timestamp: now - 100 }).await;
            cache.handle_op(CacheOp::UpdateFailures { addr: failed_once.clone(), failures: 1 })
                .await;
            cache.handle_op(CacheOp::Add { addr: failed_twice.clone(), timestamp: now - 100 })
                .await;
            cache.handle_op(CacheOp::UpdateFailures { addr: failed_twice.clone(), failures: 2 })
                .await;

            let header = cache.get_xtry().await.unwrap();
            let value = header.strip_prefix("X-Try-Hubs: ").unwrap();
            let items: Vec<&str> = value.split(',').collect();

            // Bucket 0 by recency, then bucket 1; bucket 2 is not advertised
            assert_eq!(items.len(), 3);
            assert_eq!(
                items[0],
                format!("{} {}", newer, format_iso_minute(now - 1000))
            );
            assert_eq!(
                items[1],
                format!("{} {}", older, format_iso_minute(now - 2000))
            );
            assert!(items[2].starts_with(&failed_once.to_string()));
        });
    }

    #[test]
    fn xtry_caps_at_ten() {
        smol::block_on(async {
            let cache = test_cache("xtry_cap").await;
            let now = tnow();
            for i in 0..12u32 {
                let addr = ep(&format!("77.2.2.{}:6346", i + 1));
                cache.handle_op(CacheOp::Add { addr, timestamp: now - i }).await;
            }

            let header = cache.get_xtry().await.unwrap();
            let value = header.strip_prefix("X-Try-Hubs: ").unwrap();
            assert_eq!(value.split(',').count(), 10);
            assert!(!value.ends_with(','));
        });
    }

    #[test]
    fn xtry_ingestion() {
        smol::block_on(async {
            let cache = test_cache("xtry_ingestion").await;
            cache
                .handle_op(CacheOp::AddXTry {
                    header: "5.6.7.8:1 2010-02-23T16:17Z, bad 2010, 9.9.9.9:2".to_string(),
                })
                .await;

            assert_eq!(cache.count(), 2);
            let first = cache.get(&ep("5.6.7.8:1")).await.unwrap();
            assert_eq!(first.timestamp(), 1266941820);

            // No parseable timestamp falls back to the current time
            let second = cache.get(&ep("9.9.9.9:2")).await.unwrap();
            assert!(second.timestamp() >= tnow() - 60);
        });
    }

    #[test]
    fn update_failures_beyond_ceiling_drops() {
        smol::block_on(async {
            let cache = test_cache("update_failures").await;
            let addr = ep("213.143.88.92:6346");
            let timestamp = tnow() - 30;

            cache.handle_op(CacheOp::Add { addr: addr.clone(), timestamp }).await;
            cache.handle_op(CacheOp::UpdateFailures { addr: addr.clone(), failures: 2 }).await;
            let host = cache.get(&addr).await.unwrap();
            assert_eq!(host.failures(), 2);
            assert_eq!(host.timestamp(), timestamp);

            cache.handle_op(CacheOp::UpdateFailures { addr: addr.clone(), failures: 99 }).await;
            assert_eq!(cache.count(), 0);
        });
    }

    #[test]
    fn remove_host() {
        smol::block_on(async {
            let cache = test_cache("remove_host").await;
            let addr = ep("24.193.237.252:6346");

            cache.handle_op(CacheOp::Add { addr: addr.clone(), timestamp: tnow() }).await;
            let host = cache.get(&addr).await.unwrap();

            cache.handle_op(CacheOp::Remove { addr: addr.clone() }).await;
            assert_eq!(cache.count(), 0);
            assert!(cache.get(&addr).await.is_none());
            assert!(!cache.contains(&host).await);
        });
    }

    #[test]
    fn snapshot_roundtrip() {
        smol::block_on(async {
            let settings = test_settings("snapshot_roundtrip");
            let cache = HostCache::new(settings.clone(), SecurityManager::new()).await;
            let now = tnow();

            let a = ep("86.141.203.14:6346");
            let b = ep("91.78.12.117:1164");
            cache.handle_op(CacheOp::Add { addr: a.clone(), timestamp: now - 100 }).await;
            cache.handle_op(CacheOp::Add { addr: b.clone(), timestamp: now - 200 }).await;
            cache.handle_op(CacheOp::UpdateFailures { addr: b.clone(), failures: 1 }).await;
            cache.get(&a).await.unwrap().set_last_connect(now - 40);

            {
                let path = settings.read().await.cache_path.clone();
                let mut inner = cache.inner.lock().await;
                cache.save(&mut inner, now, &path);
            }

            let reloaded = HostCache::new(settings, SecurityManager::new()).await;
            assert_eq!(reloaded.load().await.unwrap(), 2);

            let a2 = reloaded.get(&a).await.unwrap();
            assert_eq!(a2.failures(), 0);
            assert_eq!(a2.timestamp(), now - 100);
            assert_eq!(a2.last_connect(), now - 40);

            let b2 = reloaded.get(&b).await.unwrap();
            assert_eq!(b2.failures(), 1);
            assert_eq!(b2.timestamp(), now - 200);
            assert_eq!(b2.last_connect(), 0);
        });
    }

    #[test]
    fn snapshot_version_mismatch_discarded() {
        smol::block_on(async {
            let settings = test_settings("snapshot_version");
            let path = settings.read().await.cache_path.clone();

            let mut bytes = Vec::new();
            bytes.write_u16(SNAPSHOT_VERSION + 1).unwrap();
            bytes.write_u32(1).unwrap();
            ep("86.141.203.14:6346").encode(&mut bytes).unwrap();
            bytes.write_u8(0).unwrap();
            bytes.write_u32(tnow()).unwrap();
            bytes.write_u32(0).unwrap();
            secured_save_file(&path, &bytes).unwrap();

            let cache = HostCache::new(settings, SecurityManager::new()).await;
            assert_eq!(cache.load().await.unwrap(), 0);
            assert_eq!(cache.count(), 0);
        });
    }

    #[test]
    fn snapshot_skips_denied_records() {
        smol::block_on(async {
            let settings = test_settings("snapshot_denied");
            let cache = HostCache::new(settings.clone(), SecurityManager::new()).await;
            let now = tnow();

            let bad = ep("86.141.203.14:6346");
            let good = ep("88.183.80.110:6346");
            cache.handle_op(CacheOp::Add { addr: bad.clone(), timestamp: now - 10 }).await;
            cache.handle_op(CacheOp::Add { addr: good.clone(), timestamp: now - 10 }).await;
            {
                let path = settings.read().await.cache_path.clone();
                let mut inner = cache.inner.lock().await;
                cache.save(&mut inner, now, &path);
            }

            let security = SecurityManager::new();
            security.deny_addr(bad.ip()).await;
            let reloaded = HostCache::new(settings, security).await;
            assert_eq!(reloaded.load().await.unwrap(), 1);
            assert!(reloaded.get(&bad).await.is_none());
            assert!(reloaded.get(&good).await.is_some());
        });
    }

    #[test]
    fn sanity_check_sweeps_newly_denied() {
        smol::block_on(async {
            let security = SecurityManager::new();
            let cache =
                HostCache::new(test_settings("sanity_check"), security.clone()).await;

            let bad = ep("89.142.217.180:9633");
            let good = ep("83.219.112.111:6346");
            cache.handle_op(CacheOp::Add { addr: bad.clone(), timestamp: tnow() }).await;
            cache.handle_op(CacheOp::Add { addr: good.clone(), timestamp: tnow() }).await;

            let performed = security.subscribe_sanity_performed().await;
            security.deny_addr(bad.ip()).await;

            cache.sanity_check().await;
            assert_eq!(performed.receive().await, 1);
            assert_eq!(cache.count(), 1);
            assert!(cache.get(&bad).await.is_none());
            assert!(cache.get(&good).await.is_some());

            // A denied hub cannot re-enter
            cache.handle_op(CacheOp::Add { addr: bad.clone(), timestamp: tnow() }).await;
            assert_eq!(cache.count(), 1);

            performed.unsubscribe().await;
        });
    }

    #[test]
    fn query_ack_pruning() {
        smol::block_on(async {
            let cache = test_cache("query_ack").await;
            let stale = ep("77.209.25.104:1515");
            let fresh = ep("86.220.168.24:59153");
            let now = tnow();

            cache
                .handle_op(CacheOp::AddWithAck {
                    addr: stale.clone(),
                    timestamp: now - 100,
                    ack: now - 10000,
                })
                .await;
            cache.handle_op(CacheOp::Add { addr: fresh.clone(), timestamp: now - 100 }).await;

            cache.prune_by_query_ack().await;
            assert_eq!(cache.count(), 1);
            assert!(cache.get(&stale).await.is_none());
            assert!(cache.get(&fresh).await.is_some());
        });
    }

    #[test]
    fn query_key_attachment() {
        smol::block_on(async {
            let cache = test_cache("query_key").await;
            let addr = ep("93.89.196.113:5649");
            let proxy = ep("89.74.83.103:7972");

            cache
                .handle_op(CacheOp::AddWithKey {
                    addr: addr.clone(),
                    timestamp: tnow() - 5,
                    key: 0xcafe,
                    key_host: Some(proxy.clone()),
                })
                .await;

            let host = cache.get(&addr).await.unwrap();
            assert_eq!(host.query_key(), 0xcafe);
            assert_eq!(host.key_host(), Some(proxy));
            assert!(host.key_time() >= tnow() - 60);
        });
    }

    #[test]
    fn ceiling_reshape_via_settings() {
        smol::block_on(async {
            let settings = test_settings("reshape");
            let cache = HostCache::new(settings.clone(), SecurityManager::new()).await;
            let now = tnow();

            let keep = ep("86.141.203.14:6346");
            let bucket2 = ep("91.78.12.117:1164");
            let bucket3 = ep("89.74.83.103:7972");
            cache.handle_op(CacheOp::Add { addr: keep.clone(), timestamp: now - 10 }).await;
            cache.handle_op(CacheOp::Add { addr: bucket2.clone(), timestamp: now - 10 }).await;
            cache.handle_op(CacheOp::UpdateFailures { addr: bucket2.clone(), failures: 2 }).await;
            cache.handle_op(CacheOp::Add { addr: bucket3.clone(), timestamp: now - 10 }).await;
            cache.handle_op(CacheOp::UpdateFailures { addr: bucket3.clone(), failures: 3 }).await;

            // Lowering the ceiling evicts exactly the buckets above it
            settings.write().await.failure_limit = 1;
            cache.maintain().await;
            assert_eq!(cache.count(), 1);
            assert!(cache.get(&keep).await.is_some());

            // Raising it only adds empty buckets
            settings.write().await.failure_limit = 4;
            cache.maintain().await;
            assert_eq!(cache.count(), 1);

            let inner = cache.inner.lock().await;
            assert_eq!(inner.max_failures, 4);
            inner.list.check_invariants();
        });
    }

    #[test]
    fn host_info_events() {
        smol::block_on(async {
            let cache = test_cache("host_info").await;
            let sub = cache.subscribe_host_info().await;

            cache.handle_op(CacheOp::Add { addr: ep("201.17.187.205:6346"), timestamp: tnow() })
                .await;
            cache.handle_op(CacheOp::Add { addr: ep("213.29.19.41:6346"), timestamp: tnow() })
                .await;

            assert_eq!(cache.request_host_info().await, 2);
            let mut seen = HashSet::new();
            seen.insert(sub.receive().await.addr().to_string());
            seen.insert(sub.receive().await.addr().to_string());
            assert_eq!(seen.len(), 2);

            sub.unsubscribe().await;
        });
    }

    #[test]
    fn clear_cache() {
        smol::block_on(async {
            let cache = test_cache("clear").await;
            cache.handle_op(CacheOp::Add { addr: ep("78.231.224.180:6346"), timestamp: tnow() })
                .await;
            cache.handle_op(CacheOp::Add { addr: ep("213.143.88.92:6346"), timestamp: tnow() })
                .await;

            cache.clear().await;
            assert_eq!(cache.count(), 0);
            assert!(cache.is_empty());

            let inner = cache.inner.lock().await;
            inner.list.check_invariants();
        });
    }

    #[test]
    fn actor_end_to_end() {
        // Uncomment for inner logging
        /*
        simplelog::TermLogger::init(
            simplelog::LevelFilter::Debug,
            simplelog::Config::default(),
            simplelog::TerminalMode::Mixed,
            simplelog::ColorChoice::Auto,
        )
        .unwrap();
        */

        let executor = Arc::new(smol::Executor::new());
        smol::block_on(executor.clone().run(async {
            let settings = test_settings("actor");
            let security = SecurityManager::new();
            let cache = HostCache::new(settings.clone(), security.clone()).await;
            cache.clone().start(executor.clone()).await.unwrap();

            let denied = ep("88.183.80.110:6346");
            let kept = ep("24.226.149.80:6346");
            cache.add(denied.clone(), tnow() - 10);
            cache.add(kept.clone(), tnow() - 10);
            while cache.count() < 2 {
                msleep(10).await;
            }

            // A new security rule flows through the mailbox and sweeps the
            // denied hub.
            security.deny_addr(denied.ip()).await;
            while cache.count() > 1 {
                msleep(10).await;
            }
            assert!(cache.get(&kept).await.is_some());

            cache.stop().await;
            assert_eq!(cache.count(), 0);

            // stop() wrote a final snapshot with the surviving hub
            let reloaded = HostCache::new(settings, SecurityManager::new()).await;
            assert_eq!(reloaded.load().await.unwrap(), 1);
            assert!(reloaded.get(&kept).await.is_some());
        }));
    }
}
