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

//! The G2 host cache keeps a directory of candidate remote hubs, ordered
//! for connection attempts by failure count first and recency second.

/// The ordered container behind the cache. One sequence of slots
/// partitioned into failure buckets by sentinel slots, so a single forward
/// scan yields hubs in global priority order.
mod bucket;

/// The per-hub value object. Timestamp and failure count are frozen at
/// construction; everything else (query key, ack and connection timing,
/// the connectable flag) is interior-mutable so shared handles stay
/// readable while the cache reshuffles entries.
pub mod host;
pub use host::{HostEntry, SharedHostPtr};

/// The owning actor. All mutations arrive as typed messages on a mailbox
/// serviced by one task; inspectors share a mutex with the actor. A
/// periodic signal drives maintenance: failure-ceiling reshape, expiry,
/// size-capped eviction, connectable recomputation and snapshot saves.
/// The security manager's sanity checks sweep denied hubs out between
/// passes.
pub mod store;
pub use store::{HostCache, HostCachePtr, MAINTENANCE_INTERVAL, SNAPSHOT_VERSION};
