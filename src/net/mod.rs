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

/// Network endpoints. An endpoint is an IPv4 or IPv6 address with a port,
/// optionally annotated with a GeoIP country code. Handles parsing from and
/// formatting to the `ip:port` text form used on the wire, classification
/// of private/reserved ranges, and the binary form used by the snapshot
/// file.
pub mod endpoint;
pub use endpoint::Endpoint;

/// The G2 host cache. A directory of candidate remote hubs ordered for
/// connection attempts, maintained by a single actor task and persisted
/// across runs.
pub mod hostcache;
pub use hostcache::{HostCache, HostCachePtr, HostEntry, SharedHostPtr};

/// Security manager. Holds the deny rules applied to remote endpoints and
/// drives the sanity-check cycle that sweeps newly denied entries out of
/// the live data structures.
pub mod security;
pub use security::{SecurityManager, SecurityPtr};

/// Runtime-tunable settings observed lazily by the host cache maintenance
/// pass.
pub mod settings;
pub use settings::{Settings, SettingsPtr};
