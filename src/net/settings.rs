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
    path::{Path, PathBuf},
    sync::Arc,
};

use smol::lock::RwLock;

use crate::util::path::join_data_path;

/// Atomic pointer to the client settings.
///
/// Settings may be rewritten at runtime by the configuration UI. Components
/// do not react to changes eagerly; the host cache reads the fields it
/// cares about on each maintenance pass.
pub type SettingsPtr = Arc<RwLock<Settings>>;

/// Tunable client settings. Can be manually configured.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Consecutive connection failures after which a hub is dropped from
    /// the cache
    pub failure_limit: u8,
    /// Upper bound on cached hubs, 0 disables the limit
    pub host_cache_size: u32,
    /// Seconds after which an unseen hub expires
    pub host_expire: u32,
    /// Seconds after which a hub with an outstanding query ack is dropped
    pub query_host_deadline: u32,
    /// Minimum seconds between queries to the same hub
    pub query_host_throttle: u32,
    /// Base seconds between connection attempts to the same hub
    pub connect_throttle: u32,
    /// Additional connect-throttle seconds per recorded failure
    pub failure_penalty: u16,
    /// Location of the host cache snapshot file
    pub cache_path: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            failure_limit: 3,
            host_cache_size: 3000,
            host_expire: 172800,
            query_host_deadline: 600,
            query_host_throttle: 120,
            connect_throttle: 60,
            failure_penalty: 300,
            cache_path: join_data_path(Path::new("hostcache.dat"))
                .unwrap_or_else(|_| PathBuf::from("hostcache.dat")),
        }
    }
}
