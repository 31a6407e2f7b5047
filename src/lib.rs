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

/// Networking: endpoints, runtime settings, the security manager and
/// the G2 host cache.
pub mod net;

/// Async runtime primitives: stoppable tasks, pub/sub, condition variable.
pub mod system;

/// Utilities: file and path helpers, UTC time handling.
pub mod util;

/// Error handling
pub mod error;
pub use error::{Error, Result};
