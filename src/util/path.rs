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

use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Resolve `file` inside the per-user ferroshare data directory.
pub fn join_data_path(file: &Path) -> Result<PathBuf> {
    let mut path = dirs::data_dir().ok_or(Error::PathNotFound)?;
    let app_path = Path::new("ferroshare");

    path.push(app_path);
    path.push(file);

    Ok(path)
}
