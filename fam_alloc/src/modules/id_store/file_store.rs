/*
 *  Copyright (C) 2025  Markus Elias Gerber
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  You should have received a copy of the GNU General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use std::{
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
};

use super::{IdStoreError, IdStoreModule};

/// Stores the watermark as a decimal number in a file.
///
/// Updates go to a sibling temporary file which is synced and then renamed
/// over the old one, so a crash leaves either the old or the new value.
#[derive(Debug, Clone)]
pub struct FileIdStore {
    path: PathBuf,
}

impl FileIdStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl IdStoreModule for FileIdStore {
    fn load(&mut self) -> Result<u64, IdStoreError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };

        content
            .trim()
            .parse()
            .map_err(|_| IdStoreError::Corrupt { content })
    }

    fn store(&mut self, watermark: u64) -> Result<(), IdStoreError> {
        let temp = self.temp_path();
        {
            let mut file = File::create(&temp)?;
            writeln!(file, "{}", watermark)?;
            file.sync_all()?;
        }
        fs::rename(&temp, &self.path)?;

        Ok(())
    }
}
