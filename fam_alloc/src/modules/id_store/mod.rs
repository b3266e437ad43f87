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

mod file_store;

pub use file_store::FileIdStore;

use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IdStoreError {
    #[error("id watermark i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("id watermark is corrupt: {content:?}")]
    Corrupt { content: String },
}

/// Keeps the high-water mark of handed out region ids.
///
/// The region table reserves ids in blocks and stores the end of each block
/// before handing out ids from it, so after a restart no id is reused even
/// if the service crashed in the middle of a block.
pub trait IdStoreModule: Send {
    /// Returns the stored high-water mark, `0` if nothing was stored yet
    fn load(&mut self) -> Result<u64, IdStoreError>;

    /// Records that ids up to and including `watermark` may have been handed out
    fn store(&mut self, watermark: u64) -> Result<(), IdStoreError>;
}

/// Watermark that lives as long as the process does
#[derive(Debug, Clone, Default)]
pub struct MemoryIdStore {
    watermark: u64,
}

impl MemoryIdStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(watermark: u64) -> Self {
        Self { watermark }
    }
}

impl IdStoreModule for MemoryIdStore {
    fn load(&mut self) -> Result<u64, IdStoreError> {
        Ok(self.watermark)
    }

    fn store(&mut self, watermark: u64) -> Result<(), IdStoreError> {
        self.watermark = watermark;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::{IdStoreModule, MemoryIdStore};

    pub(crate) fn test_id_store_generic<S: IdStoreModule>(mut store: S) {
        assert_eq!(store.load().unwrap(), 0);
        store.store(1024).unwrap();
        assert_eq!(store.load().unwrap(), 1024);
        store.store(2048).unwrap();
        store.store(3072).unwrap();
        assert_eq!(store.load().unwrap(), 3072);
    }

    #[test]
    fn test_memory_id_store() {
        test_id_store_generic(MemoryIdStore::new());
        assert_eq!(MemoryIdStore::starting_at(7).load().unwrap(), 7);
    }
}
