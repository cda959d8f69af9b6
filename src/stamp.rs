//! Per-(file, index) indexing stamps.
//!
//! A file is current with respect to an index exactly when its stamp equals
//! the index creation stamp. Two sentinels cover the other states: no
//! indexed data at all, and data that exists but was invalidated pending a
//! reindex.

use std::sync::Arc;

use crate::codec::DataCodec;
use crate::storage::lmdb::LmdbMap;
use crate::storage::PersistentMap;
use crate::{FileId, Result};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

/// The file contributed nothing to the index.
pub const NO_INDEXED_DATA_STAMP: i64 = 0;
/// The file has stale data and is scheduled for reindexing.
pub const OUTDATED_STAMP: i64 = -1;

pub struct StampCodec;

impl DataCodec<i64> for StampCodec {
    fn encode(&self, stamp: &i64, out: &mut Vec<u8>) -> Result<()> {
        out.write_i64::<LittleEndian>(*stamp)?;
        Ok(())
    }

    fn decode(&self, bytes: &[u8]) -> Result<i64> {
        let mut input = bytes;
        input.read_i64::<LittleEndian>().map_err(Into::into)
    }
}

pub struct StampStore {
    map: Arc<LmdbMap<FileId, i64>>,
}

impl StampStore {
    pub fn new(map: LmdbMap<FileId, i64>) -> StampStore {
        StampStore { map: Arc::new(map) }
    }

    pub fn get(&self, file: FileId) -> Result<i64> {
        Ok(self.map.get(&file)?.unwrap_or(NO_INDEXED_DATA_STAMP))
    }

    pub fn set(&self, file: FileId, stamp: i64) -> Result<()> {
        self.map.put(&file, &stamp)
    }

    pub fn is_up_to_date(&self, file: FileId, creation_stamp: i64) -> Result<bool> {
        Ok(self.get(file)? == creation_stamp)
    }

    pub fn flush(&self) -> Result<()> {
        self.map.flush()
    }

    pub fn clear(&self) -> Result<()> {
        self.map.clear()
    }
}
