//! LMDB-backed persistent maps.
//!
//! Each index owns one environment holding three named databases: the
//! forward `storage` map, the reverse `input-to-keys` map and the per-file
//! `stamps`. A map fronts its database with a write-back dirty map plus an
//! LRU read cache; `flush` drains the dirty map in a single write
//! transaction, so a crash between flushes loses buffered writes but never
//! tears a record.

use std::collections::HashMap;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::{Arc, Mutex};

use heed::types::Bytes;
use heed::{Database, Env, EnvClosingEvent, EnvOpenOptions};
use lru::LruCache;

use crate::codec::{DataCodec, KeyCodec};
use crate::error::InternalError;
use crate::storage::PersistentMap;
use crate::Result;

pub mod db_name {
    pub const STORAGE: &str = "storage";
    pub const INPUT_TO_KEYS: &str = "input-to-keys";
    pub const STAMPS: &str = "stamps";
}

const NUMBER_OF_DBS: u32 = 3;

/// The environment of one index and its named databases.
#[derive(Clone)]
pub struct IndexEnv {
    pub(crate) env: Env,
    pub(crate) storage: Database<Bytes, Bytes>,
    pub(crate) input_to_keys: Database<Bytes, Bytes>,
    pub(crate) stamps: Database<Bytes, Bytes>,
}

impl IndexEnv {
    pub fn open(path: &Path, map_size: usize) -> Result<IndexEnv> {
        std::fs::create_dir_all(path)?;
        let mut options = EnvOpenOptions::new();
        options.map_size(map_size);
        options.max_dbs(NUMBER_OF_DBS);
        let env = unsafe { options.open(path) }.map_err(|error| InternalError::OpenFailed {
            path: path.to_path_buf(),
            error,
        })?;

        let mut wtxn = env.write_txn()?;
        let storage = env.create_database(&mut wtxn, Some(db_name::STORAGE))?;
        let input_to_keys = env.create_database(&mut wtxn, Some(db_name::INPUT_TO_KEYS))?;
        let stamps = env.create_database(&mut wtxn, Some(db_name::STAMPS))?;
        wtxn.commit()?;

        Ok(IndexEnv { env, storage, input_to_keys, stamps })
    }

    /// Starts closing the environment. The returned event fires once every
    /// clone of the `Env` has been dropped.
    pub fn prepare_for_closing(self) -> EnvClosingEvent {
        self.env.prepare_for_closing()
    }
}

struct MapCache<K, V> {
    dirty: HashMap<K, Option<V>>,
    read: LruCache<K, Option<V>>,
}

/// One named database with a write-back cache, seen through the codecs of
/// the index it belongs to.
pub struct LmdbMap<K, V> {
    env: Env,
    db: Database<Bytes, Bytes>,
    db_name: &'static str,
    keys: Arc<dyn KeyCodec<K>>,
    records: Arc<dyn DataCodec<V>>,
    cache: Mutex<MapCache<K, V>>,
}

impl<K, V> LmdbMap<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    pub fn new(
        env: Env,
        db: Database<Bytes, Bytes>,
        db_name: &'static str,
        keys: Arc<dyn KeyCodec<K>>,
        records: Arc<dyn DataCodec<V>>,
        cache_size: usize,
    ) -> LmdbMap<K, V> {
        let capacity = NonZeroUsize::new(cache_size.max(1)).unwrap();
        LmdbMap {
            env,
            db,
            db_name,
            keys,
            records,
            cache: Mutex::new(MapCache { dirty: HashMap::new(), read: LruCache::new(capacity) }),
        }
    }

    fn encode_key(&self, key: &K) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        self.keys.write(key, &mut bytes)?;
        Ok(bytes)
    }

    fn read_from_db(&self, key: &K) -> Result<Option<V>> {
        let key_bytes = self.encode_key(key)?;
        let rtxn = self.env.read_txn()?;
        match self.db.get(&rtxn, &key_bytes)? {
            Some(bytes) => Ok(Some(self.records.decode(bytes)?)),
            None => Ok(None),
        }
    }
}

impl<K, V> PersistentMap<K, V> for LmdbMap<K, V>
where
    K: Clone + Eq + Hash + Send + Sync,
    V: Clone + Send + Sync,
{
    fn get(&self, key: &K) -> Result<Option<V>> {
        let mut cache = self.cache.lock().unwrap();
        if let Some(value) = cache.dirty.get(key) {
            return Ok(value.clone());
        }
        if let Some(value) = cache.read.get(key) {
            return Ok(value.clone());
        }
        let value = self.read_from_db(key)?;
        cache.read.put(key.clone(), value.clone());
        Ok(value)
    }

    fn put(&self, key: &K, value: &V) -> Result<()> {
        let mut cache = self.cache.lock().unwrap();
        cache.read.pop(key);
        cache.dirty.insert(key.clone(), Some(value.clone()));
        Ok(())
    }

    fn remove(&self, key: &K) -> Result<()> {
        let mut cache = self.cache.lock().unwrap();
        cache.read.pop(key);
        cache.dirty.insert(key.clone(), None);
        Ok(())
    }

    fn for_each_key(&self, visitor: &mut dyn FnMut(&K) -> bool) -> Result<bool> {
        let cache = self.cache.lock().unwrap();
        let rtxn = self.env.read_txn()?;

        for entry in self.db.iter(&rtxn)? {
            let (key_bytes, _) = entry?;
            let key = self.keys.read(&mut &key_bytes[..])?;
            if let Some(None) = cache.dirty.get(&key) {
                continue; // buffered deletion
            }
            if !visitor(&key) {
                return Ok(false);
            }
        }

        // Buffered insertions that are not on disk yet.
        for (key, value) in cache.dirty.iter() {
            if value.is_none() {
                continue;
            }
            let key_bytes = self.encode_key(key)?;
            if self.db.get(&rtxn, &key_bytes)?.is_none() && !visitor(key) {
                return Ok(false);
            }
        }

        Ok(true)
    }

    fn flush(&self) -> Result<()> {
        let mut cache = self.cache.lock().unwrap();
        if cache.dirty.is_empty() {
            return Ok(());
        }

        let mut wtxn = self.env.write_txn()?;
        for (key, value) in cache.dirty.iter() {
            let key_bytes = self.encode_key(key)?;
            match value {
                Some(value) => {
                    let mut record = Vec::new();
                    self.records.encode(value, &mut record)?;
                    self.db.put(&mut wtxn, &key_bytes, &record).map_err(|error| {
                        InternalError::StorePut { database_name: self.db_name, error }
                    })?;
                }
                None => {
                    self.db.delete(&mut wtxn, &key_bytes).map_err(|error| {
                        InternalError::StoreDeletion { database_name: self.db_name, error }
                    })?;
                }
            }
        }
        wtxn.commit()?;
        cache.dirty.clear();
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut cache = self.cache.lock().unwrap();
        cache.dirty.clear();
        cache.read.clear();
        let mut wtxn = self.env.write_txn()?;
        self.db.clear(&mut wtxn)?;
        wtxn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use big_s::S;
    use tempfile::TempDir;

    use super::*;
    use crate::codec::{StrCodec, ValueCodec};

    struct StrRecordCodec;

    impl DataCodec<String> for StrRecordCodec {
        fn encode(&self, value: &String, out: &mut Vec<u8>) -> Result<()> {
            ValueCodec::write(&StrCodec, value, out)
        }

        fn decode(&self, bytes: &[u8]) -> Result<String> {
            ValueCodec::read(&StrCodec, &mut &bytes[..])
        }
    }

    fn map_in(dir: &TempDir) -> LmdbMap<String, String> {
        let env = IndexEnv::open(dir.path(), 10 * 1024 * 1024).unwrap();
        LmdbMap::new(
            env.env.clone(),
            env.storage,
            db_name::STORAGE,
            Arc::new(StrCodec),
            Arc::new(StrRecordCodec),
            16,
        )
    }

    #[test]
    fn buffered_writes_are_visible_before_flush() {
        let dir = TempDir::new().unwrap();
        let map = map_in(&dir);

        map.put(&S("fennec"), &S("fox")).unwrap();
        assert_eq!(map.get(&S("fennec")).unwrap(), Some(S("fox")));

        map.remove(&S("fennec")).unwrap();
        assert_eq!(map.get(&S("fennec")).unwrap(), None);
    }

    #[test]
    fn flush_makes_writes_durable_and_deletions_stick() {
        let dir = TempDir::new().unwrap();
        let map = map_in(&dir);

        map.put(&S("kefir"), &S("dog")).unwrap();
        map.put(&S("echo"), &S("whale")).unwrap();
        map.flush().unwrap();
        map.remove(&S("echo")).unwrap();
        map.flush().unwrap();

        assert_eq!(map.read_from_db(&S("kefir")).unwrap(), Some(S("dog")));
        assert_eq!(map.read_from_db(&S("echo")).unwrap(), None);
    }

    #[test]
    fn for_each_key_merges_dirty_and_durable_entries() {
        let dir = TempDir::new().unwrap();
        let map = map_in(&dir);

        map.put(&S("on-disk"), &S("1")).unwrap();
        map.put(&S("gone"), &S("3")).unwrap();
        map.flush().unwrap();
        map.put(&S("buffered"), &S("2")).unwrap();
        map.remove(&S("gone")).unwrap();

        let mut keys = Vec::new();
        assert!(map
            .for_each_key(&mut |key| {
                keys.push(key.clone());
                true
            })
            .unwrap());
        keys.sort();
        assert_eq!(keys, vec![S("buffered"), S("on-disk")]);
    }
}
