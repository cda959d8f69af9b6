//! One updatable index: the forward key→values map, the reverse
//! file→keys map and the per-file stamps, all behind a single
//! readers–writer lock.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::container::{ValueContainer, ValueContainerCodec};
use crate::error::InternalError;
use crate::extension::{IndexExtension, IndexKey, IndexValue, IndexedFile};
use crate::input_to_keys::{InputToKeys, KeySetCodec};
use crate::overlay::{MemoryOverlay, OverlayEvent};
use crate::stamp::{StampCodec, StampStore, NO_INDEXED_DATA_STAMP, OUTDATED_STAMP};
use crate::storage::lmdb::{db_name, IndexEnv, LmdbMap};
use crate::storage::PersistentMap;
use crate::vfs::FileMeta;
use crate::{codec, FastSet8, FileId, Result};

struct IndexMaps<K: IndexKey, V: IndexValue> {
    env: IndexEnv,
    storage: Arc<MemoryOverlay<K, ValueContainer<V>>>,
    input_to_keys: Arc<InputToKeys<K>>,
    stamps: StampStore,
    creation_stamp: i64,
}

impl<K: IndexKey, V: IndexValue> IndexMaps<K, V> {
    fn open(
        path: &PathBuf,
        map_size: usize,
        creation_stamp: i64,
        extension: &Arc<dyn IndexExtension<K, V>>,
    ) -> Result<IndexMaps<K, V>> {
        let env = IndexEnv::open(path, map_size)?;
        let cache_size = extension.cache_size();

        let storage = LmdbMap::new(
            env.env.clone(),
            env.storage,
            db_name::STORAGE,
            extension.key_codec(),
            Arc::new(ValueContainerCodec::new(extension.value_codec())),
            cache_size,
        );
        let storage = Arc::new(MemoryOverlay::new(Arc::new(storage)));

        let input_to_keys = LmdbMap::new(
            env.env.clone(),
            env.input_to_keys,
            db_name::INPUT_TO_KEYS,
            Arc::new(codec::U32Codec),
            Arc::new(KeySetCodec::new(extension.key_codec())),
            cache_size,
        );
        let input_to_keys = Arc::new(InputToKeys::new(MemoryOverlay::new(Arc::new(input_to_keys))));

        // The reverse map follows every buffering transition of the forward
        // map, which keeps the lockstep invariant across modes.
        let reverse = Arc::clone(&input_to_keys);
        storage.subscribe(move |event| match event {
            OverlayEvent::BufferingStateChanged(enabled) => reverse.set_buffering(enabled),
            OverlayEvent::MemoryStorageCleared => reverse.drop_memory_changes(),
        });

        let stamps = StampStore::new(LmdbMap::new(
            env.env.clone(),
            env.stamps,
            db_name::STAMPS,
            Arc::new(codec::U32Codec),
            Arc::new(StampCodec),
            cache_size,
        ));

        Ok(IndexMaps { env, storage, input_to_keys, stamps, creation_stamp })
    }

    fn flush(&self) -> Result<()> {
        self.storage.flush()?;
        self.input_to_keys.flush()?;
        self.stamps.flush()
    }

    fn close(self) {
        let IndexMaps { env, storage, input_to_keys, stamps, .. } = self;
        drop(storage);
        drop(input_to_keys);
        drop(stamps);
        env.prepare_for_closing().wait();
    }
}

pub struct UpdatableIndex<K: IndexKey, V: IndexValue> {
    extension: Arc<dyn IndexExtension<K, V>>,
    path: PathBuf,
    map_size: usize,
    inner: RwLock<Option<IndexMaps<K, V>>>,
    mod_count: Arc<AtomicU64>,
}

impl<K: IndexKey, V: IndexValue> UpdatableIndex<K, V> {
    pub(crate) fn create(
        extension: Arc<dyn IndexExtension<K, V>>,
        path: PathBuf,
        map_size: usize,
        mod_count: Arc<AtomicU64>,
    ) -> UpdatableIndex<K, V> {
        UpdatableIndex { extension, path, map_size, inner: RwLock::new(None), mod_count }
    }

    /// Everything stored under `key`, observed under the read lock.
    pub fn data_for(&self, key: &K) -> Result<Option<ValueContainer<V>>> {
        let inner = self.inner.read().unwrap();
        let maps = inner.as_ref().ok_or(InternalError::StorageClosed)?;
        maps.storage.get(key)
    }

    /// Visits every key under the read lock; buffered keys included.
    pub fn process_all_keys(&self, visitor: &mut dyn FnMut(&K) -> bool) -> Result<bool> {
        let inner = self.inner.read().unwrap();
        let maps = inner.as_ref().ok_or(InternalError::StorageClosed)?;
        maps.storage.for_each_key(visitor)
    }

    /// The keys currently recorded for `file` in the reverse map.
    pub fn keys_of(&self, file: FileId) -> Result<FastSet8<K>> {
        let inner = self.inner.read().unwrap();
        let maps = inner.as_ref().ok_or(InternalError::StorageClosed)?;
        maps.input_to_keys.keys_for(file)
    }

    /// Replaces everything recorded for `file` with what the extension
    /// extracts from `input`; `None` erases the file from the index. Both
    /// the forward and the reverse map change inside the same write-lock
    /// section.
    pub(crate) fn update(&self, file: FileId, input: Option<&IndexedFile<'_>>) -> Result<()> {
        let new_data = match input {
            Some(input) => self.extension.index(input),
            None => Default::default(),
        };

        let inner = self.inner.write().unwrap();
        let maps = inner.as_ref().ok_or(InternalError::StorageClosed)?;

        // A persistent update supersedes any transient editor overlay; the
        // overlay is rebuilt from the still-unsaved documents on the next
        // query.
        if maps.storage.is_buffering() {
            maps.storage.set_buffering(false);
        }

        self.apply(maps, file, new_data)?;

        if self.extension.depends_on_file_content() {
            let stamp =
                if input.is_some() { maps.creation_stamp } else { NO_INDEXED_DATA_STAMP };
            maps.stamps.set(file, stamp)?;
        }

        self.mod_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Indexes unsaved editor text into the buffering overlay. The caller
    /// must have switched the index into buffering mode first.
    pub(crate) fn update_buffered(&self, file: FileId, input: &IndexedFile<'_>) -> Result<()> {
        let new_data = self.extension.index(input);
        let inner = self.inner.write().unwrap();
        let maps = inner.as_ref().ok_or(InternalError::StorageClosed)?;
        debug_assert!(maps.storage.is_buffering());
        self.apply(maps, file, new_data)
    }

    fn apply(
        &self,
        maps: &IndexMaps<K, V>,
        file: FileId,
        new_data: std::collections::HashMap<K, V>,
    ) -> Result<()> {
        let old_keys = maps.input_to_keys.keys_for(file)?;

        // Keys the file no longer contributes to.
        for key in old_keys.iter().filter(|key| !new_data.contains_key(*key)) {
            if let Some(mut container) = maps.storage.get(key)? {
                if container.remove_input(file) {
                    if container.is_empty() {
                        maps.storage.remove(key)?;
                    } else {
                        maps.storage.put(key, &container)?;
                    }
                }
            }
        }

        // New and surviving keys; the value for a surviving key may differ.
        let mut new_keys = FastSet8::default();
        for (key, value) in &new_data {
            let mut container = maps.storage.get(key)?.unwrap_or_default();
            container.remove_input(file);
            container.add(file, value.clone());
            maps.storage.put(key, &container)?;
            new_keys.insert(key.clone());
        }

        maps.input_to_keys.replace(file, &new_keys)
    }

    pub(crate) fn set_buffering(&self, enabled: bool) {
        let inner = self.inner.write().unwrap();
        if let Some(maps) = inner.as_ref() {
            maps.storage.set_buffering(enabled);
        }
    }

    pub fn flush(&self) -> Result<()> {
        let inner = self.inner.read().unwrap();
        match inner.as_ref() {
            Some(maps) => maps.flush(),
            None => Ok(()),
        }
    }

    /// Drops every entry of every map, keeping the index open.
    pub fn clear(&self) -> Result<()> {
        let inner = self.inner.write().unwrap();
        let maps = inner.as_ref().ok_or(InternalError::StorageClosed)?;
        maps.storage.clear()?;
        maps.input_to_keys.clear()?;
        maps.stamps.clear()?;
        self.mod_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// The type-erased surface the registry, collector and scanner work
/// against; typed queries reach the concrete index by downcast.
pub(crate) trait AnyIndex: Send + Sync {
    fn name(&self) -> &'static str;
    fn version(&self) -> i32;
    fn depends_on_file_content(&self) -> bool;
    fn accepts(&self, file: &FileMeta) -> bool;
    fn ignores_size_limit(&self, file: &FileMeta) -> bool;
    fn creation_stamp(&self) -> Result<i64>;
    fn stamp(&self, file: FileId) -> Result<i64>;
    fn mark_outdated(&self, file: FileId) -> Result<()>;
    fn update_file(&self, file: FileId, input: Option<&IndexedFile<'_>>) -> Result<()>;
    fn update_file_buffered(&self, file: FileId, input: &IndexedFile<'_>) -> Result<()>;
    fn set_buffering_mode(&self, enabled: bool);
    fn flush_storage(&self) -> Result<()>;
    fn clear_storage(&self) -> Result<()>;
    fn open_storage(&self, creation_stamp: i64) -> Result<()>;
    fn close_storage(&self) -> Result<()>;
}

impl<K: IndexKey, V: IndexValue> AnyIndex for UpdatableIndex<K, V> {
    fn name(&self) -> &'static str {
        self.extension.name()
    }

    fn version(&self) -> i32 {
        self.extension.version()
    }

    fn depends_on_file_content(&self) -> bool {
        self.extension.depends_on_file_content()
    }

    fn accepts(&self, file: &FileMeta) -> bool {
        self.extension.accepts(file)
    }

    fn ignores_size_limit(&self, file: &FileMeta) -> bool {
        self.extension.ignores_size_limit(file)
    }

    fn creation_stamp(&self) -> Result<i64> {
        let inner = self.inner.read().unwrap();
        let maps = inner.as_ref().ok_or(InternalError::StorageClosed)?;
        Ok(maps.creation_stamp)
    }

    fn stamp(&self, file: FileId) -> Result<i64> {
        let inner = self.inner.read().unwrap();
        let maps = inner.as_ref().ok_or(InternalError::StorageClosed)?;
        maps.stamps.get(file)
    }

    fn mark_outdated(&self, file: FileId) -> Result<()> {
        let inner = self.inner.read().unwrap();
        let maps = inner.as_ref().ok_or(InternalError::StorageClosed)?;
        maps.stamps.set(file, OUTDATED_STAMP)
    }

    fn update_file(&self, file: FileId, input: Option<&IndexedFile<'_>>) -> Result<()> {
        self.update(file, input)
    }

    fn update_file_buffered(&self, file: FileId, input: &IndexedFile<'_>) -> Result<()> {
        self.update_buffered(file, input)
    }

    fn set_buffering_mode(&self, enabled: bool) {
        self.set_buffering(enabled);
    }

    fn flush_storage(&self) -> Result<()> {
        self.flush()
    }

    fn clear_storage(&self) -> Result<()> {
        self.clear()
    }

    fn open_storage(&self, creation_stamp: i64) -> Result<()> {
        let maps = IndexMaps::open(&self.path, self.map_size, creation_stamp, &self.extension)?;
        let mut inner = self.inner.write().unwrap();
        if let Some(previous) = inner.take() {
            previous.close();
        }
        *inner = Some(maps);
        Ok(())
    }

    fn close_storage(&self) -> Result<()> {
        let maps = { self.inner.write().unwrap().take() };
        if let Some(maps) = maps {
            maps.flush()?;
            maps.close();
        }
        Ok(())
    }
}
