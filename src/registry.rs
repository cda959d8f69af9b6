//! Registration of index extensions and the per-index rebuild state
//! machine.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::UserError;
use crate::extension::{IndexExtension, IndexId, IndexKey, IndexValue};
use crate::index::{AnyIndex, UpdatableIndex};
use crate::store::{RegisterOutcome, VersionedStore};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildStatus {
    Ok,
    RequiresRebuild,
    RebuildInProgress,
}

/// Why an index lost its on-disk data; surfaced in the log stream so hosts
/// can notify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildCause {
    FormatChanged,
    Corrupted,
    Requested,
    StorageFailure,
}

struct StatusCell(AtomicU8);

impl StatusCell {
    fn new(status: RebuildStatus) -> StatusCell {
        StatusCell(AtomicU8::new(status as u8))
    }

    fn load(&self) -> RebuildStatus {
        match self.0.load(Ordering::SeqCst) {
            0 => RebuildStatus::Ok,
            1 => RebuildStatus::RequiresRebuild,
            _ => RebuildStatus::RebuildInProgress,
        }
    }

    fn store(&self, status: RebuildStatus) {
        self.0.store(status as u8, Ordering::SeqCst);
    }

    fn transition(&self, from: RebuildStatus, to: RebuildStatus) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

struct IndexEntry {
    index: Arc<dyn AnyIndex>,
    typed: Arc<dyn Any + Send + Sync>,
    status: StatusCell,
}

/// Owns one [`UpdatableIndex`] per registered extension, plus its atomic
/// rebuild status.
pub struct IndexRegistry {
    store: VersionedStore,
    map_size: usize,
    entries: RwLock<HashMap<&'static str, IndexEntry>>,
    mod_count: Arc<AtomicU64>,
}

impl IndexRegistry {
    pub(crate) fn new(store: VersionedStore, map_size: usize, mod_count: Arc<AtomicU64>) -> IndexRegistry {
        IndexRegistry { store, map_size, entries: RwLock::new(HashMap::new()), mod_count }
    }

    pub(crate) fn store(&self) -> &VersionedStore {
        &self.store
    }

    /// Registers one extension: reconciles the on-disk version, opens the
    /// storage (retrying once through a wipe on failure) and records the
    /// entry. An index whose storage cannot be opened at all starts in
    /// `RequiresRebuild` and is retried by the first query cycle.
    pub fn register<K: IndexKey, V: IndexValue>(
        &self,
        extension: impl IndexExtension<K, V>,
    ) -> Result<RegisterOutcome> {
        let extension: Arc<dyn IndexExtension<K, V>> = Arc::new(extension);
        let name = extension.name();
        let version = extension.version();

        if self.entries.read().unwrap().contains_key(name) {
            return Err(UserError::IndexAlreadyRegistered(name.to_string()).into());
        }

        let outcome = self.store.register_index(name, version)?;
        match outcome {
            RegisterOutcome::Rebuilt if self.store.corrupted_at_startup() => {
                tracing::warn!(index = name, "the index storage was corrupted, starting empty");
            }
            RegisterOutcome::Rebuilt => {
                tracing::warn!(index = name, version, "the index format has changed, starting empty");
            }
            RegisterOutcome::Fresh | RegisterOutcome::Reopened => (),
        }

        let index: Arc<UpdatableIndex<K, V>> = Arc::new(UpdatableIndex::create(
            extension,
            self.store.index_path(name),
            self.map_size,
            Arc::clone(&self.mod_count),
        ));

        let mut status = RebuildStatus::Ok;
        let creation_stamp = self.store.creation_stamp(name)?;
        if let Err(first) = index.open_storage(creation_stamp) {
            tracing::warn!(index = name, error = %first, "opening the index storage failed, wiping and retrying");
            self.store.wipe_index(name)?;
            let creation_stamp = self.store.write_version(name, version)?;
            if let Err(second) = index.open_storage(creation_stamp) {
                tracing::error!(index = name, error = %second, "opening the index storage failed twice");
                status = RebuildStatus::RequiresRebuild;
            }
        }

        let entry = IndexEntry {
            index: Arc::clone(&index) as Arc<dyn AnyIndex>,
            typed: index as Arc<dyn Any + Send + Sync>,
            status: StatusCell::new(status),
        };
        self.entries.write().unwrap().insert(name, entry);
        Ok(outcome)
    }

    pub(crate) fn typed_index<K: IndexKey, V: IndexValue>(
        &self,
        id: IndexId<K, V>,
    ) -> Result<Arc<UpdatableIndex<K, V>>> {
        let entries = self.entries.read().unwrap();
        let entry = entries
            .get(id.name())
            .ok_or_else(|| UserError::UnknownIndex(id.name().to_string()))?;
        Arc::clone(&entry.typed)
            .downcast::<UpdatableIndex<K, V>>()
            .map_err(|_| UserError::WrongIndexTypes(id.name().to_string()).into())
    }

    pub(crate) fn any_index(&self, name: &str) -> Result<Arc<dyn AnyIndex>> {
        let entries = self.entries.read().unwrap();
        let entry =
            entries.get(name).ok_or_else(|| UserError::UnknownIndex(name.to_string()))?;
        Ok(Arc::clone(&entry.index))
    }

    /// Snapshot of every registered index.
    pub(crate) fn indices(&self) -> Vec<Arc<dyn AnyIndex>> {
        self.entries.read().unwrap().values().map(|entry| Arc::clone(&entry.index)).collect()
    }

    pub fn rebuild_status(&self, name: &str) -> Option<RebuildStatus> {
        self.entries.read().unwrap().get(name).map(|entry| entry.status.load())
    }

    /// Marks an index as needing a drop-and-rebuild; the rebuild itself
    /// happens inside the next `check_rebuild`.
    pub fn request_rebuild(&self, name: &str, cause: RebuildCause) {
        let entries = self.entries.read().unwrap();
        if let Some(entry) = entries.get(name) {
            if entry.status.transition(RebuildStatus::Ok, RebuildStatus::RequiresRebuild) {
                tracing::warn!(index = name, ?cause, "index rebuild requested");
            }
        }
    }

    /// Converts a storage failure observed during a query into a rebuild
    /// request and immediately attempts the rebuild.
    pub(crate) fn schedule_rebuild(&self, name: &str, cause: &Error) {
        tracing::error!(index = name, error = %cause, "storage failure, scheduling an index rebuild");
        self.request_rebuild(name, RebuildCause::StorageFailure);
        if let Err(error) = self.check_rebuild(name) {
            tracing::warn!(index = name, error = %error, "index rebuild failed, will retry");
        }
    }

    /// Runs the pending rebuild of `name`, if any. Only one thread wins the
    /// `RequiresRebuild → RebuildInProgress` transition; the wipe happens on
    /// that thread, everyone else observes `RebuildInProgress` and fails
    /// their query with `Cancelled`.
    pub fn check_rebuild(&self, name: &str) -> Result<()> {
        let entries = self.entries.read().unwrap();
        let Some(entry) = entries.get(name) else { return Ok(()) };
        if !entry.status.transition(RebuildStatus::RequiresRebuild, RebuildStatus::RebuildInProgress)
        {
            return Ok(());
        }

        tracing::info!(index = name, "rebuilding the index from scratch");
        let result = (|| {
            entry.index.close_storage()?;
            self.store.wipe_index(name)?;
            let creation_stamp = self.store.write_version(name, entry.index.version())?;
            entry.index.open_storage(creation_stamp)
        })();

        match result {
            Ok(()) => {
                entry.status.store(RebuildStatus::Ok);
                Ok(())
            }
            Err(error) => {
                entry.status.store(RebuildStatus::RequiresRebuild);
                Err(error)
            }
        }
    }

    /// Fails with `Cancelled` while a rebuild is running, the contract of
    /// every query entry point.
    pub(crate) fn ensure_queryable(&self, name: &str) -> Result<()> {
        match self.rebuild_status(name) {
            Some(RebuildStatus::RebuildInProgress) => Err(Error::Cancelled),
            _ => Ok(()),
        }
    }

    pub fn flush_all(&self) -> Result<()> {
        for index in self.indices() {
            index.flush_storage()?;
        }
        Ok(())
    }

    /// Final flush and close of every index.
    pub(crate) fn dispose(&self) -> Result<()> {
        let mut first_error = None;
        for index in self.indices() {
            if let Err(error) = index.close_storage() {
                tracing::error!(index = index.name(), %error, "closing an index failed");
                first_error.get_or_insert(error);
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}
