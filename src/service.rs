//! The engine facade hosts embed.
//!
//! [`FileIndex`] owns the registry, the change collector, the
//! unsaved-document overlay and the flush daemon, and exposes the typed
//! query surface. Every content query runs the same pipeline first: wait
//! out dumb mode, drain pending invalidations, run any due rebuild, force
//! the scheduled reindexing for the requested scope and project the unsaved
//! documents, then read under the per-index read lock.

use std::cell::Cell;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::LocalKey;
use std::time::Duration;

use roaring::RoaringBitmap;

use crate::bus::EventBus;
use crate::collector::ChangedFilesCollector;
use crate::extension::{IndexExtension, IndexId, IndexKey, IndexValue};
use crate::flush::FlushDaemon;
use crate::host::{AlwaysSmart, Host};
use crate::index::AnyIndex;
use crate::registry::{IndexRegistry, RebuildCause, RebuildStatus};
use crate::scan::UnindexedFilesFinder;
use crate::store::{RegisterOutcome, VersionedStore};
use crate::unsaved::UnsavedDocuments;
use crate::vfs::{FileMeta, FileSystem, VfsEvent};
use crate::{Error, FileId, Result};

/// Content larger than this is not indexed unless the extension exempts the
/// file.
pub const DEFAULT_SIZE_LIMIT: u64 = 20 * 1024 * 1024;
pub const DEFAULT_MAP_SIZE: usize = 100 * 1024 * 1024;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct FileIndexOptions {
    /// Where the per-index directories live.
    pub index_root: PathBuf,
    /// Host configuration lives under this root; nothing in it is
    /// indexable.
    pub system_root: Option<PathBuf>,
    pub size_limit: u64,
    /// LMDB map size of each per-index environment.
    pub map_size: usize,
    pub flush_interval: Duration,
}

impl FileIndexOptions {
    pub fn new(index_root: impl Into<PathBuf>) -> FileIndexOptions {
        FileIndexOptions {
            index_root: index_root.into(),
            system_root: None,
            size_limit: DEFAULT_SIZE_LIMIT,
            map_size: DEFAULT_MAP_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }

    pub fn with_system_root(mut self, system_root: impl Into<PathBuf>) -> FileIndexOptions {
        self.system_root = Some(system_root.into());
        self
    }

    pub fn with_size_limit(mut self, size_limit: u64) -> FileIndexOptions {
        self.size_limit = size_limit;
        self
    }
}

/// The set of files a query is interested in; `everything` by default.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    files: Option<RoaringBitmap>,
}

impl Scope {
    pub fn everything() -> Scope {
        Scope::default()
    }

    pub fn restricted_to(files: RoaringBitmap) -> Scope {
        Scope { files: Some(files) }
    }

    pub fn contains(&self, file: FileId) -> bool {
        match &self.files {
            Some(files) => files.contains(file),
            None => true,
        }
    }

    fn intersects(&self, inputs: &RoaringBitmap) -> bool {
        match &self.files {
            Some(files) => files.intersection_len(inputs) > 0,
            None => !inputs.is_empty(),
        }
    }

    fn clamp(&self, set: RoaringBitmap) -> RoaringBitmap {
        match &self.files {
            Some(files) => set & files,
            None => set,
        }
    }
}

thread_local! {
    static ENSURE_DEPTH: Cell<u32> = const { Cell::new(0) };
    static UP_TO_DATE_DISABLED: Cell<u32> = const { Cell::new(0) };
    static NO_SMART_WAIT: Cell<u32> = const { Cell::new(0) };
}

struct DepthGuard(&'static LocalKey<Cell<u32>>);

impl DepthGuard {
    fn enter(key: &'static LocalKey<Cell<u32>>) -> DepthGuard {
        key.with(|depth| depth.set(depth.get() + 1));
        DepthGuard(key)
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        self.0.with(|depth| depth.set(depth.get() - 1));
    }
}

/// Runs `f` with the up-to-date-on-read pipeline short-circuited on this
/// thread; reads observe whatever state the indices are in.
pub fn with_up_to_date_checks_disabled<R>(f: impl FnOnce() -> R) -> R {
    let _guard = DepthGuard::enter(&UP_TO_DATE_DISABLED);
    f()
}

/// Runs `f` failing queries with [`Error::NotReady`] instead of blocking
/// when the host is in dumb mode.
pub fn without_waiting_for_smart_mode<R>(f: impl FnOnce() -> R) -> R {
    let _guard = DepthGuard::enter(&NO_SMART_WAIT);
    f()
}

pub struct FileIndexBuilder {
    registry: Arc<IndexRegistry>,
    fs: Arc<dyn FileSystem>,
    host: Arc<dyn Host>,
    bus: Arc<EventBus>,
    mod_count: Arc<AtomicU64>,
    options: FileIndexOptions,
}

impl FileIndexBuilder {
    pub fn with_host(mut self, host: Arc<dyn Host>) -> FileIndexBuilder {
        self.host = host;
        self
    }

    /// Registers one extension; see [`IndexRegistry::register`].
    pub fn register<K: IndexKey, V: IndexValue>(
        &mut self,
        extension: impl IndexExtension<K, V>,
    ) -> Result<RegisterOutcome> {
        self.registry.register(extension)
    }

    pub fn build(self) -> Result<FileIndex> {
        let FileIndexBuilder { registry, fs, host, bus, mod_count, options } = self;
        registry.store().finish_registration()?;

        let collector = Arc::new(ChangedFilesCollector::new(
            Arc::clone(&registry),
            fs,
            Arc::clone(&host),
            options.system_root.clone(),
            options.size_limit,
        ));
        let vfs_collector = Arc::clone(&collector);
        bus.subscribe::<VfsEvent, _>(move |event| {
            if let Err(error) = vfs_collector.on_event(event) {
                tracing::error!(%error, "handling a filesystem event failed");
            }
        });

        let unsaved = Arc::new(UnsavedDocuments::new(Arc::clone(&bus)));
        let flush_daemon = FlushDaemon::start(
            Arc::clone(&registry),
            Arc::clone(&host),
            Arc::clone(&mod_count),
            options.flush_interval,
        )?;

        Ok(FileIndex {
            registry,
            collector,
            unsaved,
            bus,
            host,
            mod_count,
            flush_daemon: Mutex::new(Some(flush_daemon)),
        })
    }
}

pub struct FileIndex {
    registry: Arc<IndexRegistry>,
    collector: Arc<ChangedFilesCollector>,
    unsaved: Arc<UnsavedDocuments>,
    bus: Arc<EventBus>,
    host: Arc<dyn Host>,
    mod_count: Arc<AtomicU64>,
    flush_daemon: Mutex<Option<FlushDaemon>>,
}

impl FileIndex {
    pub fn builder(
        options: FileIndexOptions,
        fs: Arc<dyn FileSystem>,
    ) -> Result<FileIndexBuilder> {
        let store = VersionedStore::open(options.index_root.clone())?;
        let mod_count = Arc::new(AtomicU64::new(0));
        let registry =
            Arc::new(IndexRegistry::new(store, options.map_size, Arc::clone(&mod_count)));
        Ok(FileIndexBuilder {
            registry,
            fs,
            host: Arc::new(AlwaysSmart),
            bus: Arc::new(EventBus::new()),
            mod_count,
            options,
        })
    }

    /// The host-facing entry point for filesystem change notifications.
    /// Subscribers run synchronously, so content-less indices are current
    /// when this returns.
    pub fn notify(&self, event: VfsEvent) {
        self.bus.publish(&event);
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn unsaved_documents(&self) -> &UnsavedDocuments {
        &self.unsaved
    }

    pub fn unindexed_files_finder(&self) -> UnindexedFilesFinder<'_> {
        UnindexedFilesFinder::new(&self.registry)
    }

    /// Bumped by every successful index update; cheap change detection for
    /// hosts.
    pub fn modification_count(&self) -> u64 {
        self.mod_count.load(Ordering::Relaxed)
    }

    pub fn rebuild_status(&self, name: &str) -> Option<RebuildStatus> {
        self.registry.rebuild_status(name)
    }

    pub fn request_rebuild<K: IndexKey, V: IndexValue>(&self, id: IndexId<K, V>) {
        self.registry.request_rebuild(id.name(), RebuildCause::Requested);
    }

    pub fn request_reindex(&self, file: FileId) -> Result<()> {
        self.collector.request_reindex(file)
    }

    pub fn files_to_update(&self) -> Vec<FileId> {
        self.collector.files_to_update()
    }

    pub fn remove_indexable_set(&self, filter: &dyn Fn(&FileMeta) -> bool) -> Result<()> {
        self.collector.remove_indexable_set(filter)
    }

    pub fn flush(&self) -> Result<()> {
        self.registry.flush_all()
    }

    /// Stops the flush daemon, flushes and closes every index and marks the
    /// shutdown clean. Failures are logged, rethrown and leave the
    /// work-in-progress marker armed for the next startup.
    pub fn dispose(&self) -> Result<()> {
        self.flush_daemon.lock().unwrap().take();
        self.registry.dispose()?;
        self.registry.store().mark_clean_shutdown()
    }

    fn ensure_up_to_date(
        &self,
        name: &str,
        scope: &Scope,
        restricted: Option<FileId>,
    ) -> Result<()> {
        let index = self.registry.any_index(name)?;
        // Content-less indices are updated synchronously with the VFS
        // events, nothing to catch up on.
        if !index.depends_on_file_content() {
            return Ok(());
        }

        if self.host.is_dumb() {
            if NO_SMART_WAIT.with(|depth| depth.get()) > 0 {
                return Err(Error::NotReady);
            }
            self.host.wait_for_smart();
        }

        // An indexer querying back into the engine must not recurse into
        // the pipeline.
        if ENSURE_DEPTH.with(|depth| depth.get()) > 0 {
            return Ok(());
        }
        let _guard = DepthGuard::enter(&ENSURE_DEPTH);

        self.collector.ensure_all_invalidate_tasks_completed()?;

        if UP_TO_DATE_DISABLED.with(|depth| depth.get()) == 0 {
            self.registry.check_rebuild(name)?;
            self.registry.ensure_queryable(name)?;
            match &scope.files {
                Some(files) => {
                    let files = files.clone();
                    self.collector.force_update(
                        Some(&|meta: &FileMeta| files.contains(meta.id)),
                        restricted,
                        false,
                    )?;
                }
                None => self.collector.force_update(None, restricted, false)?,
            }
            self.unsaved.apply_to(index.as_ref(), restricted)?;
        }
        Ok(())
    }

    /// Runs a query, converting storage failures into a rebuild request and
    /// a benign empty result.
    fn query<T>(
        &self,
        name: &str,
        empty: impl FnOnce() -> T,
        run: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        match run() {
            Ok(value) => Ok(value),
            Err(error) if error.is_storage_defect() => {
                self.registry.schedule_rebuild(name, &error);
                Ok(empty())
            }
            Err(error) => Err(error),
        }
    }

    pub fn get_all_keys<K: IndexKey, V: IndexValue>(
        &self,
        id: IndexId<K, V>,
        scope: &Scope,
    ) -> Result<Vec<K>> {
        self.query(id.name(), Vec::new, || {
            self.ensure_up_to_date(id.name(), scope, None)?;
            let index = self.registry.typed_index(id)?;
            let mut keys = Vec::new();
            index.process_all_keys(&mut |key| {
                keys.push(key.clone());
                true
            })?;
            Ok(keys)
        })
    }

    pub fn get_values<K: IndexKey, V: IndexValue>(
        &self,
        id: IndexId<K, V>,
        key: &K,
        scope: &Scope,
    ) -> Result<Vec<V>> {
        self.query(id.name(), Vec::new, || {
            self.ensure_up_to_date(id.name(), scope, None)?;
            let index = self.registry.typed_index(id)?;
            Ok(match index.data_for(key)? {
                Some(container) => container
                    .iter()
                    .filter(|(_, inputs)| scope.intersects(inputs))
                    .map(|(value, _)| value.clone())
                    .collect(),
                None => Vec::new(),
            })
        })
    }

    pub fn get_containing_files<K: IndexKey, V: IndexValue>(
        &self,
        id: IndexId<K, V>,
        key: &K,
        scope: &Scope,
    ) -> Result<RoaringBitmap> {
        self.query(id.name(), RoaringBitmap::new, || {
            self.ensure_up_to_date(id.name(), scope, None)?;
            let index = self.registry.typed_index(id)?;
            Ok(match index.data_for(key)? {
                Some(container) => scope.clamp(container.all_inputs()),
                None => RoaringBitmap::new(),
            })
        })
    }

    /// Visits every (file, value) association of `key`; `false` from the
    /// visitor stops the walk and is returned.
    pub fn process_values<K: IndexKey, V: IndexValue>(
        &self,
        id: IndexId<K, V>,
        key: &K,
        restricted: Option<FileId>,
        scope: &Scope,
        visitor: &mut dyn FnMut(FileId, &V) -> bool,
    ) -> Result<bool> {
        self.query(id.name(), || true, || {
            self.ensure_up_to_date(id.name(), scope, restricted)?;
            let index = self.registry.typed_index(id)?;
            let Some(container) = index.data_for(key)? else { return Ok(true) };
            for (value, inputs) in container.iter() {
                for file in inputs {
                    if restricted.is_some_and(|only| only != file) || !scope.contains(file) {
                        continue;
                    }
                    if !visitor(file, value) {
                        return Ok(false);
                    }
                }
            }
            Ok(true)
        })
    }

    /// Visits the files containing all of `keys`, intersecting the per-key
    /// file sets smallest-first.
    pub fn process_files_containing_all_keys<K: IndexKey, V: IndexValue>(
        &self,
        id: IndexId<K, V>,
        keys: &[K],
        scope: &Scope,
        value_filter: Option<&dyn Fn(&V) -> bool>,
        visitor: &mut dyn FnMut(FileId) -> bool,
    ) -> Result<bool> {
        self.query(id.name(), || true, || {
            self.ensure_up_to_date(id.name(), scope, None)?;
            let index = self.registry.typed_index(id)?;

            let mut per_key = Vec::with_capacity(keys.len());
            for key in keys {
                let inputs = match index.data_for(key)? {
                    Some(container) => container
                        .iter()
                        .filter(|(value, _)| value_filter.is_none_or(|accept| accept(*value)))
                        .fold(RoaringBitmap::new(), |acc, (_, inputs)| acc | inputs),
                    None => RoaringBitmap::new(),
                };
                if inputs.is_empty() {
                    return Ok(true);
                }
                per_key.push(inputs);
            }

            per_key.sort_by_key(|inputs| inputs.len());
            let mut per_key = per_key.into_iter();
            let Some(mut result) = per_key.next() else { return Ok(true) };
            for inputs in per_key {
                result &= inputs;
                if result.is_empty() {
                    return Ok(true);
                }
            }

            for file in scope.clamp(result) {
                if !visitor(file) {
                    return Ok(false);
                }
            }
            Ok(true)
        })
    }
}

impl Drop for FileIndex {
    fn drop(&mut self) {
        // Stop flushing; a host that wants a clean shutdown calls
        // `dispose` explicitly.
        self.flush_daemon.lock().unwrap().take();
    }
}
