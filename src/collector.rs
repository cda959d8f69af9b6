//! Turns VFS events into eager content-less updates, deferred reindexing
//! work and queued invalidations.

use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use crate::extension::IndexedFile;
use crate::host::Host;
use crate::index::AnyIndex;
use crate::registry::IndexRegistry;
use crate::vfs::{FileMeta, FileProperty, FileSystem, VfsEvent};
use crate::{FastMap8, FileId, Result};

/// An erase-from-index order for one file, queued until somebody needs the
/// affected indices to be current.
struct InvalidationTask {
    file: FileId,
    affected: Vec<&'static str>,
}

/// Callers of `force_update` wait in slices this long so cancellation stays
/// responsive.
const FORCE_UPDATE_WAIT_SLICE: Duration = Duration::from_millis(500);

pub struct ChangedFilesCollector {
    registry: Arc<IndexRegistry>,
    fs: Arc<dyn FileSystem>,
    host: Arc<dyn Host>,
    /// Files under this root are host configuration, never indexable.
    system_root: Option<PathBuf>,
    size_limit: u64,
    files_to_update: Mutex<FastMap8<FileId, FileMeta>>,
    invalidations: Sender<InvalidationTask>,
    pending_invalidations: Receiver<InvalidationTask>,
    /// Serializes queue draining; the queue itself is MPSC-safe.
    drain_lock: Mutex<()>,
    in_flight: Mutex<usize>,
    batch_done: Condvar,
}

impl ChangedFilesCollector {
    pub(crate) fn new(
        registry: Arc<IndexRegistry>,
        fs: Arc<dyn FileSystem>,
        host: Arc<dyn Host>,
        system_root: Option<PathBuf>,
        size_limit: u64,
    ) -> ChangedFilesCollector {
        let (invalidations, pending_invalidations) = crossbeam_channel::unbounded();
        ChangedFilesCollector {
            registry,
            fs,
            host,
            system_root,
            size_limit,
            files_to_update: Mutex::default(),
            invalidations,
            pending_invalidations,
            drain_lock: Mutex::new(()),
            in_flight: Mutex::new(0),
            batch_done: Condvar::new(),
        }
    }

    /// The VFS listener entry point.
    pub fn on_event(&self, event: &VfsEvent) -> Result<()> {
        match *event {
            VfsEvent::BeforeContentChange { file } => self.invalidate_indices(file, true),
            VfsEvent::ContentChanged { file }
            | VfsEvent::Created { file }
            | VfsEvent::Copied { file } => self.mark_dirty(file),
            VfsEvent::BeforeDeletion { file } => self.invalidate_indices(file, false),
            VfsEvent::BeforePropertyChange { file, property: FileProperty::Name } => {
                // A rename can change the file type, which changes which
                // indices accept the file.
                match self.fs.file(file) {
                    Some(meta) if meta.is_directory => Ok(()),
                    _ => self.invalidate_indices(file, true),
                }
            }
            VfsEvent::PropertyChanged { file, property: FileProperty::Name } => {
                self.mark_dirty(file)
            }
            VfsEvent::BeforePropertyChange { .. } | VfsEvent::PropertyChanged { .. } => Ok(()),
        }
    }

    fn is_under_system_root(&self, meta: &FileMeta) -> bool {
        self.system_root.as_deref().is_some_and(|root| meta.path.starts_with(root))
    }

    fn within_size_limit(&self, index: &dyn AnyIndex, meta: &FileMeta) -> bool {
        meta.len <= self.size_limit || index.ignores_size_limit(meta)
    }

    /// Applies content-less indices synchronously and schedules the
    /// content-dependent reindex of an existing file.
    fn mark_dirty(&self, file: FileId) -> Result<()> {
        let Some(meta) = self.fs.file(file) else {
            return Err(crate::InternalError::IllegalFileId(file).into());
        };
        if self.is_under_system_root(&meta) {
            return Ok(());
        }
        if meta.is_directory {
            for child in self.fs.children(file) {
                self.mark_dirty(child.id)?;
            }
            return Ok(());
        }

        let mut needs_content_pass = false;
        for index in self.registry.indices() {
            if !index.accepts(&meta) {
                continue;
            }
            if index.depends_on_file_content() {
                needs_content_pass |= self.within_size_limit(index.as_ref(), &meta);
            } else {
                let input = IndexedFile { meta: &meta, content: None };
                self.update_single_index(index.as_ref(), file, Some(&input))?;
            }
        }

        if needs_content_pass {
            self.files_to_update.lock().unwrap().insert(file, meta);
        }
        Ok(())
    }

    /// The shared invalidation policy: content-less indices drop the file
    /// immediately; content-dependent ones either get stamped for reindex or
    /// queue an erase task.
    fn invalidate_indices(&self, file: FileId, mark_for_reindex: bool) -> Result<()> {
        let Some(meta) = self.fs.file(file) else {
            // Already gone; nothing can still reference it.
            return Ok(());
        };
        if self.is_under_system_root(&meta) {
            return Ok(());
        }
        if meta.is_directory {
            for child in self.fs.children(file) {
                self.invalidate_indices(child.id, mark_for_reindex)?;
            }
            return Ok(());
        }

        let mut to_erase = Vec::new();
        let mut scheduled = false;
        for index in self.registry.indices() {
            if !index.accepts(&meta) {
                continue;
            }
            if !index.depends_on_file_content() {
                self.update_single_index(index.as_ref(), file, None)?;
            } else if mark_for_reindex && self.within_size_limit(index.as_ref(), &meta) {
                index.mark_outdated(file)?;
                scheduled = true;
            } else {
                to_erase.push(index.name());
            }
        }

        if scheduled {
            self.files_to_update.lock().unwrap().insert(file, meta);
        }
        if !to_erase.is_empty() {
            // The send only fails when the collector is being torn down.
            let _ = self.invalidations.send(InvalidationTask { file, affected: to_erase });
        }
        Ok(())
    }

    /// Drains the invalidation queue. Serial, but callable from any number
    /// of threads at once.
    pub fn ensure_all_invalidate_tasks_completed(&self) -> Result<()> {
        let _guard = self.drain_lock.lock().unwrap();
        while let Ok(task) = self.pending_invalidations.try_recv() {
            self.host.check_cancelled()?;
            for name in task.affected {
                let index = self.registry.any_index(name)?;
                self.update_single_index(index.as_ref(), task.file, None)?;
            }
        }
        Ok(())
    }

    fn update_single_index(
        &self,
        index: &dyn AnyIndex,
        file: FileId,
        input: Option<&IndexedFile<'_>>,
    ) -> Result<()> {
        match index.update_file(file, input) {
            Ok(()) => Ok(()),
            Err(error) if error.is_storage_defect() => {
                self.registry.schedule_rebuild(index.name(), &error);
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    /// Reindexes every scheduled file matching the requested scope. When the
    /// batch is done, waits until concurrent callers finish theirs too, so
    /// every caller leaves observing a fully up-to-date state.
    pub fn force_update(
        &self,
        filter: Option<&dyn Fn(&FileMeta) -> bool>,
        restriction: Option<FileId>,
        remove_only: bool,
    ) -> Result<()> {
        self.ensure_all_invalidate_tasks_completed()?;

        let batch: Vec<FileMeta> = {
            let mut files = self.files_to_update.lock().unwrap();
            let selected: Vec<FileId> = files
                .iter()
                .filter(|(id, meta)| {
                    restriction.is_none_or(|only| only == **id)
                        && filter.is_none_or(|filter| filter(meta))
                })
                .map(|(id, _)| *id)
                .collect();
            selected.into_iter().filter_map(|id| files.remove(&id)).collect()
        };

        if !batch.is_empty() {
            *self.in_flight.lock().unwrap() += batch.len();
            let mut batch = std::collections::VecDeque::from(batch);
            while let Some(meta) = batch.pop_front() {
                let result = self.host.check_cancelled().and_then(|()| {
                    if remove_only {
                        self.erase_file(&meta)
                    } else {
                        self.reindex_file(&meta)
                    }
                });
                if let Err(error) = result {
                    // This file and the unprocessed rest of the batch stay
                    // scheduled and will be retried.
                    let abandoned = 1 + batch.len();
                    let mut files = self.files_to_update.lock().unwrap();
                    files.insert(meta.id, meta);
                    for meta in batch {
                        files.insert(meta.id, meta);
                    }
                    drop(files);
                    let mut in_flight = self.in_flight.lock().unwrap();
                    *in_flight -= abandoned;
                    if *in_flight == 0 {
                        self.batch_done.notify_all();
                    }
                    return Err(error);
                }
                let mut in_flight = self.in_flight.lock().unwrap();
                *in_flight -= 1;
                if *in_flight == 0 {
                    self.batch_done.notify_all();
                }
            }
        }

        self.wait_until_batch_done()
    }

    fn wait_until_batch_done(&self) -> Result<()> {
        let mut in_flight = self.in_flight.lock().unwrap();
        while *in_flight > 0 {
            self.host.check_cancelled()?;
            let (guard, _timeout) =
                self.batch_done.wait_timeout(in_flight, FORCE_UPDATE_WAIT_SLICE).unwrap();
            in_flight = guard;
        }
        Ok(())
    }

    fn reindex_file(&self, scheduled: &FileMeta) -> Result<()> {
        // Re-resolve: the file may have changed or vanished since it was
        // scheduled.
        match self.fs.file(scheduled.id) {
            Some(meta) => {
                let content = self.fs.read(meta.id)?;
                for index in self.registry.indices() {
                    if !index.depends_on_file_content() || !index.accepts(&meta) {
                        continue;
                    }
                    let input = if self.within_size_limit(index.as_ref(), &meta) {
                        Some(IndexedFile { meta: &meta, content: Some(&content) })
                    } else {
                        None
                    };
                    self.update_single_index(index.as_ref(), meta.id, input.as_ref())?;
                }
                Ok(())
            }
            None => self.erase_file(scheduled),
        }
    }

    fn erase_file(&self, meta: &FileMeta) -> Result<()> {
        for index in self.registry.indices() {
            if index.depends_on_file_content() && index.accepts(meta) {
                self.update_single_index(index.as_ref(), meta.id, None)?;
            }
        }
        Ok(())
    }

    /// Explicit host request to reindex one file.
    pub fn request_reindex(&self, file: FileId) -> Result<()> {
        let Some(meta) = self.fs.file(file) else {
            return Err(crate::InternalError::IllegalFileId(file).into());
        };
        for index in self.registry.indices() {
            if index.depends_on_file_content() && index.accepts(&meta) {
                index.mark_outdated(file)?;
            }
        }
        self.files_to_update.lock().unwrap().insert(file, meta);
        Ok(())
    }

    pub fn files_to_update(&self) -> Vec<FileId> {
        self.files_to_update.lock().unwrap().keys().copied().collect()
    }

    /// Removes a whole indexable scope: the queue is drained first so no
    /// concurrent force-update can resurrect a half-removed scope, then the
    /// matching files are erased rather than reindexed.
    pub fn remove_indexable_set(&self, filter: &dyn Fn(&FileMeta) -> bool) -> Result<()> {
        self.ensure_all_invalidate_tasks_completed()?;
        self.force_update(Some(filter), None, true)
    }
}
