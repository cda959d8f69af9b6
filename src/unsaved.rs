//! The unsaved-document overlay.
//!
//! Editors register the current text of documents with unsaved edits; at
//! query time the engine re-runs the indexer over that text into the
//! buffering overlay of each index, so queries observe the editor state
//! without anything reaching disk. Dropping the edits reverts queries to
//! the persisted state.

use std::sync::{Arc, Mutex};

use crate::bus::{EventBus, TransactionCompleted, TransactionStarted};
use crate::extension::IndexedFile;
use crate::index::AnyIndex;
use crate::vfs::FileMeta;
use crate::{FastMap8, FileId, Result};

struct UnsavedDocument {
    meta: FileMeta,
    text: Vec<u8>,
}

pub struct UnsavedDocuments {
    bus: Arc<EventBus>,
    /// The transaction map, under its own lock.
    documents: Mutex<FastMap8<FileId, UnsavedDocument>>,
}

impl UnsavedDocuments {
    pub(crate) fn new(bus: Arc<EventBus>) -> UnsavedDocuments {
        UnsavedDocuments { bus, documents: Mutex::default() }
    }

    /// Registers or refreshes the in-editor text of a document.
    pub fn document_edited(&self, meta: FileMeta, text: impl Into<Vec<u8>>) {
        let file = meta.id;
        let mut documents = self.documents.lock().unwrap();
        let started = documents
            .insert(file, UnsavedDocument { meta, text: text.into() })
            .is_none();
        drop(documents);
        if started {
            self.bus.publish(&TransactionStarted { file });
        }
    }

    /// The document was saved or its edits were discarded.
    pub fn document_dropped(&self, file: FileId) {
        let removed = self.documents.lock().unwrap().remove(&file).is_some();
        if removed {
            self.bus.publish(&TransactionCompleted { file });
        }
    }

    pub fn is_empty(&self) -> bool {
        self.documents.lock().unwrap().is_empty()
    }

    /// Projects the unsaved documents into the buffering overlay of one
    /// index. Without unsaved documents this drops the overlay instead,
    /// which reverts the index to its persisted state.
    pub(crate) fn apply_to(
        &self,
        index: &dyn AnyIndex,
        restriction: Option<FileId>,
    ) -> Result<()> {
        if !index.depends_on_file_content() {
            return Ok(());
        }

        // Snapshot under the transaction lock, index outside of it.
        let snapshot: Vec<(FileId, FileMeta, Vec<u8>)> = {
            let documents = self.documents.lock().unwrap();
            documents
                .iter()
                .filter(|(file, _)| restriction.is_none_or(|only| only == **file))
                .map(|(file, doc)| (*file, doc.meta.clone(), doc.text.clone()))
                .collect()
        };

        if snapshot.is_empty() {
            index.set_buffering_mode(false);
            return Ok(());
        }

        index.set_buffering_mode(true);
        for (file, meta, text) in &snapshot {
            if !index.accepts(meta) {
                continue;
            }
            let input = IndexedFile { meta, content: Some(text) };
            index.update_file_buffered(*file, &input)?;
        }
        Ok(())
    }
}
