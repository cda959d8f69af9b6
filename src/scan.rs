//! Finding the files a full re-scan still has to index.

use crate::extension::IndexedFile;
use crate::index::AnyIndex;
use crate::registry::IndexRegistry;
use crate::vfs::FileMeta;
use crate::{FastSet8, Result};

/// Walks a host-provided file iterator and returns the files for which some
/// content-dependent index lacks an up-to-date stamp. Content-less indices
/// are brought current on the spot.
pub struct UnindexedFilesFinder<'a> {
    registry: &'a IndexRegistry,
}

impl<'a> UnindexedFilesFinder<'a> {
    pub(crate) fn new(registry: &'a IndexRegistry) -> UnindexedFilesFinder<'a> {
        UnindexedFilesFinder { registry }
    }

    pub fn find(&self, files: impl IntoIterator<Item = FileMeta>) -> Result<Vec<FileMeta>> {
        let indices = self.registry.indices();
        let mut processed = FastSet8::default();
        let mut unindexed = Vec::new();

        for meta in files {
            if meta.is_directory || !processed.insert(meta.id) {
                continue;
            }

            let mut stale = false;
            for index in &indices {
                if !index.accepts(&meta) {
                    continue;
                }
                if !index.depends_on_file_content() {
                    let input = IndexedFile { meta: &meta, content: None };
                    index.update_file(meta.id, Some(&input))?;
                } else if !stale {
                    let creation_stamp = index.creation_stamp()?;
                    stale = index.stamp(meta.id)? != creation_stamp;
                }
            }

            if stale {
                unindexed.push(meta);
            }
        }

        Ok(unindexed)
    }
}
