//! The contract an index extension implements and the typed handle queries
//! use to reach its index.

use std::collections::HashMap;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::codec::{KeyCodec, ValueCodec};
use crate::vfs::FileMeta;
use crate::DEFAULT_CACHE_SIZE;

/// Blanket bounds for index keys: hashable, canonical equality, shareable.
pub trait IndexKey: Clone + Eq + Hash + Send + Sync + 'static {}
impl<T: Clone + Eq + Hash + Send + Sync + 'static> IndexKey for T {}

pub trait IndexValue: Clone + PartialEq + Send + Sync + 'static {}
impl<T: Clone + PartialEq + Send + Sync + 'static> IndexValue for T {}

/// A typed index name: the string identifies the index, the phantom carries
/// the key and value types queries are checked against.
pub struct IndexId<K, V> {
    name: &'static str,
    _types: PhantomData<fn() -> (K, V)>,
}

impl<K, V> IndexId<K, V> {
    pub const fn new(name: &'static str) -> IndexId<K, V> {
        IndexId { name, _types: PhantomData }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<K, V> Clone for IndexId<K, V> {
    fn clone(&self) -> IndexId<K, V> {
        *self
    }
}

impl<K, V> Copy for IndexId<K, V> {}

impl<K, V> std::fmt::Debug for IndexId<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("IndexId").field(&self.name).finish()
    }
}

/// What the indexer of an extension receives for one file. `content` is
/// `None` for indices that do not depend on file content; they can still
/// look at the metadata.
pub struct IndexedFile<'a> {
    pub meta: &'a FileMeta,
    pub content: Option<&'a [u8]>,
}

/// One pluggable index definition.
///
/// The engine owns the persistence, locking and invalidation; the extension
/// supplies the mapping from a file to key/value pairs and the codecs for
/// both sides.
pub trait IndexExtension<K, V>: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Bump to force a drop-and-rebuild of the on-disk data.
    fn version(&self) -> i32;

    /// Extracts the indexed pairs of one file.
    fn index(&self, input: &IndexedFile<'_>) -> HashMap<K, V>;

    fn key_codec(&self) -> Arc<dyn KeyCodec<K>>;

    fn value_codec(&self) -> Arc<dyn ValueCodec<V>>;

    /// Which files this index wants to see at all.
    fn accepts(&self, file: &FileMeta) -> bool;

    /// Content-dependent indices are updated through the deferred reindex
    /// queue; content-less ones synchronously with the VFS event.
    fn depends_on_file_content(&self) -> bool {
        true
    }

    fn cache_size(&self) -> usize {
        DEFAULT_CACHE_SIZE
    }

    /// Exempts specific files (by type) from the global size limit.
    fn ignores_size_limit(&self, _file: &FileMeta) -> bool {
        false
    }
}
