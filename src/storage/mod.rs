//! The durable key→record maps behind every index.
//!
//! [`PersistentMap`] is the seam the rest of the engine writes against; the
//! [`lmdb`] module provides the production implementation backed by one LMDB
//! environment per index.

pub mod lmdb;

use crate::Result;

/// A durable map with an in-process cache. Writes may be buffered until
/// [`flush`](PersistentMap::flush); reads always observe buffered writes.
pub trait PersistentMap<K, V>: Send + Sync {
    fn get(&self, key: &K) -> Result<Option<V>>;

    fn put(&self, key: &K, value: &V) -> Result<()>;

    fn remove(&self, key: &K) -> Result<()>;

    /// Visits every live key in unspecified order. Stops and returns `false`
    /// as soon as the visitor does.
    fn for_each_key(&self, visitor: &mut dyn FnMut(&K) -> bool) -> Result<bool>;

    /// Makes all buffered writes durable.
    fn flush(&self) -> Result<()>;

    /// Drops every entry, buffered and durable.
    fn clear(&self) -> Result<()>;
}
