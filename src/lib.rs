//! A persistent file-based inverted-index engine.
//!
//! The engine maintains many named indices, each mapping extension-defined
//! keys to values annotated with the set of file ids the value was extracted
//! from. Indices stay consistent with a stream of filesystem events while
//! serving queries with up-to-date-on-read semantics: every query first drains
//! the pending invalidations for its scope, then runs under the per-index
//! read lock.
//!
//! Hosts embed the engine through [`FileIndex`]: they register their
//! [`IndexExtension`]s at startup, push [`vfs::VfsEvent`]s as their virtual
//! file system changes, and query through the typed [`IndexId`] handles.

pub mod bus;
pub mod codec;
mod collector;
mod container;
mod error;
mod extension;
mod flush;
pub mod host;
mod index;
mod input_to_keys;
mod overlay;
mod registry;
mod scan;
mod service;
mod stamp;
pub mod storage;
mod store;
pub mod vfs;
mod unsaved;

use std::collections::{HashMap, HashSet};
use std::hash::BuildHasherDefault;

use fxhash::FxHasher64;

pub use {heed, roaring};

pub use self::collector::ChangedFilesCollector;
pub use self::container::ValueContainer;
pub use self::error::{Error, InternalError, SerializationError, UserError};
pub use self::extension::{IndexExtension, IndexId, IndexKey, IndexValue, IndexedFile};
pub use self::index::UpdatableIndex;
pub use self::overlay::{MemoryOverlay, OverlayEvent};
pub use self::registry::{IndexRegistry, RebuildCause, RebuildStatus};
pub use self::scan::UnindexedFilesFinder;
pub use self::service::{
    with_up_to_date_checks_disabled, without_waiting_for_smart_mode, FileIndex, FileIndexBuilder,
    FileIndexOptions, Scope, DEFAULT_FLUSH_INTERVAL, DEFAULT_MAP_SIZE, DEFAULT_SIZE_LIMIT,
};
pub use self::stamp::{NO_INDEXED_DATA_STAMP, OUTDATED_STAMP};
pub use self::store::{RegisterOutcome, VersionedStore};
pub use self::unsaved::UnsavedDocuments;

pub type Result<T> = std::result::Result<T, error::Error>;

/// The stable integer id the virtual-file layer assigns to a file.
pub type FileId = u32;

pub type FastMap8<K, V> = HashMap<K, V, BuildHasherDefault<FxHasher64>>;
pub type FastSet8<T> = HashSet<T, BuildHasherDefault<FxHasher64>>;

/// How many records the in-process cache of a durable map retains unless
/// the extension asks for more.
pub const DEFAULT_CACHE_SIZE: usize = 1024;
