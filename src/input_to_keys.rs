//! The reverse side of an index: which keys are currently stored for each
//! file id. Kept in lockstep with the forward map so that updating a file
//! only touches the keys it actually contributed.

use std::hash::Hash;
use std::sync::Arc;

use crate::codec::{read_varint, write_varint, DataCodec, KeyCodec};
use crate::overlay::MemoryOverlay;
use crate::storage::PersistentMap;
use crate::{FastSet8, FileId, Result};

/// Encodes a key collection as a varint count followed by each key through
/// the extension codec.
pub struct KeySetCodec<K> {
    keys: Arc<dyn KeyCodec<K>>,
}

impl<K> KeySetCodec<K> {
    pub fn new(keys: Arc<dyn KeyCodec<K>>) -> KeySetCodec<K> {
        KeySetCodec { keys }
    }
}

impl<K: Clone + Eq + Hash + Send + Sync> DataCodec<FastSet8<K>> for KeySetCodec<K> {
    fn encode(&self, keys: &FastSet8<K>, out: &mut Vec<u8>) -> Result<()> {
        write_varint(out, keys.len() as u64);
        for key in keys {
            self.keys.write(key, out)?;
        }
        Ok(())
    }

    fn decode(&self, bytes: &[u8]) -> Result<FastSet8<K>> {
        let mut input = bytes;
        let count = read_varint(&mut input)? as usize;
        let mut keys = FastSet8::default();
        keys.reserve(count);
        for _ in 0..count {
            keys.insert(self.keys.read(&mut input)?);
        }
        Ok(keys)
    }
}

pub struct InputToKeys<K> {
    overlay: MemoryOverlay<FileId, FastSet8<K>>,
}

impl<K> InputToKeys<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new(overlay: MemoryOverlay<FileId, FastSet8<K>>) -> InputToKeys<K> {
        InputToKeys { overlay }
    }

    pub fn keys_for(&self, input: FileId) -> Result<FastSet8<K>> {
        Ok(self.overlay.get(&input)?.unwrap_or_default())
    }

    /// Replaces the recorded key set; an empty set erases the entry.
    pub fn replace(&self, input: FileId, keys: &FastSet8<K>) -> Result<()> {
        if keys.is_empty() {
            self.overlay.remove(&input)
        } else {
            self.overlay.put(&input, keys)
        }
    }

    pub fn set_buffering(&self, enabled: bool) {
        self.overlay.set_buffering(enabled);
    }

    pub fn drop_memory_changes(&self) {
        self.overlay.drop_memory_changes();
    }

    pub fn flush(&self) -> Result<()> {
        self.overlay.flush()
    }

    pub fn clear(&self) -> Result<()> {
        self.overlay.clear()
    }
}
