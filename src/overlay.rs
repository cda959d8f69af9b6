//! The in-memory buffering layer over a persistent map.
//!
//! In passthrough mode every operation goes straight to the wrapped map. In
//! buffering mode reads consult an in-memory change map first and writes and
//! deletes touch only that change map, which is how transient editor content
//! is observed by queries without ever reaching disk. Turning buffering off
//! discards the change map; there is no commit operation.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use crate::storage::PersistentMap;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayEvent {
    BufferingStateChanged(bool),
    MemoryStorageCleared,
}

type Listener = Box<dyn Fn(OverlayEvent) + Send + Sync>;

struct OverlayState<K, V> {
    buffering: bool,
    changes: HashMap<K, Option<V>>,
}

pub struct MemoryOverlay<K, V> {
    base: Arc<dyn PersistentMap<K, V>>,
    state: Mutex<OverlayState<K, V>>,
    listeners: Mutex<Vec<Listener>>,
}

impl<K, V> MemoryOverlay<K, V>
where
    K: Clone + Eq + Hash + Send + Sync,
    V: Clone + Send + Sync,
{
    pub fn new(base: Arc<dyn PersistentMap<K, V>>) -> MemoryOverlay<K, V> {
        MemoryOverlay {
            base,
            state: Mutex::new(OverlayState { buffering: false, changes: HashMap::new() }),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, listener: impl Fn(OverlayEvent) + Send + Sync + 'static) {
        self.listeners.lock().unwrap().push(Box::new(listener));
    }

    fn emit(&self, event: OverlayEvent) {
        for listener in self.listeners.lock().unwrap().iter() {
            listener(event);
        }
    }

    pub fn is_buffering(&self) -> bool {
        self.state.lock().unwrap().buffering
    }

    /// Enters or leaves buffering mode. Leaving discards the change map.
    pub fn set_buffering(&self, enabled: bool) {
        let cleared = {
            let mut state = self.state.lock().unwrap();
            if state.buffering == enabled {
                return;
            }
            state.buffering = enabled;
            if !enabled && !state.changes.is_empty() {
                state.changes.clear();
                true
            } else {
                false
            }
        };
        if cleared {
            self.emit(OverlayEvent::MemoryStorageCleared);
        }
        self.emit(OverlayEvent::BufferingStateChanged(enabled));
    }

    /// Discards buffered changes while staying in the current mode.
    pub fn drop_memory_changes(&self) {
        let cleared = {
            let mut state = self.state.lock().unwrap();
            let cleared = !state.changes.is_empty();
            state.changes.clear();
            cleared
        };
        if cleared {
            self.emit(OverlayEvent::MemoryStorageCleared);
        }
    }
}

impl<K, V> PersistentMap<K, V> for MemoryOverlay<K, V>
where
    K: Clone + Eq + Hash + Send + Sync,
    V: Clone + Send + Sync,
{
    fn get(&self, key: &K) -> Result<Option<V>> {
        {
            let state = self.state.lock().unwrap();
            if state.buffering {
                if let Some(change) = state.changes.get(key) {
                    return Ok(change.clone());
                }
            }
        }
        self.base.get(key)
    }

    fn put(&self, key: &K, value: &V) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.buffering {
            state.changes.insert(key.clone(), Some(value.clone()));
            Ok(())
        } else {
            drop(state);
            self.base.put(key, value)
        }
    }

    fn remove(&self, key: &K) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.buffering {
            // A buffered deletion is an empty record.
            state.changes.insert(key.clone(), None);
            Ok(())
        } else {
            drop(state);
            self.base.remove(key)
        }
    }

    fn for_each_key(&self, visitor: &mut dyn FnMut(&K) -> bool) -> Result<bool> {
        let state = self.state.lock().unwrap();
        if !state.buffering {
            drop(state);
            return self.base.for_each_key(visitor);
        }

        for (key, change) in state.changes.iter() {
            if change.is_some() && !visitor(key) {
                return Ok(false);
            }
        }
        let changes = &state.changes;
        self.base.for_each_key(&mut |key| {
            if changes.contains_key(key) {
                true // already visited or buffered away
            } else {
                visitor(key)
            }
        })
    }

    /// Buffered changes never reach disk; only the wrapped map flushes.
    fn flush(&self) -> Result<()> {
        self.base.flush()
    }

    fn clear(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            state.changes.clear();
        }
        self.emit(OverlayEvent::MemoryStorageCleared);
        self.base.clear()
    }
}
