//! A small typed-topic message bus.
//!
//! The engine and its collaborators talk through topics instead of holding
//! pointers to each other: the virtual-file layer publishes [`VfsEvent`]s,
//! the unsaved-document overlay publishes transaction brackets, and anyone
//! interested subscribes by topic type. Subscribers run on the publishing
//! thread.
//!
//! [`VfsEvent`]: crate::vfs::VfsEvent

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::FileId;

type Handler = Arc<dyn Any + Send + Sync>;

#[derive(Default)]
pub struct EventBus {
    topics: RwLock<HashMap<TypeId, Vec<Handler>>>,
}

impl EventBus {
    pub fn new() -> EventBus {
        EventBus::default()
    }

    pub fn subscribe<T, F>(&self, handler: F)
    where
        T: Any + Send + Sync,
        F: Fn(&T) + Send + Sync + 'static,
    {
        let handler: Arc<dyn Fn(&T) + Send + Sync> = Arc::new(handler);
        let mut topics = self.topics.write().unwrap();
        topics.entry(TypeId::of::<T>()).or_default().push(Arc::new(handler));
    }

    pub fn publish<T: Any + Send + Sync>(&self, event: &T) {
        // Handlers are cloned out so a subscriber can subscribe in turn
        // without deadlocking on the topic table.
        let handlers = {
            let topics = self.topics.read().unwrap();
            topics.get(&TypeId::of::<T>()).cloned().unwrap_or_default()
        };
        for handler in handlers {
            if let Some(handler) = handler.downcast_ref::<Arc<dyn Fn(&T) + Send + Sync>>() {
                handler(event);
            }
        }
    }
}

/// An editor opened an in-memory transaction over a file.
#[derive(Debug, Clone, Copy)]
pub struct TransactionStarted {
    pub file: FileId,
}

/// The in-memory transaction over a file was completed or abandoned.
#[derive(Debug, Clone, Copy)]
pub struct TransactionCompleted {
    pub file: FileId,
}

/// A file's persistent content was reloaded from disk.
#[derive(Debug, Clone, Copy)]
pub struct FileContentReloaded {
    pub file: FileId,
}

/// A host write action began; long read loops should yield.
#[derive(Debug, Clone, Copy)]
pub struct WriteActionStarted;

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn topics_are_segregated_by_type() {
        let bus = EventBus::new();
        let started = Arc::new(AtomicU32::new(0));
        let completed = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&started);
        bus.subscribe::<TransactionStarted, _>(move |event| {
            counter.fetch_add(event.file, Ordering::Relaxed);
        });
        let counter = Arc::clone(&completed);
        bus.subscribe::<TransactionCompleted, _>(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });

        bus.publish(&TransactionStarted { file: 7 });
        bus.publish(&TransactionStarted { file: 1 });

        assert_eq!(started.load(Ordering::Relaxed), 8);
        assert_eq!(completed.load(Ordering::Relaxed), 0);
    }
}
