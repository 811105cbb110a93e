use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Process-wide map from id to throttler.
///
/// Entries are held weakly: a throttler lives as long as the application
/// keeps a handle to it. Dead entries are swept by [`ThrottlerRegistry::snapshot`].
#[derive(Debug)]
pub struct ThrottlerRegistry<T> {
    throttlers: RwLock<HashMap<String, Weak<T>>>,
}

impl<T> Default for ThrottlerRegistry<T> {
    fn default() -> Self {
        Self {
            throttlers: RwLock::new(HashMap::new()),
        }
    }
}

impl<T> ThrottlerRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, id: &str) -> Option<Arc<T>> {
        self.throttlers.read().get(id).and_then(Weak::upgrade)
    }

    /// Return the live throttler for `id`, creating it if needed.
    ///
    /// `on_found` runs on an existing throttler, `create` runs at most once and
    /// only under the write lock, so concurrent callers never create two
    /// throttlers for the same id.
    pub fn get_or_create<F, C>(&self, id: &str, on_found: F, create: C) -> Arc<T>
    where
        F: FnOnce(&Arc<T>),
        C: FnOnce() -> Arc<T>,
    {
        if let Some(throttler) = self.find(id) {
            on_found(&throttler);
            return throttler;
        }

        let mut throttlers = self.throttlers.write();
        if let Some(throttler) = throttlers.get(id).and_then(Weak::upgrade) {
            drop(throttlers);
            on_found(&throttler);
            return throttler;
        }

        let throttler = create();
        throttlers.insert(id.to_string(), Arc::downgrade(&throttler));
        throttler
    }

    /// Live throttlers, without touching dead entries.
    pub fn alive(&self) -> Vec<Arc<T>> {
        self.throttlers.read().values().filter_map(Weak::upgrade).collect()
    }

    /// Live throttlers by id; dead entries are removed on the way.
    pub fn snapshot(&self) -> HashMap<String, Arc<T>> {
        let mut alive = HashMap::new();
        let mut dead = Vec::new();
        {
            let throttlers = self.throttlers.read();
            for (id, weak) in throttlers.iter() {
                match weak.upgrade() {
                    Some(throttler) => {
                        alive.insert(id.clone(), throttler);
                    }
                    None => dead.push(id.clone()),
                }
            }
        }

        if !dead.is_empty() {
            let mut throttlers = self.throttlers.write();
            for id in dead {
                // The id may have been recreated since the read pass.
                if throttlers.get(&id).is_some_and(|weak| weak.strong_count() == 0) {
                    throttlers.remove(&id);
                }
            }
        }

        alive
    }

    /// Number of entries, dead ones included.
    pub fn len(&self) -> usize {
        self.throttlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
