use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use rustc_hash::FxHashMap;
use tokio::sync::Mutex;
use tracing::debug;

/// Allocated transport resources of one device session: an arena of allocations plus an index
///  by key.
///
/// Allocation is append-only: released slots stay empty, so the number passed to an allocating
///  closure (the arena size) is never handed out twice. Everything is released explicitly by
///  [TransportRegistry::release_all] at session teardown.
pub struct TransportRegistry<K, V> {
    inner: Mutex<Arena<K, V>>,
}

struct Arena<K, V> {
    slots: Vec<Option<(K, V)>>,
    index: FxHashMap<K, usize>,
}

impl<K: Eq + Hash + Clone + Debug, V: Clone> Default for TransportRegistry<K, V> {
    fn default() -> Self {
        TransportRegistry {
            inner: Mutex::new(Arena {
                slots: Vec::new(),
                index: FxHashMap::default(),
            }),
        }
    }
}

impl<K: Eq + Hash + Clone + Debug, V: Clone> TransportRegistry<K, V> {
    pub async fn get(&self, key: &K) -> Option<V> {
        let arena = self.inner.lock().await;
        arena.index.get(key)
            .and_then(|&i| arena.slots[i].as_ref())
            .map(|(_, v)| v.clone())
    }

    /// Return the allocation for `key`, or create it by calling `allocate` with the number of
    ///  allocations made so far. A failed allocation leaves the registry unchanged.
    ///
    /// The registry stays locked while `allocate` runs, so concurrent callers never allocate
    ///  twice for the same key.
    pub async fn get_or_allocate<F, Fut>(&self, key: K, allocate: F) -> anyhow::Result<V>
    where
        F: FnOnce(usize) -> Fut,
        Fut: Future<Output = anyhow::Result<V>>,
    {
        let mut arena = self.inner.lock().await;
        if let Some((_, v)) = arena.index.get(&key).and_then(|&i| arena.slots[i].as_ref()) {
            return Ok(v.clone());
        }

        let slot = arena.slots.len();
        let value = allocate(slot).await?;
        debug!("allocated transport resource #{} for {:?}", slot, key);
        arena.slots.push(Some((key.clone(), value.clone())));
        arena.index.insert(key, slot);
        Ok(value)
    }

    /// the number of live allocations
    pub async fn len(&self) -> usize {
        self.inner.lock().await.index.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn release(&self, key: &K) -> Option<V> {
        let mut arena = self.inner.lock().await;
        let slot = arena.index.remove(key)?;
        debug!("released transport resource #{} for {:?}", slot, key);
        arena.slots[slot].take().map(|(_, v)| v)
    }

    /// Release every allocation, returning them in allocation order
    pub async fn release_all(&self) -> Vec<V> {
        let mut arena = self.inner.lock().await;
        arena.index.clear();
        let released = arena.slots.iter_mut()
            .filter_map(|slot| slot.take())
            .map(|(_, v)| v)
            .collect::<Vec<_>>();
        if !released.is_empty() {
            debug!("released {} transport resources", released.len());
        }
        released
    }
}
