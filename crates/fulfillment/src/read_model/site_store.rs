use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

use stockroom_core::SiteId;

/// Site-isolated key/value store abstraction for disposable read models.
///
/// A site is the tenant boundary for inventory: two sites never see each
/// other's records through this interface.
pub trait SiteStore<K, V>: Send + Sync {
    fn get(&self, site_id: SiteId, key: &K) -> Option<V>;
    fn upsert(&self, site_id: SiteId, key: K, value: V);
    fn remove(&self, site_id: SiteId, key: &K);
    fn list(&self, site_id: SiteId) -> Vec<V>;
    /// Clear all read-model records for a site (rebuild support).
    fn clear_site(&self, site_id: SiteId);
}

impl<K, V, S> SiteStore<K, V> for Arc<S>
where
    S: SiteStore<K, V> + ?Sized,
{
    fn get(&self, site_id: SiteId, key: &K) -> Option<V> {
        (**self).get(site_id, key)
    }

    fn upsert(&self, site_id: SiteId, key: K, value: V) {
        (**self).upsert(site_id, key, value)
    }

    fn remove(&self, site_id: SiteId, key: &K) {
        (**self).remove(site_id, key)
    }

    fn list(&self, site_id: SiteId) -> Vec<V> {
        (**self).list(site_id)
    }

    fn clear_site(&self, site_id: SiteId) {
        (**self).clear_site(site_id)
    }
}

/// In-memory site-isolated store for tests/dev.
#[derive(Debug)]
pub struct InMemorySiteStore<K, V> {
    inner: RwLock<HashMap<(SiteId, K), V>>,
}

impl<K, V> InMemorySiteStore<K, V> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> Default for InMemorySiteStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> SiteStore<K, V> for InMemorySiteStore<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn get(&self, site_id: SiteId, key: &K) -> Option<V> {
        let map = self.inner.read().ok()?;
        map.get(&(site_id, key.clone())).cloned()
    }

    fn upsert(&self, site_id: SiteId, key: K, value: V) {
        if let Ok(mut map) = self.inner.write() {
            map.insert((site_id, key), value);
        }
    }

    fn remove(&self, site_id: SiteId, key: &K) {
        if let Ok(mut map) = self.inner.write() {
            map.remove(&(site_id, key.clone()));
        }
    }

    fn list(&self, site_id: SiteId) -> Vec<V> {
        let map = match self.inner.read() {
            Ok(m) => m,
            Err(_) => return vec![],
        };

        map.iter()
            .filter_map(|((s, _k), v)| if *s == site_id { Some(v.clone()) } else { None })
            .collect()
    }

    fn clear_site(&self, site_id: SiteId) {
        if let Ok(mut map) = self.inner.write() {
            map.retain(|(s, _k), _v| *s != site_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_isolated_per_site() {
        let store: InMemorySiteStore<String, i64> = InMemorySiteStore::new();
        let site_a = SiteId::new();
        let site_b = SiteId::new();

        store.upsert(site_a, "x".to_string(), 1);
        store.upsert(site_b, "x".to_string(), 2);

        assert_eq!(store.get(site_a, &"x".to_string()), Some(1));
        assert_eq!(store.get(site_b, &"x".to_string()), Some(2));
        assert_eq!(store.list(site_a), vec![1]);

        store.clear_site(site_a);
        assert!(store.list(site_a).is_empty());
        assert_eq!(store.list(site_b), vec![2]);
    }
}
