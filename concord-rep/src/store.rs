use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

// The map itself. Reads are concurrent, each apply step is a single writer,
// and a key nobody ever set reads as zero, so a fresh replica answers any
// get without special-casing.
pub struct KvStore {
    map: RwLock<HashMap<String, i64>>,
}

impl KvStore {
    pub fn new() -> KvStore {
        KvStore {
            map: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> i64 {
        *self.map.read().unwrap().get(key).unwrap_or(&0)
    }

    pub fn set(&self, key: &str, value: i64) {
        self.map.write().unwrap().insert(key.to_string(), value);
    }

    // Ordered copy, for diagnostics and cross-replica comparison.
    pub fn snapshot(&self) -> BTreeMap<String, i64> {
        self.map
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }
}

impl Default for KvStore {
    fn default() -> Self {
        Self::new()
    }
}
