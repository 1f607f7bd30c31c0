use std::collections::BTreeMap;

use crate::{Storage, StorageError};

/// Volatile backend, only suitable for tests and throwaway clusters.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    store: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        InMemoryStorage {
            store: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

impl Storage for InMemoryStorage {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.store.get(key).cloned())
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.store.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn iter(&self) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + '_> {
        Box::new(self.store.iter().map(|(k, v)| (k.clone(), v.clone())))
    }
}

#[cfg(test)]
mod tests {
    use crate::in_memory::InMemoryStorage;
    use crate::Storage;

    #[test]
    fn put_then_get() {
        let mut mem = InMemoryStorage::new();
        mem.put(b"key", b"xxx").unwrap();
        assert_eq!(mem.get(b"key").unwrap(), Some(b"xxx".to_vec()));
        assert_eq!(mem.get(b"does not exist").unwrap(), None);

        mem.put(b"key", b"yyy").unwrap();
        assert_eq!(mem.get(b"key").unwrap(), Some(b"yyy".to_vec()));
        assert_eq!(mem.len(), 1);
    }

    #[test]
    fn iterate_in_key_order() {
        let mut mem = InMemoryStorage::default();
        assert!(mem.is_empty());
        mem.put(b"b", b"2").unwrap();
        mem.put(b"a", b"1").unwrap();
        mem.put(b"c", b"3").unwrap();

        let keys = mem.iter().map(|(k, _)| k).collect::<Vec<_>>();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }
}
