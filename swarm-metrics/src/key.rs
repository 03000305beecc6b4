use ahash::AHashMap;
use parking_lot::RwLock;
use std::sync::Arc;

/// Interned string id used for metric names and tag keys/values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(u32);

impl From<KeyId> for u32 {
    fn from(v: KeyId) -> Self {
        v.0
    }
}

#[derive(Debug, Default)]
struct Table {
    ids: AHashMap<Arc<str>, KeyId>,
    strings: Vec<Arc<str>>,
}

/// Append-only string table. Ids are dense and never reused.
#[derive(Debug, Default)]
pub struct Interner {
    table: RwLock<Table>,
}

impl Interner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&self, s: &str) -> KeyId {
        if let Some(id) = self.get(s) {
            return id;
        }

        let mut table = self.table.write();
        // Another writer may have won the race between the read and write lock.
        if let Some(&id) = table.ids.get(s) {
            return id;
        }

        let id = KeyId(table.strings.len() as u32);
        let s: Arc<str> = Arc::from(s);
        table.strings.push(s.clone());
        table.ids.insert(s, id);
        id
    }

    /// Looks up an id without interning.
    pub fn get(&self, s: &str) -> Option<KeyId> {
        self.table.read().ids.get(s).copied()
    }

    pub fn resolve(&self, id: KeyId) -> Option<Arc<str>> {
        self.table.read().strings.get(id.0 as usize).cloned()
    }

    pub fn len(&self) -> usize {
        self.table.read().strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_is_stable_and_dense() {
        let interner = Interner::new();
        let a = interner.intern("scenario");
        let b = interner.intern("group");
        assert_eq!(interner.intern("scenario"), a);
        assert_ne!(a, b);
        assert_eq!(interner.len(), 2);
        assert_eq!(interner.resolve(b).as_deref(), Some("group"));
        assert_eq!(interner.get("missing"), None);
    }

    #[test]
    fn intern_from_many_threads_yields_one_id() {
        let interner = Arc::new(Interner::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let interner = interner.clone();
                std::thread::spawn(move || interner.intern("http_reqs"))
            })
            .collect();

        let ids: Vec<KeyId> = handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|_| panic!("thread panicked")))
            .collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(interner.len(), 1);
    }
}
