//! The process-wide method table.
//!
//! Every method the rewriter touches is interned here exactly once, receiving
//! a dense `method_id` equal to its insertion index. Records are immutable
//! after publish and live until process exit. Probes and the wire layer read
//! the table concurrently while the JIT keeps appending; storage is therefore
//! an append-only vector with a lock-free index on the side, and only writers
//! serialize.

use std::sync::Mutex;

use crossbeam_skiplist::SkipMap;
use widestring::{U16Str, U16String};

use crate::{rewrite::ModuleId, Token};

/// Immutable description of one interned method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodRecord {
    /// Metadata token of the method within its module
    pub token: Token,
    /// Name of the defining module (UTF-16)
    pub module_name: U16String,
    /// Simple name of the defining assembly (UTF-16)
    pub assembly_name: U16String,
}

/// Append-only table of [`MethodRecord`] indexed by method id.
pub struct MethodTable {
    records: boxcar::Vec<MethodRecord>,
    index: SkipMap<(u32, u64), u32>,
    writer: Mutex<()>,
}

impl MethodTable {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: boxcar::Vec::new(),
            index: SkipMap::new(),
            writer: Mutex::new(()),
        }
    }

    /// Interns `(token, module)`, returning its method id and whether this
    /// call created the record.
    ///
    /// Idempotent: a second intern of the same `(token, module)` returns the
    /// original id with `first_time = false` and ignores the names.
    pub fn intern(
        &self,
        token: Token,
        module: ModuleId,
        module_name: &U16Str,
        assembly_name: &U16Str,
    ) -> (u32, bool) {
        let key = (token.value(), module as u64);
        if let Some(entry) = self.index.get(&key) {
            return (*entry.value(), false);
        }

        let _guard = lock!(self.writer);
        // a racing writer may have published the record while we waited
        if let Some(entry) = self.index.get(&key) {
            return (*entry.value(), false);
        }
        let id = self.records.push(MethodRecord {
            token,
            module_name: module_name.to_ustring(),
            assembly_name: assembly_name.to_ustring(),
        });
        #[allow(clippy::cast_possible_truncation)]
        let id = id as u32;
        self.index.insert(key, id);
        (id, true)
    }

    /// Looks up the id previously assigned to `(token, module)`.
    #[must_use]
    pub fn lookup(&self, token: Token, module: ModuleId) -> Option<u32> {
        self.index
            .get(&(token.value(), module as u64))
            .map(|entry| *entry.value())
    }

    /// The record behind `id`.
    #[must_use]
    pub fn get(&self, id: u32) -> Option<&MethodRecord> {
        self.records.get(id as usize)
    }

    /// Number of interned methods.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.count()
    }

    /// True when nothing has been interned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.count() == 0
    }
}

impl Default for MethodTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodTable")
            .field("methods", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use widestring::u16str;

    fn intern(table: &MethodTable, token: u32, module: ModuleId) -> (u32, bool) {
        table.intern(
            Token(token),
            module,
            u16str!("App.dll"),
            u16str!("App"),
        )
    }

    #[test]
    fn ids_are_dense_insertion_indices() {
        let table = MethodTable::new();
        assert_eq!(intern(&table, 0x06000001, 1), (0, true));
        assert_eq!(intern(&table, 0x06000002, 1), (1, true));
        assert_eq!(intern(&table, 0x06000001, 2), (2, true));
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn intern_is_idempotent() {
        let table = MethodTable::new();
        let (id, first) = intern(&table, 0x06000001, 1);
        assert!(first);
        assert_eq!(intern(&table, 0x06000001, 1), (id, false));
        assert_eq!(table.len(), 1);
        assert_eq!(table.lookup(Token(0x06000001), 1), Some(id));
    }

    #[test]
    fn records_are_readable_by_id() {
        let table = MethodTable::new();
        let (id, _) = table.intern(
            Token(0x06000007),
            4,
            u16str!("Lib.dll"),
            u16str!("Lib"),
        );
        let record = table.get(id).unwrap();
        assert_eq!(record.token, Token(0x06000007));
        assert_eq!(record.module_name, u16str!("Lib.dll").to_ustring());
        assert_eq!(record.assembly_name, u16str!("Lib").to_ustring());
        assert!(table.get(id + 1).is_none());
    }

    #[test]
    fn concurrent_interning_assigns_one_id_per_method() {
        let table = Arc::new(MethodTable::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let table = Arc::clone(&table);
            handles.push(std::thread::spawn(move || {
                for token in 0..100u32 {
                    intern(&table, 0x0600_0000 | token, 1);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(table.len(), 100);
        for token in 0..100u32 {
            let id = table.lookup(Token(0x0600_0000 | token), 1).unwrap();
            assert_eq!(table.get(id).unwrap().token.value(), 0x0600_0000 | token);
        }
    }
}
