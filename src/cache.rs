use std::{
    fmt,
    sync::{Mutex, MutexGuard, PoisonError},
};

use arcstr::ArcStr;
use hashbrown::HashMap;
use rustc_hash::FxBuildHasher;

use crate::{compiler::FvmRoutine, types::*};

type FxHashMap<K, V> = HashMap<K, V, FxBuildHasher>;

/// Cache key: hex code hash, revision letter, and `S` for static calls.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FvmCodeId(ArcStr);

impl FvmCodeId {
    pub fn new(code_hash: &FvmHash, revision: FvmRevision, flags: FvmCallFlags) -> Self {
        const HEX: &[u8; 16] = b"0123456789abcdef";

        let mut id = String::with_capacity(FVM_HASH_LEN * 2 + 2);
        for &b in &code_hash.0 {
            id.push(HEX[(b >> 4) as usize] as char);
            id.push(HEX[(b & 0xf) as usize] as char);
        }
        id.push(revision.letter());
        if flags.contains(FvmCallFlags::STATIC) {
            id.push('S');
        }
        FvmCodeId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FvmCodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Default, Clone)]
pub struct FvmCodeEntry {
    pub routine: Option<FvmRoutine>,
    pub hits: u64,
}

/// Identity to routine map. The lock covers map access only; callers get
/// snapshots and never hold it across compilation or execution.
#[derive(Debug, Default)]
pub struct FvmCodeCache {
    entries: Mutex<FxHashMap<FvmCodeId, FvmCodeEntry>>,
}

impl FvmCodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, FxHashMap<FvmCodeId, FvmCodeEntry>> {
        // Nothing runs user code under the lock, so a poisoned map is still consistent.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Counts a hit for `id`, creating the entry on first sight.
    pub fn lookup(&self, id: &FvmCodeId) -> FvmCodeEntry {
        let mut entries = self.entries();
        let entry = entries.entry(id.clone()).or_default();
        entry.hits = entry.hits.saturating_add(1);
        entry.clone()
    }

    /// Like [`FvmCodeCache::lookup`], without counting.
    pub fn peek(&self, id: &FvmCodeId) -> Option<FvmCodeEntry> {
        self.entries().get(id).cloned()
    }

    /// Records the compiled routine. When two compilations race, the last
    /// one wins.
    pub fn insert(&self, id: &FvmCodeId, routine: FvmRoutine) {
        self.entries().entry(id.clone()).or_default().routine = Some(routine);
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
