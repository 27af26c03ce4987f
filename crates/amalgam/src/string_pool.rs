//! Process-wide deduplicated string storage with reference counts.
//!
//! Labels, node comments, entity ids, and assoc keys all hold references
//! into this pool; the pool is the canonical owner of the character storage.
//! Ids are stable for the lifetime of the reference and compare in O(1).

use hashbrown::HashMap;
use std::sync::{LazyLock, Mutex};

/// A stable identifier for an interned string; defaults to
/// [`StringId::NOT_A_STRING`].
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub struct StringId(u32);

impl StringId {
    /// The id used where no string is present; never refers to storage.
    pub const NOT_A_STRING: StringId = StringId(0);
    /// The id of the empty string, interned immortally.
    pub const EMPTY_STRING: StringId = StringId(1);

    /// Returns true unless this is [`StringId::NOT_A_STRING`].
    #[inline]
    pub fn is_string(self) -> bool {
        self != StringId::NOT_A_STRING
    }

    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub(crate) fn from_index(index: usize) -> StringId {
        StringId(u32::try_from(index).expect("string pool overflowed u32 ids"))
    }
}

struct Entry {
    text: String,
    /// `usize::MAX` marks an immortal entry (reserved ids and built-in
    /// opcode keywords) that create/destroy never count.
    refcount: usize,
}

struct PoolInner {
    entries: Vec<Option<Entry>>,
    ids: HashMap<String, u32>,
    free: Vec<u32>,
}

/// The interned string pool. One mutex serializes every operation; any
/// worker thread may create or destroy references concurrently.
pub struct StringPool {
    inner: Mutex<PoolInner>,
}

impl StringPool {
    fn new() -> StringPool {
        let mut inner = PoolInner {
            entries: Vec::with_capacity(256),
            ids: HashMap::with_capacity(256),
            free: Vec::new(),
        };

        // slot 0 is NOT_A_STRING and holds no storage
        inner.entries.push(None);

        // slot 1 is the immortal empty string
        inner.entries.push(Some(Entry {
            text: String::new(),
            refcount: usize::MAX,
        }));
        inner.ids.insert(String::new(), 1);

        for &keyword in crate::node::NodeType::KEYWORDS {
            let id = inner.entries.len() as u32;
            inner.entries.push(Some(Entry {
                text: keyword.to_string(),
                refcount: usize::MAX,
            }));
            inner.ids.insert(keyword.to_string(), id);
        }

        StringPool {
            inner: Mutex::new(inner),
        }
    }

    /// Interns `s` (if new) and increments its refcount, returning its id.
    pub fn create_reference(&self, s: &str) -> StringId {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&id) = inner.ids.get(s) {
            if let Some(entry) = inner.entries[id as usize].as_mut() {
                if entry.refcount != usize::MAX {
                    entry.refcount += 1;
                }
            }
            return StringId(id);
        }

        let id = match inner.free.pop() {
            Some(id) => {
                inner.entries[id as usize] = Some(Entry {
                    text: s.to_string(),
                    refcount: 1,
                });
                id
            }
            None => {
                let id = inner.entries.len() as u32;
                inner.entries.push(Some(Entry {
                    text: s.to_string(),
                    refcount: 1,
                }));
                id
            }
        };
        inner.ids.insert(s.to_string(), id);
        StringId(id)
    }

    /// Increments the refcount of an existing id and returns it. A
    /// [`StringId::NOT_A_STRING`] passes through untouched.
    pub fn create_reference_by_id(&self, id: StringId) -> StringId {
        if !id.is_string() {
            return id;
        }
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.entries[id.index()].as_mut() {
            if entry.refcount != usize::MAX {
                entry.refcount += 1;
            }
        }
        id
    }

    /// Decrements the refcount of `id`, removing the string at zero.
    pub fn destroy_reference(&self, id: StringId) {
        if !id.is_string() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        let remove = match inner.entries[id.index()].as_mut() {
            Some(entry) if entry.refcount == usize::MAX => false,
            Some(entry) => {
                entry.refcount -= 1;
                entry.refcount == 0
            }
            None => false,
        };
        if remove {
            let entry = inner.entries[id.index()].take().unwrap();
            inner.ids.remove(&entry.text);
            inner.free.push(id.0);
        }
    }

    /// Returns the string for `id`; [`StringId::NOT_A_STRING`] and stale
    /// ids yield the empty string.
    pub fn string(&self, id: StringId) -> String {
        if !id.is_string() {
            return String::new();
        }
        let inner = self.inner.lock().unwrap();
        match inner.entries.get(id.index()) {
            Some(Some(entry)) => entry.text.clone(),
            _ => String::new(),
        }
    }

    /// Looks up the id for `s` without interning.
    pub fn id_of(&self, s: &str) -> Option<StringId> {
        let inner = self.inner.lock().unwrap();
        inner.ids.get(s).map(|&id| StringId(id))
    }

    /// Current refcount of `id`; immortal entries report `usize::MAX`.
    /// Exposed for leak checking in tests and `system mem_diagnostics`.
    pub fn reference_count(&self, id: StringId) -> usize {
        if !id.is_string() {
            return 0;
        }
        let inner = self.inner.lock().unwrap();
        match inner.entries.get(id.index()) {
            Some(Some(entry)) => entry.refcount,
            _ => 0,
        }
    }

    /// Number of live (non-immortal) strings, for `system mem_diagnostics`.
    pub fn num_dynamic_strings(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .iter()
            .flatten()
            .filter(|e| e.refcount != usize::MAX)
            .count()
    }
}

static STRING_POOL: LazyLock<StringPool> = LazyLock::new(StringPool::new);

/// The process-wide string pool service.
pub fn string_pool() -> &'static StringPool {
    &STRING_POOL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_ids() {
        let pool = string_pool();
        assert_eq!(pool.create_reference(""), StringId::EMPTY_STRING);
        assert_eq!(pool.string(StringId::NOT_A_STRING), "");
        assert_eq!(pool.string(StringId::EMPTY_STRING), "");
        // immortal; destroying is a no-op
        pool.destroy_reference(StringId::EMPTY_STRING);
        assert_eq!(pool.id_of(""), Some(StringId::EMPTY_STRING));
    }

    #[test]
    fn refcount_balance_removes_at_zero() {
        let pool = string_pool();
        let id = pool.create_reference("refcount_balance_test_string");
        let id2 = pool.create_reference("refcount_balance_test_string");
        assert_eq!(id, id2);
        assert_eq!(pool.reference_count(id), 2);

        pool.destroy_reference(id);
        assert_eq!(pool.reference_count(id), 1);
        pool.destroy_reference(id2);
        assert_eq!(pool.id_of("refcount_balance_test_string"), None);
    }

    #[test]
    fn keywords_are_pre_interned() {
        let pool = string_pool();
        let id = pool.id_of("sequence").unwrap();
        assert_eq!(pool.string(id), "sequence");
        assert_eq!(pool.reference_count(id), usize::MAX);
    }

    #[test]
    fn removal_invalidates_lookup() {
        let pool = string_pool();
        let a = pool.create_reference("slot_reuse_a");
        pool.destroy_reference(a);
        assert_eq!(pool.id_of("slot_reuse_a"), None);
        assert_eq!(pool.string(a), "");
    }
}
