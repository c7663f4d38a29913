//! In-process key-value store.
//!
//! Keys are composite: the caller supplies a `prefix` and a `key`, joined
//! with `:` into the lookup key. Values are either scalars (byte strings) or
//! vectors (ordered segments), and can be stored by deep copy or by sharing
//! the caller's allocation — the sharing the original expressed with raw
//! pointer references is expressed here with [`Rc`], so pointer identity is
//! observable through [`Rc::ptr_eq`] without any lifetime entanglement.
//!
//! A `merge` request flattens vector input into one contiguous value; merged
//! shared input additionally keeps a span table describing where each
//! original segment landed (see [`KvValue::Merged`]).
//!
//! The store also registers as a resource type ([`KV_STORE`]) so a worker
//! can mount one in its resource tree and look it up by type.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::ops::Range;
use std::rc::Rc;

use crate::resource::{Resource, ResourceError, ResourceFlags, ResourceType};

/// Separator between the key prefix and the key proper.
pub const KEY_JOIN: &str = ":";

/// Hash backend parameters.
#[derive(Debug, Clone, Copy)]
pub struct KvStoreParams {
    /// Initial capacity of the hash table.
    pub initial_size: usize,
}

impl Default for KvStoreParams {
    fn default() -> Self {
        Self { initial_size: 32 }
    }
}

/// Value input for [`KvStore::set`]; the variant selects scalar vs vector
/// and copy vs shared semantics.
pub enum KvInput<'a> {
    /// Scalar, deep-copied into the store.
    Bytes(&'a [u8]),
    /// Scalar, stored as a shared reference to the caller's allocation.
    SharedBytes(Rc<[u8]>),
    /// Vector, every segment deep-copied.
    Segments(&'a [&'a [u8]]),
    /// Vector, the caller's segment table stored as a shared reference.
    SharedSegments(Rc<[Rc<[u8]>]>),
}

/// A stored value.
#[derive(Debug, Clone)]
pub enum KvValue {
    /// A contiguous byte string.
    Bytes(Rc<[u8]>),
    /// An ordered list of segments.
    Segments(Rc<[Rc<[u8]>]>),
    /// Vector input merged into one contiguous value, with a span table
    /// locating each original segment inside it.
    Merged {
        /// The concatenated bytes.
        data: Rc<[u8]>,
        /// One byte range per original segment.
        spans: Rc<[Range<usize>]>,
    },
}

impl KvValue {
    /// Returns the contiguous bytes of a scalar or merged value.
    #[must_use]
    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) | Self::Merged { data: b, .. } => Some(b),
            Self::Segments(_) => None,
        }
    }

    /// Iterates over the value's segments; a scalar yields itself once.
    pub fn segments(&self) -> impl Iterator<Item = &[u8]> + '_ {
        KvSegments {
            value: self,
            next: 0,
        }
    }
}

struct KvSegments<'a> {
    value: &'a KvValue,
    next: usize,
}

impl<'a> Iterator for KvSegments<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.next;
        self.next += 1;
        match self.value {
            KvValue::Bytes(b) => (index == 0).then_some(&b[..]),
            KvValue::Segments(segs) => segs.get(index).map(|s| &s[..]),
            KvValue::Merged { data, spans } => {
                spans.get(index).map(|span| &data[span.clone()])
            },
        }
    }
}

/// How a value was stored; reported back through iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KvFlags {
    /// Vector input.
    pub vector: bool,
    /// Stored by reference (shared with the caller's allocation).
    pub reference: bool,
    /// Vector segments merged into one contiguous value.
    pub merge: bool,
}

/// Called on an existing key during [`KvStore::set`]; returning `false`
/// keeps the old value.
pub type DupResolver<'a> = &'a mut dyn FnMut(&str, &str, &KvValue, &KvValue) -> bool;

/// Called before [`KvStore::unset`] removes a value; returning `false`
/// declines the removal.
pub type UnsetResolver<'a> = &'a mut dyn FnMut(&str, &str, &KvValue) -> bool;

/// Errors produced by the store.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum KvStoreError {
    /// No value is stored under the composite key.
    #[error("key not found")]
    NotFound,
    /// The unset resolver declined the removal.
    #[error("removal declined by resolver")]
    Declined,
}

#[derive(Debug, Clone)]
struct KvEntry {
    value: KvValue,
    size: usize,
    flags: KvFlags,
}

/// One item yielded by the snapshot iterator.
#[derive(Debug, Clone)]
pub struct KvItem {
    /// The composite key (`prefix:key`).
    pub key: String,
    /// The stored value.
    pub value: KvValue,
    /// Stored size: byte length for contiguous values, segment count for
    /// vector values.
    pub size: usize,
    /// Storage flags.
    pub flags: KvFlags,
}

/// The hash-backed store.
#[derive(Debug, Default)]
pub struct KvStore {
    entries: HashMap<String, KvEntry>,
}

impl KvStore {
    /// Creates a store sized for `params.initial_size` entries.
    #[must_use]
    pub fn new(params: KvStoreParams) -> Self {
        Self {
            entries: HashMap::with_capacity(params.initial_size),
        }
    }

    /// Stores a value under `prefix:key` and returns a reference to the
    /// stored value.
    ///
    /// When the key already exists and `resolver` is given, it decides
    /// whether the new value replaces the old one; without a resolver the
    /// new value always wins.
    pub fn set(
        &mut self,
        prefix: &str,
        key: &str,
        input: KvInput<'_>,
        merge: bool,
        resolver: Option<DupResolver<'_>>,
    ) -> &KvValue {
        let (value, size, flags) = build_value(input, merge);
        let composite = composite_key(prefix, key);
        let entry = KvEntry { value, size, flags };

        match self.entries.entry(composite) {
            Entry::Vacant(slot) => &slot.insert(entry).value,
            Entry::Occupied(mut slot) => {
                if let Some(resolve) = resolver {
                    if !resolve(prefix, key, &slot.get().value, &entry.value) {
                        return &slot.into_mut().value;
                    }
                }
                slot.insert(entry);
                &slot.into_mut().value
            },
        }
    }

    /// Looks up `prefix:key`, returning the stored value and its size.
    #[must_use]
    pub fn get(&self, prefix: &str, key: &str) -> Option<(&KvValue, usize)> {
        self.entries
            .get(&composite_key(prefix, key))
            .map(|e| (&e.value, e.size))
    }

    /// Removes `prefix:key`, consulting `resolver` first when given.
    ///
    /// # Errors
    ///
    /// [`KvStoreError::NotFound`] for an absent key,
    /// [`KvStoreError::Declined`] when the resolver refuses.
    pub fn unset(
        &mut self,
        prefix: &str,
        key: &str,
        resolver: Option<UnsetResolver<'_>>,
    ) -> Result<(), KvStoreError> {
        let composite = composite_key(prefix, key);
        let entry = self.entries.get(&composite).ok_or(KvStoreError::NotFound)?;
        if let Some(resolve) = resolver {
            if !resolve(prefix, key, &entry.value) {
                return Err(KvStoreError::Declined);
            }
        }
        self.entries.remove(&composite);
        Ok(())
    }

    /// Number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns a snapshot iterator over the store. The snapshot is taken at
    /// creation time; mutations after that do not affect iteration.
    #[must_use]
    pub fn iter(&self) -> std::vec::IntoIter<KvItem> {
        let mut items: Vec<KvItem> = self
            .entries
            .iter()
            .map(|(key, entry)| KvItem {
                key: key.clone(),
                value: entry.value.clone(),
                size: entry.size,
                flags: entry.flags,
            })
            .collect();
        items.sort_by(|a, b| a.key.cmp(&b.key));
        items.into_iter()
    }
}

fn composite_key(prefix: &str, key: &str) -> String {
    format!("{prefix}{KEY_JOIN}{key}")
}

/// Applies the copy/reference/merge rules to the input.
fn build_value(input: KvInput<'_>, merge: bool) -> (KvValue, usize, KvFlags) {
    match input {
        // Merge has no effect on scalar input.
        KvInput::Bytes(bytes) => (
            KvValue::Bytes(Rc::from(bytes)),
            bytes.len(),
            KvFlags {
                vector: false,
                reference: false,
                merge: false,
            },
        ),
        KvInput::SharedBytes(bytes) => {
            let size = bytes.len();
            (
                KvValue::Bytes(bytes),
                size,
                KvFlags {
                    vector: false,
                    reference: true,
                    merge: false,
                },
            )
        },
        KvInput::Segments(segments) => {
            if merge {
                let data: Vec<u8> = segments.concat();
                let size = data.len();
                (
                    KvValue::Bytes(Rc::from(data.as_slice())),
                    size,
                    KvFlags {
                        vector: true,
                        reference: false,
                        merge: true,
                    },
                )
            } else {
                let copied: Vec<Rc<[u8]>> =
                    segments.iter().map(|s| Rc::from(*s)).collect();
                let size = copied.len();
                (
                    KvValue::Segments(Rc::from(copied.as_slice())),
                    size,
                    KvFlags {
                        vector: true,
                        reference: false,
                        merge: false,
                    },
                )
            }
        },
        KvInput::SharedSegments(segments) => {
            if merge {
                let mut data = Vec::new();
                let mut spans = Vec::with_capacity(segments.len());
                for segment in segments.iter() {
                    let start = data.len();
                    data.extend_from_slice(segment);
                    spans.push(start..data.len());
                }
                let size = segments.len();
                (
                    KvValue::Merged {
                        data: Rc::from(data.as_slice()),
                        spans: Rc::from(spans.as_slice()),
                    },
                    size,
                    KvFlags {
                        vector: true,
                        reference: true,
                        merge: true,
                    },
                )
            } else {
                let size = segments.len();
                (
                    KvValue::Segments(segments),
                    size,
                    KvFlags {
                        vector: true,
                        reference: true,
                        merge: false,
                    },
                )
            }
        },
    }
}

/// Resource type descriptor for a mounted store.
pub static KV_STORE: ResourceType = ResourceType {
    name: "kv-store",
    owns_event_loop: false,
    has_watchdog: false,
};

/// Mounts a [`KvStore`] as a child resource of `parent`.
///
/// # Errors
///
/// Propagates resource-creation failures.
pub fn create_kv_store(
    parent: &Rc<Resource>,
    id: &str,
    params: KvStoreParams,
) -> Result<Rc<Resource>, ResourceError> {
    Resource::create(Some(parent), &KV_STORE, ResourceFlags::NONE, id, |_| {
        Ok(KvStore::new(params))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_copy_is_a_distinct_allocation() {
        let mut store = KvStore::new(KvStoreParams::default());
        let input: Rc<[u8]> = Rc::from(&b"value"[..]);

        store.set("p", "k", KvInput::Bytes(&input), false, None);
        let (value, size) = store.get("p", "k").unwrap();
        assert_eq!(size, 5);
        let KvValue::Bytes(stored) = value else {
            panic!("scalar expected")
        };
        assert_eq!(&stored[..], b"value");
        assert!(!Rc::ptr_eq(stored, &input));
    }

    #[test]
    fn scalar_reference_shares_the_allocation() {
        let mut store = KvStore::new(KvStoreParams::default());
        let input: Rc<[u8]> = Rc::from(&b"value"[..]);

        store.set("p", "k", KvInput::SharedBytes(Rc::clone(&input)), false, None);
        let (value, _) = store.get("p", "k").unwrap();
        let KvValue::Bytes(stored) = value else {
            panic!("scalar expected")
        };
        assert!(Rc::ptr_eq(stored, &input));
    }

    #[test]
    fn scalar_merge_flag_is_ignored() {
        let mut store = KvStore::new(KvStoreParams::default());
        store.set("p", "k", KvInput::Bytes(b"value"), true, None);
        let (value, size) = store.get("p", "k").unwrap();
        assert_eq!(size, 5);
        assert_eq!(value.bytes(), Some(&b"value"[..]));
    }

    #[test]
    fn vector_copy_duplicates_every_segment() {
        let mut store = KvStore::new(KvStoreParams::default());
        store.set(
            "p",
            "k",
            KvInput::Segments(&[b"aa", b"bb", b"cc"]),
            false,
            None,
        );
        let (value, size) = store.get("p", "k").unwrap();
        assert_eq!(size, 3);
        let collected: Vec<&[u8]> = value.segments().collect();
        assert_eq!(collected, vec![&b"aa"[..], &b"bb"[..], &b"cc"[..]]);
    }

    #[test]
    fn vector_merge_concatenates() {
        let mut store = KvStore::new(KvStoreParams::default());
        store.set(
            "p",
            "k",
            KvInput::Segments(&[b"aa", b"bb", b"cc"]),
            true,
            None,
        );
        let (value, size) = store.get("p", "k").unwrap();
        assert_eq!(size, 6);
        assert_eq!(value.bytes(), Some(&b"aabbcc"[..]));
    }

    #[test]
    fn shared_vector_keeps_callers_table() {
        let mut store = KvStore::new(KvStoreParams::default());
        let table: Rc<[Rc<[u8]>]> =
            Rc::from(vec![Rc::from(&b"aa"[..]), Rc::from(&b"bb"[..])].as_slice());

        store.set(
            "p",
            "k",
            KvInput::SharedSegments(Rc::clone(&table)),
            false,
            None,
        );
        let (value, size) = store.get("p", "k").unwrap();
        assert_eq!(size, 2);
        let KvValue::Segments(stored) = value else {
            panic!("vector expected")
        };
        assert!(Rc::ptr_eq(stored, &table));
    }

    #[test]
    fn shared_vector_merge_builds_span_table() {
        let mut store = KvStore::new(KvStoreParams::default());
        let table: Rc<[Rc<[u8]>]> =
            Rc::from(vec![Rc::from(&b"aa"[..]), Rc::from(&b"bbb"[..])].as_slice());

        store.set("p", "k", KvInput::SharedSegments(table), true, None);
        let (value, size) = store.get("p", "k").unwrap();
        assert_eq!(size, 2);
        let KvValue::Merged { data, spans } = value else {
            panic!("merged expected")
        };
        assert_eq!(&data[..], b"aabbb");
        assert_eq!(spans[0], 0..2);
        assert_eq!(spans[1], 2..5);
        let collected: Vec<&[u8]> = value.segments().collect();
        assert_eq!(collected, vec![&b"aa"[..], &b"bbb"[..]]);
    }

    #[test]
    fn resolver_keeps_or_replaces() {
        let mut store = KvStore::new(KvStoreParams::default());
        store.set("p", "k", KvInput::Bytes(b"old"), false, None);

        let mut keep = |_: &str, _: &str, _: &KvValue, _: &KvValue| false;
        store.set("p", "k", KvInput::Bytes(b"new"), false, Some(&mut keep));
        assert_eq!(store.get("p", "k").unwrap().0.bytes(), Some(&b"old"[..]));

        let mut replace = |_: &str, _: &str, _: &KvValue, _: &KvValue| true;
        store.set("p", "k", KvInput::Bytes(b"new"), false, Some(&mut replace));
        assert_eq!(store.get("p", "k").unwrap().0.bytes(), Some(&b"new"[..]));

        // Default without a resolver is replace.
        store.set("p", "k", KvInput::Bytes(b"newer"), false, None);
        assert_eq!(store.get("p", "k").unwrap().0.bytes(), Some(&b"newer"[..]));
    }

    #[test]
    fn unset_respects_resolver() {
        let mut store = KvStore::new(KvStoreParams::default());
        store.set("p", "k", KvInput::Bytes(b"value"), false, None);

        let mut decline = |_: &str, _: &str, _: &KvValue| false;
        assert_eq!(
            store.unset("p", "k", Some(&mut decline)),
            Err(KvStoreError::Declined)
        );
        assert!(store.get("p", "k").is_some());

        assert_eq!(store.unset("p", "k", None), Ok(()));
        assert!(store.get("p", "k").is_none());
        assert_eq!(store.unset("p", "k", None), Err(KvStoreError::NotFound));
    }

    #[test]
    fn keys_are_composite() {
        let mut store = KvStore::new(KvStoreParams::default());
        store.set("a", "k", KvInput::Bytes(b"1"), false, None);
        store.set("b", "k", KvInput::Bytes(b"2"), false, None);
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("a", "k").unwrap().0.bytes(), Some(&b"1"[..]));
        assert_eq!(store.get("b", "k").unwrap().0.bytes(), Some(&b"2"[..]));
    }

    #[test]
    fn iteration_is_a_snapshot() {
        let mut store = KvStore::new(KvStoreParams::default());
        store.set("p", "a", KvInput::Bytes(b"1"), false, None);
        store.set("p", "b", KvInput::Bytes(b"2"), false, None);

        let iter = store.iter();
        store.set("p", "c", KvInput::Bytes(b"3"), false, None);

        let keys: Vec<String> = iter.map(|item| item.key).collect();
        assert_eq!(keys, vec!["p:a".to_string(), "p:b".to_string()]);
    }
}
