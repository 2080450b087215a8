//! Identifier interning.
//!
//! Attribute and global names are interned to small integers so that name
//! equality is integer equality and attribute dictionaries can key on a
//! 4-byte id. The low id range is reserved: ids `0..MAGIC_SLOT_COUNT` are
//! the canonical magic-method names, in [`MagicSlot`] order, so a `Name`
//! can be tested for magic-ness without a table lookup.

use ahash::AHashMap;
use strum::IntoEnumIterator;

use crate::types::{MAGIC_SLOT_COUNT, MagicSlot};

/// An interned identifier. Equality is integer equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Name(u32);

impl Name {
    /// Returns the raw id.
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// The reserved id of a magic-slot name.
    #[inline]
    #[must_use]
    pub fn from_magic(slot: MagicSlot) -> Self {
        Self(slot as u32)
    }

    /// The magic slot this name maps to, if it is one of the reserved ids.
    #[inline]
    #[must_use]
    pub fn as_magic(self) -> Option<MagicSlot> {
        if (self.0 as usize) < MAGIC_SLOT_COUNT {
            MagicSlot::from_repr(self.0 as u8)
        } else {
            None
        }
    }
}

/// The intern table. One per VM; `Name` ids are meaningless across VMs.
#[derive(Debug)]
pub struct Interns {
    /// Canonical string for each id, indexed by `Name`.
    strings: Vec<Box<str>>,
    /// Reverse lookup.
    lookup: AHashMap<Box<str>, Name>,
}

impl Interns {
    /// Builds a table with the magic-slot names pre-interned at their
    /// reserved ids.
    #[must_use]
    pub fn new() -> Self {
        let mut interns = Self {
            strings: Vec::with_capacity(MAGIC_SLOT_COUNT + 64),
            lookup: AHashMap::with_capacity(MAGIC_SLOT_COUNT + 64),
        };
        for slot in MagicSlot::iter() {
            let name = interns.intern(slot.as_str());
            debug_assert_eq!(name, Name::from_magic(slot));
        }
        interns
    }

    /// Interns `s`, returning its id. Idempotent.
    pub fn intern(&mut self, s: &str) -> Name {
        if let Some(&name) = self.lookup.get(s) {
            return name;
        }
        let id = u32::try_from(self.strings.len()).expect("intern table exceeds u32");
        let boxed: Box<str> = s.into();
        self.strings.push(boxed.clone());
        self.lookup.insert(boxed, Name(id));
        Name(id)
    }

    /// Looks up an already-interned string without inserting.
    #[must_use]
    pub fn try_get(&self, s: &str) -> Option<Name> {
        self.lookup.get(s).copied()
    }

    /// The canonical string of an interned name.
    #[must_use]
    pub fn str_of(&self, name: Name) -> &str {
        &self.strings[name.index()]
    }

    /// Number of interned names (including the reserved magic range).
    #[must_use]
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    /// Always false; the magic range is pre-interned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }
}

impl Default for Interns {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_is_idempotent() {
        let mut interns = Interns::new();
        let a = interns.intern("spam");
        let b = interns.intern("spam");
        assert_eq!(a, b);
        assert_eq!(interns.str_of(a), "spam");
    }

    #[test]
    fn test_magic_names_occupy_reserved_range() {
        let mut interns = Interns::new();
        let add = interns.intern("__add__");
        assert_eq!(add.as_magic(), Some(MagicSlot::Add));
        let iter = interns.intern("__iter__");
        assert_eq!(iter.as_magic(), Some(MagicSlot::Iter));
        let plain = interns.intern("banana");
        assert_eq!(plain.as_magic(), None);
    }
}
