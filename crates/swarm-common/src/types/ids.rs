//! Opaque 128-bit identifiers and their typed wrappers.
//!
//! Records and chunks are keyed by 128-bit hashes. The raw `Id` is stored
//! as two 64-bit words, which is also its serialized form. Typed wrappers
//! (`ChunkId`, `RecordId`) prevent accidental cross-use of key spaces.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How many hex digits of an id to show in debug output.
const ID_PRINT_LEN: usize = 10;

/// An opaque 128-bit identifier.
///
/// Valid ids are never zero; the all-zero value is the `INVALID` sentinel.
/// The serialized form is two 64-bit words, high word first.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Id {
    high: u64,
    low: u64,
}

impl Id {
    /// Invalid id, used as a sentinel value.
    pub const INVALID: Self = Self { high: 0, low: 0 };

    /// Creates an id from its two 64-bit words.
    #[inline]
    #[must_use]
    pub const fn from_words(high: u64, low: u64) -> Self {
        Self { high, low }
    }

    /// Returns the two 64-bit words, high word first.
    #[inline]
    #[must_use]
    pub const fn words(self) -> (u64, u64) {
        (self.high, self.low)
    }

    /// Generates a fresh random id.
    ///
    /// The result is guaranteed valid (non-zero).
    #[must_use]
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        loop {
            let id = Self {
                high: rng.gen(),
                low: rng.gen(),
            };
            if id.is_valid() {
                return id;
            }
        }
    }

    /// Creates an id from a small integer, for deterministic test fixtures.
    #[inline]
    #[must_use]
    pub const fn from_u64(value: u64) -> Self {
        Self {
            high: 0,
            low: value,
        }
    }

    /// Checks if this is a valid id.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.high != 0 || self.low != 0
    }

    /// Returns the full 32-character hex representation.
    #[must_use]
    pub fn hex_string(&self) -> String {
        format!("{:016x}{:016x}", self.high, self.low)
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_valid() {
            write!(f, "Id(INVALID)")
        } else {
            write!(f, "Id({})", &self.hex_string()[..ID_PRINT_LEN])
        }
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.hex_string()[..ID_PRINT_LEN])
    }
}

macro_rules! typed_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[repr(transparent)]
        pub struct $name(Id);

        impl $name {
            /// Invalid id, used as a sentinel value.
            pub const INVALID: Self = Self(Id::INVALID);

            /// Wraps a raw id.
            #[inline]
            #[must_use]
            pub const fn new(id: Id) -> Self {
                Self(id)
            }

            /// Generates a fresh random id.
            #[must_use]
            pub fn generate() -> Self {
                Self(Id::generate())
            }

            /// Creates an id from a small integer, for test fixtures.
            #[inline]
            #[must_use]
            pub const fn from_u64(value: u64) -> Self {
                Self(Id::from_u64(value))
            }

            /// Returns the underlying raw id.
            #[inline]
            #[must_use]
            pub const fn as_id(self) -> Id {
                self.0
            }

            /// Checks if this is a valid id.
            #[inline]
            #[must_use]
            pub const fn is_valid(self) -> bool {
                self.0.is_valid()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if !self.is_valid() {
                    write!(f, concat!(stringify!($name), "(INVALID)"))
                } else {
                    write!(
                        f,
                        concat!(stringify!($name), "({})"),
                        &self.0.hex_string()[..ID_PRINT_LEN]
                    )
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Id> for $name {
            #[inline]
            fn from(id: Id) -> Self {
                Self(id)
            }
        }

        impl From<$name> for Id {
            #[inline]
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

typed_id!(
    /// Identifies a chunk, the unit of replication.
    ChunkId
);

typed_id!(
    /// Identifies a record within a table.
    RecordId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_words_roundtrip() {
        let id = Id::from_words(0xdead_beef, 42);
        assert_eq!(id.words(), (0xdead_beef, 42));
        assert!(id.is_valid());
    }

    #[test]
    fn test_invalid_id() {
        assert!(!Id::INVALID.is_valid());
        assert!(!ChunkId::INVALID.is_valid());
        assert!(!RecordId::INVALID.is_valid());
        assert_eq!(Id::INVALID.words(), (0, 0));
    }

    #[test]
    fn test_generate_is_valid_and_distinct() {
        let a = Id::generate();
        let b = Id::generate();
        assert!(a.is_valid());
        assert!(b.is_valid());
        assert_ne!(a, b);
    }

    #[test]
    fn test_ordering_is_lexicographic_by_words() {
        assert!(Id::from_words(0, 1) < Id::from_words(0, 2));
        assert!(Id::from_words(0, u64::MAX) < Id::from_words(1, 0));
    }

    #[test]
    fn test_typed_wrappers() {
        let raw = Id::from_u64(7);
        let chunk = ChunkId::new(raw);
        let record = RecordId::new(raw);
        assert_eq!(chunk.as_id(), record.as_id());
        assert_eq!(Id::from(chunk), raw);
    }

    #[test]
    fn test_debug_truncates() {
        let id = Id::from_words(u64::MAX, u64::MAX);
        let debug = format!("{:?}", id);
        assert!(debug.starts_with("Id(ffffffffff"));
        assert_eq!(format!("{:?}", Id::INVALID), "Id(INVALID)");
    }
}
