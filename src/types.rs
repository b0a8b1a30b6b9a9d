//! Core data types shared by the merge, split, regroup and session layers
//!
//! # Key Types
//!
//! - **`Term`**: A field value, either a signed 64-bit integer or a byte string
//! - **`TermRef`**: Borrowed view of a term, used on hot paths to avoid copies
//! - **`Field`**: Field name plus its type tag
//! - **`DocId`** / **`GroupId`**: Dense document and group identifiers
//! - **`StatVector`**: Fixed-length per-group statistic tuple
//!
//! # Example
//!
//! ```rust
//! use ftgs_engine::types::{Field, FieldType, Term};
//!
//! let field = Field::int("country_id");
//! assert_eq!(field.field_type, FieldType::Int);
//!
//! // Integer terms order numerically, byte terms lexicographically
//! assert!(Term::Int(-3) < Term::Int(2));
//! assert!(Term::from("apple") < Term::from("banana"));
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Dense document identifier within one shard
pub type DocId = u32;

/// Group identifier; group 0 means "not selected"
pub type GroupId = u32;

/// Sentinel group for documents excluded from aggregation
pub const NO_GROUP: GroupId = 0;

/// Exclusive bound on group ids, so a group count always fits an `i32`
pub const MAX_NUM_GROUPS: u32 = i32::MAX as u32;

/// Aggregate document frequency for one term
pub type DocFreq = u64;

/// Per-group statistic values, one slot per active stat in push order
pub type StatVector = Vec<i64>;

// ============================================================================
// Field
// ============================================================================

/// Type tag for a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    /// 64-bit signed integer terms
    Int,
    /// Byte-string terms
    String,
}

impl FieldType {
    /// Wire flag for this field type
    pub fn wire_flag(self) -> u8 {
        match self {
            FieldType::Int => 0,
            FieldType::String => 1,
        }
    }

    /// Decode a wire flag
    pub fn from_wire_flag(flag: u8) -> Option<Self> {
        match flag {
            0 => Some(FieldType::Int),
            1 => Some(FieldType::String),
            _ => None,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Int => write!(f, "int"),
            FieldType::String => write!(f, "string"),
        }
    }
}

/// A named, typed field
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Field {
    /// Field name
    pub name: String,
    /// Term type of the field
    pub field_type: FieldType,
}

impl Field {
    /// Create a field
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }

    /// Create an integer field
    pub fn int(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Int)
    }

    /// Create a string field
    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::String)
    }

    /// Whether the field carries integer terms
    pub fn is_int(&self) -> bool {
        self.field_type == FieldType::Int
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.field_type)
    }
}

// ============================================================================
// Term
// ============================================================================

/// A term value
///
/// Ordering is numeric for `Int` and lexicographic by byte for `Bytes`.
/// Terms of one field always share a variant, so the derived cross-variant
/// order is never observed by the merge.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Term {
    /// Integer term
    Int(i64),
    /// Byte-string term
    Bytes(Vec<u8>),
}

impl Term {
    /// Borrow this term
    pub fn as_ref(&self) -> TermRef<'_> {
        match self {
            Term::Int(v) => TermRef::Int(*v),
            Term::Bytes(b) => TermRef::Bytes(b),
        }
    }

    /// Type tag matching this term
    pub fn field_type(&self) -> FieldType {
        match self {
            Term::Int(_) => FieldType::Int,
            Term::Bytes(_) => FieldType::String,
        }
    }
}

impl From<i64> for Term {
    fn from(v: i64) -> Self {
        Term::Int(v)
    }
}

impl From<&str> for Term {
    fn from(s: &str) -> Self {
        Term::Bytes(s.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for Term {
    fn from(b: Vec<u8>) -> Self {
        Term::Bytes(b)
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Int(v) => write!(f, "{}", v),
            Term::Bytes(b) => write!(f, "{}", String::from_utf8_lossy(b)),
        }
    }
}

/// Borrowed term view
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TermRef<'a> {
    /// Integer term
    Int(i64),
    /// Byte-string term
    Bytes(&'a [u8]),
}

impl TermRef<'_> {
    /// Copy into an owned term
    pub fn to_owned(self) -> Term {
        match self {
            TermRef::Int(v) => Term::Int(v),
            TermRef::Bytes(b) => Term::Bytes(b.to_vec()),
        }
    }
}

/// Ordering key types that a term source can produce
///
/// Implemented for `i64` (integer fields), `Vec<u8>` (string fields) and the
/// tagged [`Term`] used where a field's type is only known at runtime.
pub trait TermKey: Ord + Clone + Send + fmt::Debug {
    /// Borrowed view of this key
    fn term_ref(&self) -> TermRef<'_>;
}

impl TermKey for i64 {
    fn term_ref(&self) -> TermRef<'_> {
        TermRef::Int(*self)
    }
}

impl TermKey for Vec<u8> {
    fn term_ref(&self) -> TermRef<'_> {
        TermRef::Bytes(self)
    }
}

impl TermKey for Term {
    fn term_ref(&self) -> TermRef<'_> {
        self.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_term_ordering() {
        assert!(Term::Int(-10) < Term::Int(-1));
        assert!(Term::Int(i64::MIN) < Term::Int(i64::MAX));
        assert!(Term::from("a") < Term::from("ab"));
        assert!(Term::Bytes(vec![0x7f]) < Term::Bytes(vec![0x80]));
    }

    #[test]
    fn test_term_ref_roundtrip() {
        let term = Term::from("hello");
        assert_eq!(term.as_ref().to_owned(), term);
        assert_eq!(Term::Int(7).as_ref(), TermRef::Int(7));
    }

    #[test]
    fn test_field_wire_flag() {
        for ty in [FieldType::Int, FieldType::String] {
            assert_eq!(FieldType::from_wire_flag(ty.wire_flag()), Some(ty));
        }
        assert_eq!(FieldType::from_wire_flag(9), None);
    }

    #[test]
    fn test_field_display() {
        assert_eq!(Field::string("query").to_string(), "query:string");
    }
}
