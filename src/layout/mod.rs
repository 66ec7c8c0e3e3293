//! Record layouts and the host facilities that supply them.
//!
//! Nothing about the allocator's structures is compiled in. Offsets and
//! widths come from the host at run time, get checked once in
//! [`schema::HeapSchema::resolve`], and are then passed explicitly into the
//! decoder.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod decode;
pub mod schema;

pub use decode::{Bitmap, Decoder, SizeClassDescriptor, SlabHeader};
pub use schema::{HeapSchema, IntField, TypeNames};

/// Where one field lives inside a record
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldLayout {
    pub offset: u64,
    pub size: usize,
}

/// Total size of a record plus its fields. Nested fields are flattened with
/// dotted names, e.g. `link.next`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordLayout {
    pub size: u64,
    #[serde(default)]
    pub fields: HashMap<String, FieldLayout>,
}

impl RecordLayout {
    pub fn new(size: u64) -> Self {
        Self {
            size,
            fields: HashMap::new(),
        }
    }

    pub fn with_field(mut self, name: &str, offset: u64, size: usize) -> Self {
        self.fields.insert(name.to_owned(), FieldLayout { offset, size });
        self
    }

    pub fn field(&self, name: &str) -> Option<FieldLayout> {
        self.fields.get(name).copied()
    }
}

/// Resolution failures. All of these are fatal for a whole run: without the
/// table address or a record shape, nothing read afterwards can be trusted.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("symbol `{0}` not found")]
    UnresolvedSymbol(String),
    #[error("type `{0}` not found")]
    UnresolvedType(String),
    #[error("type `{ty}` has no field `{field}`")]
    MissingField { ty: String, field: String },
    #[error("field `{ty}.{field}` is {size} bytes wide; integer fields must be 1 to 8 bytes")]
    UnsupportedFieldSize {
        ty: String,
        field: String,
        size: usize,
    },
    #[error("field `{ty}.{field}` at offset {offset} does not fit in a {record_size} byte record")]
    FieldOutOfBounds {
        ty: String,
        field: String,
        offset: u64,
        record_size: u64,
    },
    #[error("type `{0}` has size zero")]
    EmptyRecord(String),
}

/// Symbol-to-address lookup
pub trait SymbolResolver {
    fn resolve_symbol(&self, name: &str) -> Result<u64, ResolveError>;
}

/// Type-name-to-layout lookup
pub trait TypeResolver {
    fn resolve_type(&self, name: &str) -> Result<RecordLayout, ResolveError>;
}

impl<T> SymbolResolver for &T
where
    T: SymbolResolver + ?Sized,
{
    fn resolve_symbol(&self, name: &str) -> Result<u64, ResolveError> {
        (**self).resolve_symbol(name)
    }
}

impl<T> TypeResolver for &T
where
    T: TypeResolver + ?Sized,
{
    fn resolve_type(&self, name: &str) -> Result<RecordLayout, ResolveError> {
        (**self).resolve_type(name)
    }
}
