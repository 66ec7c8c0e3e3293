use log::debug;
use serde::{Deserialize, Serialize};

use super::{RecordLayout, ResolveError, TypeResolver};

pub const SIZE_CLASS_TYPE: &str = "kernel::mm::heap::SizeClass";
pub const SLAB_HEADER_TYPE: &str = "kernel::mm::heap::SlabHeader";

/// Field names the decoder looks up. These are the stable names the host
/// type description has to provide.
pub mod fields {
    pub const SIZE: &str = "size";
    pub const SLAB_ORDER: &str = "slab_order";
    pub const OBJECTS_PER_SLAB: &str = "objects_per_slab";
    pub const FREE_LIST_HEAD: &str = "partial_slabs.head";
    pub const ALLOCATED: &str = "allocated";
    pub const NEXT: &str = "link.next";
}

/// Names of the two record types, overridable for allocators that live
/// under a different module path
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeNames {
    pub size_class: String,
    pub slab_header: String,
}

impl Default for TypeNames {
    fn default() -> Self {
        Self {
            size_class: SIZE_CLASS_TYPE.to_owned(),
            slab_header: SLAB_HEADER_TYPE.to_owned(),
        }
    }
}

/// An unsigned little-endian integer field, already checked to be 1 to 8
/// bytes wide and to sit inside its record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IntField {
    pub offset: u64,
    pub width: usize,
}

impl IntField {
    fn resolve(ty: &str, record: &RecordLayout, name: &str) -> Result<Self, ResolveError> {
        let field = record.field(name).ok_or_else(|| ResolveError::MissingField {
            ty: ty.to_owned(),
            field: name.to_owned(),
        })?;
        if !(1..=8).contains(&field.size) {
            return Err(ResolveError::UnsupportedFieldSize {
                ty: ty.to_owned(),
                field: name.to_owned(),
                size: field.size,
            });
        }
        let fits = field
            .offset
            .checked_add(field.size as u64)
            .is_some_and(|end| end <= record.size);
        if !fits {
            return Err(ResolveError::FieldOutOfBounds {
                ty: ty.to_owned(),
                field: name.to_owned(),
                offset: field.offset,
                record_size: record.size,
            });
        }
        Ok(Self {
            offset: field.offset,
            width: field.size,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizeClassLayout {
    /// Distance between consecutive table entries
    pub stride: u64,
    pub size: IntField,
    pub slab_order: IntField,
    pub objects_per_slab: IntField,
    pub free_list_head: IntField,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlabHeaderLayout {
    /// The bitmap starts right after the header
    pub header_size: u64,
    pub allocated: IntField,
    pub next: IntField,
}

/// Everything the decoder needs to know about the allocator's records
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeapSchema {
    pub size_class: SizeClassLayout,
    pub slab_header: SlabHeaderLayout,
}

fn resolve_record<T>(types: &T, name: &str) -> Result<RecordLayout, ResolveError>
where
    T: TypeResolver + ?Sized,
{
    let record = types.resolve_type(name)?;
    if record.size == 0 {
        return Err(ResolveError::EmptyRecord(name.to_owned()));
    }
    debug!(
        "resolved type `{name}`: {} bytes, {} fields",
        record.size,
        record.fields.len()
    );
    Ok(record)
}

impl HeapSchema {
    pub fn resolve<T>(types: &T, names: &TypeNames) -> Result<Self, ResolveError>
    where
        T: TypeResolver + ?Sized,
    {
        let ty = names.size_class.as_str();
        let record = resolve_record(types, ty)?;
        let size_class = SizeClassLayout {
            stride: record.size,
            size: IntField::resolve(ty, &record, fields::SIZE)?,
            slab_order: IntField::resolve(ty, &record, fields::SLAB_ORDER)?,
            objects_per_slab: IntField::resolve(ty, &record, fields::OBJECTS_PER_SLAB)?,
            free_list_head: IntField::resolve(ty, &record, fields::FREE_LIST_HEAD)?,
        };

        let ty = names.slab_header.as_str();
        let record = resolve_record(types, ty)?;
        let slab_header = SlabHeaderLayout {
            header_size: record.size,
            allocated: IntField::resolve(ty, &record, fields::ALLOCATED)?,
            next: IntField::resolve(ty, &record, fields::NEXT)?,
        };

        Ok(Self {
            size_class,
            slab_header,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use hashbrown::HashMap;

    use super::*;

    /// Layouts matching the kernel's `SizeClass` and `SlabHeader` on x86_64
    pub(crate) fn kernel_types() -> HashMap<String, RecordLayout> {
        let mut types = HashMap::new();
        types.insert(
            SIZE_CLASS_TYPE.to_owned(),
            RecordLayout::new(48)
                .with_field(fields::SIZE, 0, 8)
                .with_field(fields::SLAB_ORDER, 8, 8)
                .with_field(fields::OBJECTS_PER_SLAB, 16, 8)
                .with_field(fields::FREE_LIST_HEAD, 32, 8),
        );
        types.insert(
            SLAB_HEADER_TYPE.to_owned(),
            RecordLayout::new(24)
                .with_field(fields::NEXT, 0, 8)
                .with_field("link.prev", 8, 8)
                .with_field(fields::ALLOCATED, 16, 8),
        );
        types
    }

    impl TypeResolver for HashMap<String, RecordLayout> {
        fn resolve_type(&self, name: &str) -> Result<RecordLayout, ResolveError> {
            self.get(name)
                .cloned()
                .ok_or_else(|| ResolveError::UnresolvedType(name.to_owned()))
        }
    }

    #[test]
    fn resolves_kernel_layout() {
        let schema = HeapSchema::resolve(&kernel_types(), &TypeNames::default()).unwrap();
        assert_eq!(schema.size_class.stride, 48);
        assert_eq!(schema.size_class.free_list_head, IntField { offset: 32, width: 8 });
        assert_eq!(schema.slab_header.header_size, 24);
        assert_eq!(schema.slab_header.allocated, IntField { offset: 16, width: 8 });
        assert_eq!(schema.slab_header.next, IntField { offset: 0, width: 8 });
    }

    #[test]
    fn missing_type_is_fatal() {
        let mut types = kernel_types();
        types.remove(SLAB_HEADER_TYPE);
        assert_eq!(
            HeapSchema::resolve(&types, &TypeNames::default()),
            Err(ResolveError::UnresolvedType(SLAB_HEADER_TYPE.to_owned()))
        );
    }

    #[test]
    fn missing_field_is_fatal() {
        let mut types = kernel_types();
        types
            .get_mut(SLAB_HEADER_TYPE)
            .unwrap()
            .fields
            .remove(fields::NEXT);
        assert!(matches!(
            HeapSchema::resolve(&types, &TypeNames::default()),
            Err(ResolveError::MissingField { field, .. }) if field == fields::NEXT
        ));
    }

    #[test]
    fn rejects_wide_and_out_of_bounds_fields() {
        let mut types = kernel_types();
        types
            .get_mut(SIZE_CLASS_TYPE)
            .unwrap()
            .fields
            .insert(fields::SIZE.to_owned(), super::super::FieldLayout { offset: 0, size: 16 });
        assert!(matches!(
            HeapSchema::resolve(&types, &TypeNames::default()),
            Err(ResolveError::UnsupportedFieldSize { size: 16, .. })
        ));

        let mut types = kernel_types();
        types
            .get_mut(SLAB_HEADER_TYPE)
            .unwrap()
            .fields
            .insert(fields::ALLOCATED.to_owned(), super::super::FieldLayout { offset: 20, size: 8 });
        assert!(matches!(
            HeapSchema::resolve(&types, &TypeNames::default()),
            Err(ResolveError::FieldOutOfBounds { offset: 20, .. })
        ));
    }

    #[test]
    fn rejects_zero_sized_records() {
        let mut types = kernel_types();
        types.insert(SIZE_CLASS_TYPE.to_owned(), RecordLayout::new(0));
        assert_eq!(
            HeapSchema::resolve(&types, &TypeNames::default()),
            Err(ResolveError::EmptyRecord(SIZE_CLASS_TYPE.to_owned()))
        );
    }
}
