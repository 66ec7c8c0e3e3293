//! Turning raw target bytes into size classes, slab headers and bitmaps.
//!
//! Every decode is a fallible read. A failed read comes back as the
//! [`AccessError`] the reader produced, untouched.

use serde::Serialize;

use super::schema::{HeapSchema, IntField};
use crate::{
    mem::{AccessError, AccessFault, MemoryReader},
    serialize::serde_addr,
    util::num::{bitmap_bytes, count_bits, count_set_bits},
};

/// One entry of the size class table
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct SizeClassDescriptor {
    pub index: usize,
    /// Where this entry lives in the target
    #[serde(with = "serde_addr")]
    pub address: u64,
    /// Bytes per object
    pub size: u64,
    pub slab_order: u64,
    pub objects_per_slab: u64,
    #[serde(with = "serde_addr")]
    pub free_list_head: u64,
}

impl SizeClassDescriptor {
    pub fn bitmap_bytes(&self) -> u64 {
        bitmap_bytes(self.objects_per_slab)
    }
}

/// The two header fields the walker cares about
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlabHeader {
    pub allocated: u64,
    pub next: u64,
}

/// A slab's allocation bitmap, one bit per object slot
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bitmap {
    bytes: Vec<u8>,
    slots: u64,
}

impl Bitmap {
    pub fn new(bytes: Vec<u8>, slots: u64) -> Self {
        Self { bytes, slots }
    }

    /// Set bits across every byte, including padding bits past `slots`
    pub fn popcount(&self) -> u64 {
        count_set_bits(&self.bytes)
    }

    /// Set bits at slot indices `>= slots` in the final byte. The allocator
    /// never sets those.
    pub fn stray_bits(&self) -> u32 {
        let used = (self.slots % 8) as u32;
        match (used, self.bytes.last()) {
            (0, _) | (_, None) => 0,
            (used, Some(&last)) => count_bits(last & !((1u8 << used) - 1)),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Offset arithmetic that cannot wrap around the address space
fn offset_addr(base: u64, offset: u64, len: usize) -> Result<u64, AccessError> {
    base.checked_add(offset)
        .ok_or(AccessError::new(base, len, AccessFault::Overflow))
}

pub struct Decoder<'a, M: ?Sized> {
    mem: &'a M,
    schema: &'a HeapSchema,
}

impl<'a, M> Decoder<'a, M>
where
    M: MemoryReader + ?Sized,
{
    pub fn new(mem: &'a M, schema: &'a HeapSchema) -> Self {
        Self { mem, schema }
    }

    pub fn schema(&self) -> &HeapSchema {
        self.schema
    }

    fn read_field(&self, record: u64, field: IntField) -> Result<u64, AccessError> {
        let address = offset_addr(record, field.offset, field.width)?;
        self.mem.read_uint_le(address, field.width)
    }

    /// Address of table entry `index`
    pub fn size_class_address(&self, table: u64, index: usize) -> Result<u64, AccessError> {
        let stride = self.schema.size_class.stride;
        (index as u64)
            .checked_mul(stride)
            .and_then(|offset| table.checked_add(offset))
            .ok_or(AccessError::new(table, stride as usize, AccessFault::Overflow))
    }

    pub fn decode_size_class(
        &self,
        table: u64,
        index: usize,
    ) -> Result<SizeClassDescriptor, AccessError> {
        let layout = &self.schema.size_class;
        let address = self.size_class_address(table, index)?;
        Ok(SizeClassDescriptor {
            index,
            address,
            size: self.read_field(address, layout.size)?,
            slab_order: self.read_field(address, layout.slab_order)?,
            objects_per_slab: self.read_field(address, layout.objects_per_slab)?,
            free_list_head: self.read_field(address, layout.free_list_head)?,
        })
    }

    /// Decode `count` consecutive entries. The first unreadable entry fails
    /// the whole call; use [`Self::decode_size_class`] to keep going past one.
    pub fn decode_size_class_table(
        &self,
        table: u64,
        count: usize,
    ) -> Result<Vec<SizeClassDescriptor>, AccessError> {
        (0..count)
            .map(|index| self.decode_size_class(table, index))
            .collect()
    }

    pub fn decode_slab_header(&self, address: u64) -> Result<SlabHeader, AccessError> {
        let layout = &self.schema.slab_header;
        Ok(SlabHeader {
            allocated: self.read_field(address, layout.allocated)?,
            next: self.read_field(address, layout.next)?,
        })
    }

    /// Where the bitmap of the slab at `header` starts
    pub fn bitmap_address(&self, header: u64) -> Result<u64, AccessError> {
        offset_addr(header, self.schema.slab_header.header_size, 0)
    }

    pub fn read_bitmap(&self, address: u64, slots: u64) -> Result<Bitmap, AccessError> {
        let len = bitmap_bytes(slots) as usize;
        Ok(Bitmap::new(self.mem.read_vec(address, len)?, slots))
    }

    pub fn bitmap_popcount(&self, address: u64, byte_len: usize) -> Result<u64, AccessError> {
        Ok(count_set_bits(&self.mem.read_vec(address, byte_len)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        layout::{schema::tests::kernel_types, TypeNames},
        mem::MemoryImage,
    };

    fn schema() -> HeapSchema {
        HeapSchema::resolve(&kernel_types(), &TypeNames::default()).unwrap()
    }

    fn entry(size: u64, order: u64, objs: u64, head: u64) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend(size.to_le_bytes());
        out.extend(order.to_le_bytes());
        out.extend(objs.to_le_bytes());
        out.extend(0u64.to_le_bytes());
        out.extend(head.to_le_bytes());
        out.extend(0u64.to_le_bytes());
        out
    }

    #[test]
    fn decodes_table_entries_at_stride() {
        let mut table = entry(16, 0, 253, 0x5000);
        table.extend(entry(32, 1, 254, 0));
        let image = MemoryImage::from_regions([(0x1000, table)]).unwrap();
        let schema = schema();
        let decoder = Decoder::new(&image, &schema);

        let classes = decoder.decode_size_class_table(0x1000, 2).unwrap();
        assert_eq!(
            classes[1],
            SizeClassDescriptor {
                index: 1,
                address: 0x1030,
                size: 32,
                slab_order: 1,
                objects_per_slab: 254,
                free_list_head: 0,
            }
        );
        assert_eq!(classes[0].free_list_head, 0x5000);
        assert_eq!(classes[0].bitmap_bytes(), 32);

        // third entry is past the captured table
        assert_eq!(
            decoder.decode_size_class_table(0x1000, 3),
            Err(AccessError::unmapped(0x1060, 8))
        );
    }

    #[test]
    fn decodes_slab_header_fields() {
        let mut header = Vec::new();
        header.extend(0x7000u64.to_le_bytes());
        header.extend(0u64.to_le_bytes());
        header.extend(3u64.to_le_bytes());
        header.extend([0b0000_0111u8, 0, 0, 0]);
        let image = MemoryImage::from_regions([(0x6000, header)]).unwrap();
        let schema = schema();
        let decoder = Decoder::new(&image, &schema);

        assert_eq!(
            decoder.decode_slab_header(0x6000).unwrap(),
            SlabHeader {
                allocated: 3,
                next: 0x7000
            }
        );
        let bitmap_addr = decoder.bitmap_address(0x6000).unwrap();
        assert_eq!(bitmap_addr, 0x6018);
        assert_eq!(decoder.bitmap_popcount(bitmap_addr, 4).unwrap(), 3);
        assert!(decoder.decode_slab_header(0x7000).is_err());
    }

    #[test]
    fn narrow_fields_are_zero_extended() {
        let mut types = kernel_types();
        let sc = types
            .get_mut(crate::layout::schema::SIZE_CLASS_TYPE)
            .unwrap();
        sc.fields.get_mut("slab_order").unwrap().size = 1;
        let schema = HeapSchema::resolve(&types, &TypeNames::default()).unwrap();
        let image = MemoryImage::from_regions([(0x1000, entry(16, 0xff03, 8, 0))]).unwrap();
        let decoder = Decoder::new(&image, &schema);
        assert_eq!(decoder.decode_size_class(0x1000, 0).unwrap().slab_order, 3);
    }

    #[test]
    fn stray_bits_only_count_padding() {
        assert_eq!(Bitmap::new(vec![0xff, 0x01], 9).stray_bits(), 0);
        assert_eq!(Bitmap::new(vec![0xff, 0x03], 9).stray_bits(), 1);
        assert_eq!(Bitmap::new(vec![0xff, 0xff], 16).stray_bits(), 0);
        assert_eq!(Bitmap::new(vec![0xf0], 4).stray_bits(), 4);
        assert_eq!(Bitmap::new(vec![], 0).stray_bits(), 0);
        assert_eq!(Bitmap::new(vec![0xf0], 4).popcount(), 4);
    }

    #[test]
    fn table_address_overflow_is_an_access_error() {
        let image = MemoryImage::new();
        let schema = schema();
        let decoder = Decoder::new(&image, &schema);
        assert_eq!(
            decoder.decode_size_class(u64::MAX - 8, 1).unwrap_err().reason,
            AccessFault::Overflow
        );
    }
}
