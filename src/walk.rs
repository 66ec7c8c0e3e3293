//! Walking every size class's partial-slab list and cross-checking each slab.
//!
//! A list is walked one link at a time. Each link is classified into a
//! [`LinkStep`] before anything is read through it, so the sentinel check
//! cannot be skipped.

use hashbrown::HashSet;
use log::{debug, info, trace, warn};
use serde::Serialize;
use thiserror::Error;

use crate::{
    layout::{
        Decoder, HeapSchema, ResolveError, SizeClassDescriptor, SymbolResolver, TypeNames,
        TypeResolver,
    },
    mem::{AccessError, MemoryReader},
    serialize::serde_addr,
    util::num::is_aligned,
};

pub const TABLE_SYMBOL: &str = "kernel::mm::heap::ALLOCATOR";
pub const SIZE_CLASS_COUNT: usize = 25;
pub const TARGET_PAGE_SIZE: u64 = 4096;
/// Largest slab order a table entry may claim: 4 MiB slabs at 4 KiB pages
pub const MAX_SLAB_ORDER: u64 = 10;

/// Link value ending a list normally
pub const LIST_END: u64 = 0;
/// Link value the allocator leaves in a slab that was taken off its list.
/// Never a valid header address, since headers are page aligned.
pub const UNLINKED: u64 = 1;

/// What a single link value tells the walker to do next
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkStep {
    /// Decode the slab header at this address
    Continue(u64),
    /// Normal end of the list
    Terminal,
    /// The unlinked marker; nothing past it can be followed
    CorruptUnlinked,
}

impl LinkStep {
    pub const fn classify(link: u64) -> Self {
        match link {
            LIST_END => Self::Terminal,
            UNLINKED => Self::CorruptUnlinked,
            address => Self::Continue(address),
        }
    }
}

/// How a size class's list walk stopped
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ListEnd {
    Terminal,
    CorruptUnlinked,
    /// A link led back to an already visited header
    Cycle {
        #[serde(with = "serde_addr")]
        address: u64,
    },
    /// The table entry's geometry is impossible (order too large, or header,
    /// bitmap and objects would not fit in one slab), so the list was not
    /// walked
    BadDescriptor,
    /// A read failed; the rest of this list was not inspected
    ReadFailed { error: AccessError },
}

impl ListEnd {
    pub const fn is_corrupt(&self) -> bool {
        matches!(
            self,
            Self::CorruptUnlinked | Self::Cycle { .. } | Self::BadDescriptor
        )
    }
}

/// One visited slab
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct SlabEntry {
    #[serde(with = "serde_addr")]
    pub address: u64,
    /// The header's stored counter
    pub allocated: u64,
    /// Set bits in the bitmap
    pub bitmap_allocated: u64,
    pub mismatch: bool,
    /// `allocated` exceeds the slab's capacity
    pub over_capacity: bool,
    /// Bits set past the last slot
    pub stray_bits: bool,
    /// Header is not aligned to the slab size
    pub misaligned: bool,
}

impl SlabEntry {
    pub const fn is_corrupt(&self) -> bool {
        self.mismatch || self.over_capacity || self.stray_bits || self.misaligned
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SizeClassReport {
    pub index: usize,
    /// `None` if the entry's address does not fit in 64 bits
    #[serde(with = "serde_addr::option")]
    pub address: Option<u64>,
    /// `None` if the table entry itself could not be read
    pub descriptor: Option<SizeClassDescriptor>,
    pub bitmap_bytes: u64,
    /// Slabs in list order
    pub slabs: Vec<SlabEntry>,
    pub end: ListEnd,
}

impl SizeClassReport {
    pub fn is_corrupt(&self) -> bool {
        self.end.is_corrupt() || self.slabs.iter().any(SlabEntry::is_corrupt)
    }

    pub fn read_failed(&self) -> Option<&AccessError> {
        match &self.end {
            ListEnd::ReadFailed { error } => Some(error),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HeapReport {
    #[serde(with = "serde_addr")]
    pub table_address: u64,
    pub size_classes: Vec<SizeClassReport>,
}

impl HeapReport {
    pub fn corrupt_classes(&self) -> impl Iterator<Item = &SizeClassReport> {
        self.size_classes.iter().filter(|sc| sc.is_corrupt())
    }

    pub fn failed_classes(&self) -> impl Iterator<Item = &SizeClassReport> {
        self.size_classes
            .iter()
            .filter(|sc| sc.read_failed().is_some())
    }

    pub fn total_slabs(&self) -> usize {
        self.size_classes.iter().map(|sc| sc.slabs.len()).sum()
    }

    /// Nothing corrupt and nothing unreadable
    pub fn is_clean(&self) -> bool {
        self.corrupt_classes().next().is_none() && self.failed_classes().next().is_none()
    }
}

/// Errors that stop a whole run
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WalkError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WalkConfig {
    pub table_symbol: String,
    pub size_class_count: usize,
    /// The target's base page size; slabs are `page_size << slab_order`
    pub page_size: u64,
    pub max_slab_order: u64,
    pub types: TypeNames,
}

impl Default for WalkConfig {
    fn default() -> Self {
        Self {
            table_symbol: TABLE_SYMBOL.to_owned(),
            size_class_count: SIZE_CLASS_COUNT,
            page_size: TARGET_PAGE_SIZE,
            max_slab_order: MAX_SLAB_ORDER,
            types: TypeNames::default(),
        }
    }
}

/// A walker bound to one resolved table and schema. Build a new one per
/// invocation; nothing here is meant to outlive a single dump.
pub struct HeapWalker<'a, M: ?Sized> {
    mem: &'a M,
    schema: HeapSchema,
    table: u64,
    config: &'a WalkConfig,
}

impl<'a, M> HeapWalker<'a, M>
where
    M: MemoryReader + ?Sized,
{
    /// Resolve the table symbol and both record layouts. Any failure here is
    /// fatal and nothing is read from the target.
    pub fn resolve<H>(mem: &'a M, host: &H, config: &'a WalkConfig) -> Result<Self, WalkError>
    where
        H: SymbolResolver + TypeResolver + ?Sized,
    {
        let table = host.resolve_symbol(&config.table_symbol)?;
        let schema = HeapSchema::resolve(host, &config.types)?;
        info!(
            "size class table `{}` at {table:#x}, {} classes",
            config.table_symbol, config.size_class_count
        );
        Ok(Self::with_schema(mem, schema, table, config))
    }

    pub fn with_schema(mem: &'a M, schema: HeapSchema, table: u64, config: &'a WalkConfig) -> Self {
        Self {
            mem,
            schema,
            table,
            config,
        }
    }

    fn decoder(&self) -> Decoder<'_, M> {
        Decoder::new(self.mem, &self.schema)
    }

    /// Walk size classes `0..size_class_count` in order
    pub fn dump_heap(&self) -> HeapReport {
        let size_classes = (0..self.config.size_class_count)
            .map(|index| self.walk_size_class(index))
            .collect();
        HeapReport {
            table_address: self.table,
            size_classes,
        }
    }

    pub fn walk_size_class(&self, index: usize) -> SizeClassReport {
        let decoder = self.decoder();
        let address = decoder.size_class_address(self.table, index).ok();

        let descriptor = match decoder.decode_size_class(self.table, index) {
            Ok(descriptor) => descriptor,
            Err(error) => {
                warn!("size class {index}: cannot read table entry: {error}");
                return SizeClassReport {
                    index,
                    address,
                    descriptor: None,
                    bitmap_bytes: 0,
                    slabs: Vec::new(),
                    end: ListEnd::ReadFailed { error },
                };
            }
        };
        debug!(
            "size class {index}: size {} order {} objects {} head {:#x}",
            descriptor.size,
            descriptor.slab_order,
            descriptor.objects_per_slab,
            descriptor.free_list_head
        );

        let mut slabs = Vec::new();
        let bitmap_bytes = descriptor.bitmap_bytes();
        let end = if self.geometry_fits(&descriptor) {
            self.walk_list(&descriptor, &mut slabs)
        } else {
            warn!(
                "size class {index}: {} objects of {} bytes cannot fit in an order {} slab",
                descriptor.objects_per_slab, descriptor.size, descriptor.slab_order
            );
            ListEnd::BadDescriptor
        };
        SizeClassReport {
            index,
            address,
            descriptor: Some(descriptor),
            bitmap_bytes,
            slabs,
            end,
        }
    }

    /// Header, bitmap and objects must all fit in one slab, the same bound the
    /// allocator uses when it sizes a class. Also caps how much a single
    /// bitmap read can ask for.
    fn geometry_fits(&self, descriptor: &SizeClassDescriptor) -> bool {
        if descriptor.slab_order > self.config.max_slab_order {
            return false;
        }
        let Some(slab) = slab_size(self.config.page_size, descriptor.slab_order) else {
            return false;
        };
        descriptor
            .objects_per_slab
            .checked_mul(descriptor.size)
            .and_then(|objects| objects.checked_add(descriptor.bitmap_bytes()))
            .and_then(|used| used.checked_add(self.schema.slab_header.header_size))
            .is_some_and(|used| used <= slab)
    }

    fn walk_list(&self, descriptor: &SizeClassDescriptor, slabs: &mut Vec<SlabEntry>) -> ListEnd {
        let mut visited = HashSet::new();
        let mut link = descriptor.free_list_head;
        loop {
            let address = match LinkStep::classify(link) {
                LinkStep::Terminal => return ListEnd::Terminal,
                LinkStep::CorruptUnlinked => {
                    warn!(
                        "size class {}: unlinked marker after {} slabs",
                        descriptor.index,
                        slabs.len()
                    );
                    return ListEnd::CorruptUnlinked;
                }
                LinkStep::Continue(address) => address,
            };
            if !visited.insert(address) {
                warn!(
                    "size class {}: free-list loops back to {address:#x}",
                    descriptor.index
                );
                return ListEnd::Cycle { address };
            }
            match self.inspect_slab(descriptor, address) {
                Ok((entry, next)) => {
                    slabs.push(entry);
                    link = next;
                }
                Err(error) => {
                    warn!(
                        "size class {}: slab {address:#x} unreadable: {error}",
                        descriptor.index
                    );
                    return ListEnd::ReadFailed { error };
                }
            }
        }
    }

    /// Decode one slab and return it along with its next link
    fn inspect_slab(
        &self,
        descriptor: &SizeClassDescriptor,
        address: u64,
    ) -> Result<(SlabEntry, u64), AccessError> {
        let decoder = self.decoder();
        let header = decoder.decode_slab_header(address)?;
        let bitmap = decoder.read_bitmap(
            decoder.bitmap_address(address)?,
            descriptor.objects_per_slab,
        )?;
        let bitmap_allocated = bitmap.popcount();

        let align = slab_size(self.config.page_size, descriptor.slab_order);
        let entry = SlabEntry {
            address,
            allocated: header.allocated,
            bitmap_allocated,
            mismatch: header.allocated != bitmap_allocated,
            over_capacity: header.allocated > descriptor.objects_per_slab,
            stray_bits: bitmap.stray_bits() != 0,
            misaligned: align.is_some_and(|size| !is_aligned(address, size)),
        };

        trace!(
            "slab {address:#x}: {} allocated, {} in bitmap, next {:#x}",
            entry.allocated,
            entry.bitmap_allocated,
            header.next
        );
        if entry.mismatch {
            warn!(
                "size class {}: slab {address:#x} stores {} allocated but bitmap has {}",
                descriptor.index, entry.allocated, entry.bitmap_allocated
            );
        }
        Ok((entry, header.next))
    }
}

/// `page_size << order`, or `None` if that does not fit in 64 bits
fn slab_size(page_size: u64, order: u64) -> Option<u64> {
    let order = u32::try_from(order).ok()?;
    (page_size != 0 && order <= page_size.leading_zeros()).then(|| page_size << order)
}

/// Resolve everything afresh and walk the whole heap once
pub fn dump_heap<M, H>(mem: &M, host: &H, config: &WalkConfig) -> Result<HeapReport, WalkError>
where
    M: MemoryReader + ?Sized,
    H: SymbolResolver + TypeResolver + ?Sized,
{
    Ok(HeapWalker::resolve(mem, host, config)?.dump_heap())
}
