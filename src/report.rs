//! Rendering a [`HeapReport`] for people or for other tools.

use std::fmt::{self, Write};

use crate::walk::{HeapReport, ListEnd, SizeClassReport};

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum Format {
    Text,
    Json,
}

pub fn render(report: &HeapReport, format: Format) -> Result<String, serde_json::Error> {
    match format {
        Format::Text => Ok(Text(report).to_string()),
        Format::Json => serde_json::to_string_pretty(report),
    }
}

/// The same layout the kernel's debugger command prints, plus a summary line
pub struct Text<'a>(pub &'a HeapReport);

impl fmt::Display for Text<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for sc in &self.0.size_classes {
            write_size_class(f, sc)?;
            writeln!(f)?;
        }
        let corrupt = self.0.corrupt_classes().count();
        let failed = self.0.failed_classes().count();
        write!(
            f,
            "{} size classes, {} slabs",
            self.0.size_classes.len(),
            self.0.total_slabs()
        )?;
        if corrupt != 0 {
            write!(f, ", {corrupt} corrupt")?;
        }
        if failed != 0 {
            write!(f, ", {failed} unreadable")?;
        }
        writeln!(f)
    }
}

fn write_size_class<W: Write>(f: &mut W, sc: &SizeClassReport) -> fmt::Result {
    match &sc.descriptor {
        Some(desc) => writeln!(
            f,
            "Size class {} (slab order {}):",
            desc.size, desc.slab_order
        )?,
        None => match sc.address {
            Some(address) => writeln!(f, "Size class #{} at {address:#x}:", sc.index)?,
            None => writeln!(f, "Size class #{}:", sc.index)?,
        },
    }

    for slab in &sc.slabs {
        writeln!(
            f,
            "    Slab {:#x} ({} allocated, {} allocated in bitmap)",
            slab.address, slab.allocated, slab.bitmap_allocated
        )?;
        if slab.mismatch {
            writeln!(f, "        (allocated count and bitmap disagree, HEAP CORRUPT)")?;
        }
        if slab.over_capacity {
            writeln!(f, "        (allocated count exceeds slab capacity, HEAP CORRUPT)")?;
        }
        if slab.stray_bits {
            writeln!(f, "        (bitmap bits set past last object, HEAP CORRUPT)")?;
        }
        if slab.misaligned {
            writeln!(f, "        (slab header not aligned to slab size, HEAP CORRUPT)")?;
        }
    }

    match &sc.end {
        ListEnd::Terminal => Ok(()),
        ListEnd::CorruptUnlinked => writeln!(f, "    (unlinked, HEAP CORRUPT)"),
        ListEnd::Cycle { address } => {
            writeln!(f, "    (list loops back to {address:#x}, HEAP CORRUPT)")
        }
        ListEnd::BadDescriptor => writeln!(
            f,
            "    (slab geometry impossible, list not walked, HEAP CORRUPT)"
        ),
        ListEnd::ReadFailed { error } => writeln!(f, "    (unreadable: {error})"),
    }
}
