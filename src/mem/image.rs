//! A captured memory image: a handful of byte regions at known addresses.

use std::{collections::BTreeMap, fmt, path::Path};

use log::debug;
use serde::{Deserialize, Serialize};

use super::{range_end, AccessError, MemoryReader};
use crate::{
    load::{self, LoadError},
    serialize::serde_addr,
};

#[derive(Serialize, Deserialize, Clone, PartialEq)]
pub struct Region {
    #[serde(with = "serde_addr")]
    pub base: u64,
    #[serde(with = "hex")]
    pub bytes: Vec<u8>,
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let end = region_end(self.base, &self.bytes);
        write!(f, "Region({:#x}..{end:#x}, [", self.base)?;
        for (i, b) in self.bytes.iter().take(16).enumerate() {
            write!(f, "{b:02x}")?;
            if i + 1 != self.bytes.len().min(16) {
                write!(f, " ")?;
            }
        }
        if self.bytes.len() > 16 {
            write!(f, " ...")?;
        }
        write!(f, "])")
    }
}

/// One past the last mapped byte. Saturates, since a `Region` fresh from a
/// file has not been checked yet.
fn region_end(base: u64, bytes: &[u8]) -> u64 {
    base.saturating_add(bytes.len() as u64)
}

#[derive(Serialize, Deserialize)]
struct ImageFile {
    regions: Vec<Region>,
}

/// Non-overlapping regions keyed by base address. Reads that straddle two
/// regions fail even if the regions are adjacent; real slab headers and
/// bitmaps never span a capture boundary, and a read that does is suspect.
#[derive(Debug, Default, Clone)]
pub struct MemoryImage {
    regions: BTreeMap<u64, Vec<u8>>,
}

impl MemoryImage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_regions<I>(regions: I) -> Result<Self, LoadError>
    where
        I: IntoIterator<Item = (u64, Vec<u8>)>,
    {
        let mut image = Self::new();
        for (base, bytes) in regions {
            image.insert(base, bytes)?;
        }
        Ok(image)
    }

    /// Map `bytes` at `base`, rejecting overlap with anything already mapped
    pub fn insert(&mut self, base: u64, bytes: Vec<u8>) -> Result<(), LoadError> {
        let end = range_end(base, bytes.len()).map_err(|_| LoadError::RegionOverflow { base })?;
        if let Some((&prev, prev_bytes)) = self.regions.range(..=base).next_back() {
            if region_end(prev, prev_bytes) > base {
                return Err(LoadError::OverlappingRegions {
                    first: prev,
                    second: base,
                });
            }
        }
        if let Some((&next, _)) = self.regions.range(base..).next() {
            if next < end {
                return Err(LoadError::OverlappingRegions {
                    first: base,
                    second: next,
                });
            }
        }
        self.regions.insert(base, bytes);
        Ok(())
    }

    /// Load a JSON image: `{"regions": [{"base": "0x...", "bytes": "<hex>"}]}`
    pub fn from_json_file<P>(path: P) -> Result<Self, LoadError>
    where
        P: AsRef<Path>,
    {
        let file: ImageFile = load::read_json(path.as_ref())?;
        debug!(
            "loaded {} image regions from {}",
            file.regions.len(),
            path.as_ref().display()
        );
        Self::from_regions(file.regions.into_iter().map(|r| (r.base, r.bytes)))
    }

    /// Load a raw dump, mapped as a single region at `base`
    pub fn from_raw_file<P>(path: P, base: u64) -> Result<Self, LoadError>
    where
        P: AsRef<Path>,
    {
        let bytes = load::read_bytes(path.as_ref())?;
        debug!(
            "mapped {} raw bytes from {} at {base:#x}",
            bytes.len(),
            path.as_ref().display()
        );
        Self::from_regions([(base, bytes)])
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        let file = ImageFile {
            regions: self
                .regions
                .iter()
                .map(|(&base, bytes)| Region {
                    base,
                    bytes: bytes.clone(),
                })
                .collect(),
        };
        serde_json::to_string_pretty(&file)
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// Overwrite already mapped bytes. Used to build synthetic heaps.
    pub fn write_bytes(&mut self, address: u64, data: &[u8]) -> Result<(), AccessError> {
        let (base, start) = self.locate(address, data.len())?;
        if let Some(bytes) = self.regions.get_mut(&base) {
            bytes[start..start + data.len()].copy_from_slice(data);
        }
        Ok(())
    }

    /// The region holding all of `address..address + len`, and the offset of
    /// `address` inside it
    fn locate(&self, address: u64, len: usize) -> Result<(u64, usize), AccessError> {
        let end = range_end(address, len)?;
        match self.regions.range(..=address).next_back() {
            Some((&base, bytes)) if end <= region_end(base, bytes) => {
                Ok((base, (address - base) as usize))
            }
            _ => Err(AccessError::unmapped(address, len)),
        }
    }
}

impl MemoryReader for MemoryImage {
    fn read_bytes(&self, address: u64, buf: &mut [u8]) -> Result<(), AccessError> {
        let (base, start) = self.locate(address, buf.len())?;
        if let Some(bytes) = self.regions.get(&base) {
            buf.copy_from_slice(&bytes[start..start + buf.len()]);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::AccessFault;

    #[test]
    fn reads_inside_region() {
        let image = MemoryImage::from_regions([(0x1000, (0u8..32).collect())]).unwrap();
        assert_eq!(image.read_vec(0x1004, 4).unwrap(), vec![4, 5, 6, 7]);
        assert_eq!(image.read_vec(0x101c, 4).unwrap(), vec![28, 29, 30, 31]);
        assert_eq!(image.read_vec(0x1020, 0).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn rejects_reads_outside_regions() {
        let image = MemoryImage::from_regions([(0x1000, vec![0; 16]), (0x1010, vec![0; 16])]).unwrap();
        assert!(image.read_vec(0xfff, 2).is_err());
        // adjacent regions are not stitched together
        assert!(image.read_vec(0x100e, 4).is_err());
        assert!(image.read_vec(0x2000, 1).is_err());
        assert_eq!(
            image.read_vec(u64::MAX, 2).unwrap_err().reason,
            AccessFault::Overflow
        );
    }

    #[test]
    fn rejects_overlap() {
        let mut image = MemoryImage::new();
        image.insert(0x1000, vec![0; 0x100]).unwrap();
        assert!(matches!(
            image.insert(0x10f0, vec![0; 0x20]),
            Err(LoadError::OverlappingRegions { .. })
        ));
        assert!(matches!(
            image.insert(0xff0, vec![0; 0x20]),
            Err(LoadError::OverlappingRegions { .. })
        ));
        image.insert(0x1100, vec![0; 0x10]).unwrap();
        assert_eq!(image.region_count(), 2);
    }

    #[test]
    fn json_image_round_trips_through_text() {
        let image = MemoryImage::from_regions([(0xffff_8000_0000_1000, vec![0xde, 0xad])]).unwrap();
        let json = image.to_json().unwrap();
        assert!(json.contains("\"0xffff800000001000\""));
        assert!(json.contains("\"dead\""));
        let file: ImageFile = serde_json::from_str(&json).unwrap();
        assert_eq!(file.regions[0].bytes, vec![0xde, 0xad]);
    }

    #[test]
    fn region_debug_is_short() {
        let region = Region {
            base: 0x10,
            bytes: vec![1, 2, 0xab],
        };
        assert_eq!(format!("{region:?}"), "Region(0x10..0x13, [01 02 ab])");
    }

    #[test]
    fn unchecked_region_debug_saturates() {
        let region = Region {
            base: u64::MAX - 1,
            bytes: vec![0; 4],
        };
        assert_eq!(
            format!("{region:?}"),
            "Region(0xfffffffffffffffe..0xffffffffffffffff, [00 00 00 00])"
        );
    }

    #[test]
    fn region_end_is_exclusive() {
        let mut image = MemoryImage::from_regions([(0x1000, vec![0; 8])]).unwrap();
        image.write_bytes(0x1004, &[1, 2, 3, 4]).unwrap();
        assert_eq!(image.read_vec(0x1004, 4).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(
            image.write_bytes(0x1005, &[0; 4]),
            Err(AccessError::unmapped(0x1005, 4))
        );
        assert_eq!(
            image.read_vec(0x1005, 4),
            Err(AccessError::unmapped(0x1005, 4))
        );
    }
}
