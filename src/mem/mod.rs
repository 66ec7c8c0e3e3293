//! Raw byte access into the target's address space.
//!
//! Everything above this module reads target memory only through
//! [`MemoryReader`]. Readers never cache: the target may be live, and a
//! stale byte is worse than a second read.

use serde::Serialize;
use thiserror::Error;

use crate::serialize::serde_addr;

pub mod image;

pub use image::MemoryImage;

/// Why a read failed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum AccessFault {
    /// Some part of the range is not mapped in the target
    Unmapped,
    /// `address + len` does not fit in 64 bits
    Overflow,
    /// The target returned fewer bytes than asked for
    Short { read: usize },
    /// The OS refused the read; carries the errno name
    Os { errno: &'static str },
}

/// A read of `len` bytes at `address` could not be satisfied
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error, Serialize)]
#[error("cannot read {len} bytes at {address:#x}: {reason:?}")]
pub struct AccessError {
    #[serde(with = "serde_addr")]
    pub address: u64,
    pub len: usize,
    pub reason: AccessFault,
}

impl AccessError {
    pub const fn new(address: u64, len: usize, reason: AccessFault) -> Self {
        Self {
            address,
            len,
            reason,
        }
    }

    pub const fn unmapped(address: u64, len: usize) -> Self {
        Self::new(address, len, AccessFault::Unmapped)
    }
}

/// Read-only access to a target address space
pub trait MemoryReader {
    /// Fill `buf` with the bytes at `address..address + buf.len()`. Either
    /// the whole range is read or an error is returned; there are no partial
    /// successes.
    fn read_bytes(&self, address: u64, buf: &mut [u8]) -> Result<(), AccessError>;

    /// Read `len` bytes into a fresh buffer
    fn read_vec(&self, address: u64, len: usize) -> Result<Vec<u8>, AccessError> {
        let mut buf = vec![0u8; len];
        self.read_bytes(address, &mut buf)?;
        Ok(buf)
    }

    /// Read a little-endian `u64`
    fn read_u64_le(&self, address: u64) -> Result<u64, AccessError> {
        let mut buf = [0u8; 8];
        self.read_bytes(address, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Read a little-endian unsigned integer `width` bytes wide (1..=8),
    /// zero-extended to a `u64`
    fn read_uint_le(&self, address: u64, width: usize) -> Result<u64, AccessError> {
        debug_assert!((1..=8).contains(&width));
        let mut buf = [0u8; 8];
        self.read_bytes(address, &mut buf[..width])?;
        Ok(u64::from_le_bytes(buf))
    }
}

impl<M> MemoryReader for &M
where
    M: MemoryReader + ?Sized,
{
    fn read_bytes(&self, address: u64, buf: &mut [u8]) -> Result<(), AccessError> {
        (**self).read_bytes(address, buf)
    }
}

/// End of the range `address..address + len`, or an overflow error
pub fn range_end(address: u64, len: usize) -> Result<u64, AccessError> {
    address
        .checked_add(len as u64)
        .ok_or(AccessError::new(address, len, AccessFault::Overflow))
}
