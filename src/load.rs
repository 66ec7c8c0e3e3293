use std::{fs, io, path::Path, path::PathBuf};

use serde::de::DeserializeOwned;
use thiserror::Error;

/// Problems reading a target description or a memory image from disk
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("image regions at {first:#x} and {second:#x} overlap")]
    OverlappingRegions { first: u64, second: u64 },
    #[error("image region at {base:#x} runs past the end of the address space")]
    RegionOverflow { base: u64 },
}

pub(crate) fn read_bytes<P>(path: P) -> Result<Vec<u8>, LoadError>
where
    P: AsRef<Path>,
{
    let path = path.as_ref();
    fs::read(path).map_err(|source| LoadError::Io {
        path: path.to_owned(),
        source,
    })
}

pub(crate) fn read_json<T, P>(path: P) -> Result<T, LoadError>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let buf = read_bytes(path)?;
    serde_json::from_slice(&buf).map_err(|source| LoadError::Json {
        path: path.to_owned(),
        source,
    })
}
