//! Access to BPF maps.
//!
//! Everything above this module talks to maps through [`KernelMap`] so the
//! same code drives real kernel maps ([`libbpf`]) and the host memory
//! emulation used by the tests ([`memory`]).

pub mod libbpf;
pub mod memory;

use std::fmt;
use std::io;
use std::mem::size_of;
use std::os::fd::RawFd;

use plain::Plain;
use thiserror::Error;

use crate::util::MemlockGuard;

#[derive(Debug, Error)]
pub enum MapError {
    #[error("key not found")]
    NotFound,
    #[error("key already exists")]
    AlreadyExists,
    #[error("map is full")]
    Full,
    #[error("operation not supported: {0}")]
    Unsupported(String),
    #[error("invalid key or value: {0}")]
    InvalidKey(String),
    #[error("os error: {0}")]
    Os(#[source] io::Error),
    #[error("libbpf error: {0}")]
    Libbpf(#[source] libbpf_rs::Error),
}

impl MapError {
    pub fn from_errno(errno: i32) -> Self {
        Self::from(io::Error::from_raw_os_error(errno))
    }
}

impl From<io::Error> for MapError {
    fn from(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::ENOENT) => MapError::NotFound,
            Some(libc::EEXIST) => MapError::AlreadyExists,
            Some(libc::E2BIG) => MapError::Full,
            Some(libc::EOPNOTSUPP) => {
                MapError::Unsupported(err.to_string())
            }
            _ => MapError::Os(err),
        }
    }
}

impl From<libbpf_rs::Error> for MapError {
    fn from(err: libbpf_rs::Error) -> Self {
        match err.kind() {
            libbpf_rs::ErrorKind::NotFound => MapError::NotFound,
            libbpf_rs::ErrorKind::AlreadyExists => MapError::AlreadyExists,
            _ => MapError::Libbpf(err),
        }
    }
}

/// A bulk operation failed after processing `processed` elements.
#[derive(Debug, Error)]
#[error("batch operation failed after {processed} elements: {source}")]
pub struct BatchError {
    pub processed: u32,
    #[source]
    pub source: MapError,
}

/// Write semantics of an update.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UpdateFlags {
    /// Create or overwrite.
    Any,
    /// Only create, fail with [`MapError::AlreadyExists`] otherwise.
    NoExist,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MapKind {
    Hash,
    Array,
    LpmTrie,
    HashOfMaps,
}

impl fmt::Display for MapKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            MapKind::Hash => "hash",
            MapKind::Array => "array",
            MapKind::LpmTrie => "lpm_trie",
            MapKind::HashOfMaps => "hash_of_maps",
        };
        f.write_str(name)
    }
}

/// Shape of a map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapSpec {
    pub name: String,
    pub kind: MapKind,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    /// Allocate entries lazily. Ignored for arrays, which are always
    /// preallocated.
    pub no_prealloc: bool,
}

impl MapSpec {
    pub fn new(
        name: impl Into<String>,
        kind: MapKind,
        key_size: u32,
        value_size: u32,
        max_entries: u32,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            key_size,
            value_size,
            max_entries,
            no_prealloc: matches!(kind, MapKind::LpmTrie),
        }
    }

    pub fn with_no_prealloc(mut self, no_prealloc: bool) -> Self {
        self.no_prealloc = no_prealloc && self.kind != MapKind::Array;
        self
    }
}

/// A handle to a BPF map.
///
/// Keys and values are raw bytes laid out exactly like the kernel side
/// structs. Dropping a handle closes it.
pub trait KernelMap: Send + Sync {
    fn name(&self) -> &str;
    fn max_entries(&self) -> u32;
    /// File descriptor of the handle, used as the value when linking this map
    /// into a map-in-map.
    fn raw_fd(&self) -> RawFd;
    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>, MapError>;
    fn update(&self, key: &[u8], value: &[u8], flags: UpdateFlags) -> Result<(), MapError>;
    fn delete(&self, key: &[u8]) -> Result<(), MapError>;
    /// Writes `count` key/value pairs laid out back to back. Returns how
    /// many were written.
    fn update_batch(
        &self,
        keys: &[u8],
        values: &[u8],
        count: u32,
        flags: UpdateFlags,
    ) -> Result<u32, BatchError>;
    /// Deletes `count` keys laid out back to back. The kernel can stop before
    /// reaching the end, check [`BatchError::processed`].
    fn delete_batch(&self, keys: &[u8], count: u32) -> Result<u32, BatchError>;
    /// Returns an independent handle to the same map, closable on its own.
    fn try_clone(&self) -> Result<Box<dyn KernelMap>, MapError>;
}

/// Creates maps at runtime, the inner stack delta maps and the throw away
/// maps used for feature probing.
pub trait MapFactory: Send + Sync {
    fn create_map(&self, spec: &MapSpec) -> Result<Box<dyn KernelMap>, MapError>;
    /// Lifts the locked memory limit for as long as the guard lives.
    fn raise_memlock(&self) -> Result<MemlockGuard, MapError>;
}

/// Safety: `T: Plain` guarantees there is no indirection or padding in the
/// records so the bytes are exactly what the kernel expects.
fn slice_as_bytes<T: Plain>(records: &[T]) -> &[u8] {
    unsafe { plain::as_bytes(records) }
}

pub fn update_plain<K: Plain, V: Plain>(
    map: &dyn KernelMap,
    key: &K,
    value: &V,
    flags: UpdateFlags,
) -> Result<(), MapError> {
    map.update(unsafe { plain::as_bytes(key) }, unsafe { plain::as_bytes(value) }, flags)
}

pub fn delete_plain<K: Plain>(map: &dyn KernelMap, key: &K) -> Result<(), MapError> {
    map.delete(unsafe { plain::as_bytes(key) })
}

pub fn lookup_plain<K: Plain, V: Plain + Copy + Default>(
    map: &dyn KernelMap,
    key: &K,
) -> Result<Option<V>, MapError> {
    match map.lookup(unsafe { plain::as_bytes(key) })? {
        Some(bytes) => {
            let mut value = V::default();
            plain::copy_from_bytes(&mut value, &bytes).map_err(|_| {
                MapError::InvalidKey(format!(
                    "value of {} bytes, expected {}",
                    bytes.len(),
                    size_of::<V>()
                ))
            })?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Bulk write of fixed layout records, without any per element encoding.
pub fn update_batch_plain<K: Plain, V: Plain>(
    map: &dyn KernelMap,
    keys: &[K],
    values: &[V],
    flags: UpdateFlags,
) -> Result<u32, BatchError> {
    if keys.len() != values.len() {
        return Err(BatchError {
            processed: 0,
            source: MapError::InvalidKey(format!(
                "{} keys but {} values",
                keys.len(),
                values.len()
            )),
        });
    }
    map.update_batch(
        slice_as_bytes(keys),
        slice_as_bytes(values),
        keys.len() as u32,
        flags,
    )
}

pub fn delete_batch_plain<K: Plain>(map: &dyn KernelMap, keys: &[K]) -> Result<u32, BatchError> {
    map.delete_batch(slice_as_bytes(keys), keys.len() as u32)
}
