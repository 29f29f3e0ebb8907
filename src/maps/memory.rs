//! Host memory emulation of BPF maps.
//!
//! Mirrors the kernel semantics this crate relies on: hash and array update
//! flags, LPM trie longest prefix matching, map-in-map values referencing
//! other maps by file descriptor, and batch operations that can stop early.
//! Used by the tests and for dry runs on machines without BPF support.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use lazy_static::lazy_static;

use super::{BatchError, KernelMap, MapError, MapFactory, MapKind, MapSpec, UpdateFlags};
use crate::util::MemlockGuard;

/// Fake descriptors start high to not be mistaken for real ones.
static NEXT_FD: AtomicI32 = AtomicI32::new(1 << 20);

lazy_static! {
    static ref OPEN_DESCRIPTORS: Mutex<HashMap<RawFd, Weak<MapState>>> = Mutex::new(HashMap::new());
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A successful mutation, in the order it was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapOperation {
    Update { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

struct MapState {
    spec: MapSpec,
    entries: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
    /// Maps referenced by map-in-map values, keeping them alive like the
    /// kernel does after their descriptors are closed.
    inner_maps: Mutex<HashMap<Vec<u8>, Arc<MapState>>>,
    operations: Mutex<Vec<MapOperation>>,
    batch_supported: AtomicBool,
    fail_batch_delete_after: Mutex<Option<u32>>,
    open_handles: AtomicUsize,
}

impl MapState {
    fn check_key_size(&self, key: &[u8]) -> Result<(), MapError> {
        let expected = self.spec.key_size as usize;
        if expected != 0 && key.len() != expected {
            return Err(MapError::InvalidKey(format!(
                "{}: key of {} bytes, expected {}",
                self.spec.name,
                key.len(),
                expected
            )));
        }
        Ok(())
    }

    fn array_index(&self, key: &[u8]) -> Result<u32, MapError> {
        let index = key
            .try_into()
            .map(u32::from_ne_bytes)
            .map_err(|_| MapError::InvalidKey("array keys are 4 bytes".to_string()))?;
        if index >= self.spec.max_entries {
            return Err(MapError::from_errno(libc::E2BIG));
        }
        Ok(index)
    }

    /// Zeroes the data bits past the prefix so equal prefixes compare equal.
    fn normalize_lpm_key(&self, key: &[u8]) -> Result<Vec<u8>, MapError> {
        if key.len() < 4 {
            return Err(MapError::InvalidKey("lpm keys start with a u32".to_string()));
        }
        let prefix_len = u32::from_ne_bytes([key[0], key[1], key[2], key[3]]) as usize;
        let data_bits = (key.len() - 4) * 8;
        if prefix_len > data_bits {
            return Err(MapError::from_errno(libc::EINVAL));
        }

        let mut normalized = key.to_vec();
        for (i, byte) in normalized[4..].iter_mut().enumerate() {
            let byte_start = i * 8;
            if byte_start >= prefix_len {
                *byte = 0;
            } else if byte_start + 8 > prefix_len {
                let keep = prefix_len - byte_start;
                *byte &= 0xff_u8 << (8 - keep);
            }
        }
        Ok(normalized)
    }

    fn lpm_matches(entry: &[u8], query: &[u8]) -> bool {
        let entry_len = u32::from_ne_bytes([entry[0], entry[1], entry[2], entry[3]]) as usize;
        let query_len = u32::from_ne_bytes([query[0], query[1], query[2], query[3]]) as usize;
        if entry_len > query_len || entry.len() != query.len() {
            return false;
        }
        (0..entry_len).all(|bit| {
            let mask = 0x80_u8 >> (bit % 8);
            entry[4 + bit / 8] & mask == query[4 + bit / 8] & mask
        })
    }

    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>, MapError> {
        self.check_key_size(key)?;
        let entries = lock(&self.entries);
        match self.spec.kind {
            MapKind::Array => {
                let index = self.array_index(key)?;
                Ok(Some(
                    entries
                        .get(&index.to_ne_bytes()[..])
                        .cloned()
                        .unwrap_or_else(|| vec![0; self.spec.value_size as usize]),
                ))
            }
            MapKind::LpmTrie => {
                let query = self.normalize_lpm_key(key)?;
                Ok(entries
                    .iter()
                    .filter(|(entry, _)| Self::lpm_matches(entry, &query))
                    .max_by_key(|(entry, _)| {
                        u32::from_ne_bytes([entry[0], entry[1], entry[2], entry[3]])
                    })
                    .map(|(_, value)| value.clone()))
            }
            MapKind::Hash | MapKind::HashOfMaps => Ok(entries.get(key).cloned()),
        }
    }

    fn update(&self, key: &[u8], value: &[u8], flags: UpdateFlags) -> Result<(), MapError> {
        self.check_key_size(key)?;
        let key = match self.spec.kind {
            MapKind::Array => {
                self.array_index(key)?;
                // Array elements always exist.
                if flags == UpdateFlags::NoExist {
                    return Err(MapError::AlreadyExists);
                }
                key.to_vec()
            }
            MapKind::LpmTrie => self.normalize_lpm_key(key)?,
            MapKind::Hash | MapKind::HashOfMaps => key.to_vec(),
        };

        let inner = if self.spec.kind == MapKind::HashOfMaps {
            let fd = value
                .try_into()
                .map(RawFd::from_ne_bytes)
                .map_err(|_| MapError::InvalidKey("map-in-map values are 4 bytes".to_string()))?;
            let inner = lock(&OPEN_DESCRIPTORS)
                .get(&fd)
                .and_then(Weak::upgrade)
                .ok_or_else(|| MapError::from_errno(libc::EBADF))?;
            Some(inner)
        } else {
            None
        };

        let mut entries = lock(&self.entries);
        let exists = entries.contains_key(&key);
        if exists && flags == UpdateFlags::NoExist {
            return Err(MapError::AlreadyExists);
        }
        if !exists
            && self.spec.kind != MapKind::Array
            && entries.len() >= self.spec.max_entries as usize
        {
            return Err(MapError::Full);
        }
        entries.insert(key.clone(), value.to_vec());
        if let Some(inner) = inner {
            lock(&self.inner_maps).insert(key.clone(), inner);
        }
        lock(&self.operations).push(MapOperation::Update {
            key,
            value: value.to_vec(),
        });
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), MapError> {
        self.check_key_size(key)?;
        let key = match self.spec.kind {
            MapKind::Array => return Err(MapError::from_errno(libc::EINVAL)),
            MapKind::LpmTrie => self.normalize_lpm_key(key)?,
            MapKind::Hash | MapKind::HashOfMaps => key.to_vec(),
        };

        let mut entries = lock(&self.entries);
        if entries.remove(&key).is_none() {
            return Err(MapError::NotFound);
        }
        lock(&self.inner_maps).remove(&key);
        lock(&self.operations).push(MapOperation::Delete { key });
        Ok(())
    }

    fn check_batch(&self, len: usize, count: u32) -> Result<usize, BatchError> {
        if !self.batch_supported.load(Ordering::SeqCst) {
            return Err(BatchError {
                processed: 0,
                source: MapError::from_errno(libc::EINVAL),
            });
        }
        if count == 0 || len % count as usize != 0 {
            return Err(BatchError {
                processed: 0,
                source: MapError::InvalidKey(format!("{} bytes for {} elements", len, count)),
            });
        }
        Ok(len / count as usize)
    }
}

/// Handle to a host memory map. Each handle has its own fake descriptor.
pub struct InMemoryMap {
    state: Arc<MapState>,
    fd: RawFd,
}

impl InMemoryMap {
    pub fn new(spec: &MapSpec) -> Self {
        let state = Arc::new(MapState {
            spec: spec.clone(),
            entries: Mutex::new(BTreeMap::new()),
            inner_maps: Mutex::new(HashMap::new()),
            operations: Mutex::new(Vec::new()),
            batch_supported: AtomicBool::new(true),
            fail_batch_delete_after: Mutex::new(None),
            open_handles: AtomicUsize::new(0),
        });
        Self::open(state)
    }

    fn open(state: Arc<MapState>) -> Self {
        let fd = NEXT_FD.fetch_add(1, Ordering::SeqCst);
        state.open_handles.fetch_add(1, Ordering::SeqCst);
        lock(&OPEN_DESCRIPTORS).insert(fd, Arc::downgrade(&state));
        Self { state, fd }
    }

    pub fn inspector(&self) -> MapInspector {
        MapInspector(self.state.clone())
    }
}

impl Drop for InMemoryMap {
    fn drop(&mut self) {
        lock(&OPEN_DESCRIPTORS).remove(&self.fd);
        self.state.open_handles.fetch_sub(1, Ordering::SeqCst);
    }
}

impl KernelMap for InMemoryMap {
    fn name(&self) -> &str {
        &self.state.spec.name
    }

    fn max_entries(&self) -> u32 {
        self.state.spec.max_entries
    }

    fn raw_fd(&self) -> RawFd {
        self.fd
    }

    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>, MapError> {
        self.state.lookup(key)
    }

    fn update(&self, key: &[u8], value: &[u8], flags: UpdateFlags) -> Result<(), MapError> {
        self.state.update(key, value, flags)
    }

    fn delete(&self, key: &[u8]) -> Result<(), MapError> {
        self.state.delete(key)
    }

    fn update_batch(
        &self,
        keys: &[u8],
        values: &[u8],
        count: u32,
        flags: UpdateFlags,
    ) -> Result<u32, BatchError> {
        let key_size = self.state.check_batch(keys.len(), count)?;
        let value_size = self.state.check_batch(values.len(), count)?;

        for (i, (key, value)) in keys
            .chunks(key_size)
            .zip(values.chunks(value_size))
            .enumerate()
        {
            self.state
                .update(key, value, flags)
                .map_err(|source| BatchError {
                    processed: i as u32,
                    source,
                })?;
        }
        Ok(count)
    }

    fn delete_batch(&self, keys: &[u8], count: u32) -> Result<u32, BatchError> {
        let key_size = self.state.check_batch(keys.len(), count)?;
        let stop_after = lock(&self.state.fail_batch_delete_after).take();

        for (i, key) in keys.chunks(key_size).enumerate() {
            if stop_after == Some(i as u32) {
                return Err(BatchError {
                    processed: i as u32,
                    source: MapError::Os(io::Error::from_raw_os_error(libc::EINTR)),
                });
            }
            self.state.delete(key).map_err(|source| BatchError {
                processed: i as u32,
                source,
            })?;
        }
        // The kernel can also fail after the last element, e.g. when copying
        // the count back.
        if stop_after == Some(count) {
            return Err(BatchError {
                processed: count,
                source: MapError::Os(io::Error::from_raw_os_error(libc::EFAULT)),
            });
        }
        Ok(count)
    }

    fn try_clone(&self) -> Result<Box<dyn KernelMap>, MapError> {
        Ok(Box::new(Self::open(self.state.clone())))
    }
}

/// Read side view of an [`InMemoryMap`] that does not count as an open
/// handle, plus knobs to emulate kernel behaviour.
#[derive(Clone)]
pub struct MapInspector(Arc<MapState>);

impl MapInspector {
    pub fn spec(&self) -> &MapSpec {
        &self.0.spec
    }

    pub fn len(&self) -> usize {
        lock(&self.0.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        lock(&self.0.entries).contains_key(key)
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        lock(&self.0.entries).get(key).cloned()
    }

    pub fn keys(&self) -> Vec<Vec<u8>> {
        lock(&self.0.entries).keys().cloned().collect()
    }

    pub fn operations(&self) -> Vec<MapOperation> {
        lock(&self.0.operations).clone()
    }

    /// Handles currently open on this map.
    pub fn open_handles(&self) -> usize {
        self.0.open_handles.load(Ordering::SeqCst)
    }

    /// The map linked under `key` of a map-in-map.
    pub fn inner_map(&self, key: &[u8]) -> Option<MapInspector> {
        lock(&self.0.inner_maps)
            .get(key)
            .map(|state| MapInspector(state.clone()))
    }

    /// Emulates kernels without batch operation support.
    pub fn set_batch_supported(&self, supported: bool) {
        self.0.batch_supported.store(supported, Ordering::SeqCst);
    }

    /// Makes the next batch delete fail after deleting `processed` elements.
    pub fn fail_next_batch_delete_after(&self, processed: u32) {
        *lock(&self.0.fail_batch_delete_after) = Some(processed);
    }
}

/// Creates [`InMemoryMap`]s and remembers them for inspection.
pub struct InMemoryMapFactory {
    batch_supported: bool,
    created: Mutex<Vec<MapInspector>>,
}

impl Default for InMemoryMapFactory {
    fn default() -> Self {
        Self::new(true)
    }
}

impl InMemoryMapFactory {
    pub fn new(batch_supported: bool) -> Self {
        Self {
            batch_supported,
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn created(&self) -> Vec<MapInspector> {
        lock(&self.created).clone()
    }

    /// Creates one map per spec, keyed by name.
    pub fn create_maps(
        &self,
        specs: &[MapSpec],
    ) -> Result<HashMap<String, Box<dyn KernelMap>>, MapError> {
        specs
            .iter()
            .map(|spec| Ok((spec.name.clone(), self.create_map(spec)?)))
            .collect()
    }
}

impl MapFactory for InMemoryMapFactory {
    fn create_map(&self, spec: &MapSpec) -> Result<Box<dyn KernelMap>, MapError> {
        if spec.max_entries == 0 {
            return Err(MapError::from_errno(libc::EINVAL));
        }
        let map = InMemoryMap::new(spec);
        let inspector = map.inspector();
        inspector.set_batch_supported(self.batch_supported);
        lock(&self.created).push(inspector);
        Ok(Box::new(map))
    }

    fn raise_memlock(&self) -> Result<MemlockGuard, MapError> {
        Ok(MemlockGuard::noop())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_map() -> InMemoryMap {
        InMemoryMap::new(&MapSpec::new("hash", MapKind::Hash, 8, 8, 2))
    }

    #[test]
    fn test_hash_update_flags() {
        let map = hash_map();
        let key = 1_u64.to_ne_bytes();

        map.update(&key, &[1; 8], UpdateFlags::NoExist).unwrap();
        assert!(matches!(
            map.update(&key, &[2; 8], UpdateFlags::NoExist),
            Err(MapError::AlreadyExists)
        ));
        map.update(&key, &[3; 8], UpdateFlags::Any).unwrap();
        assert_eq!(map.lookup(&key).unwrap(), Some(vec![3; 8]));

        map.update(&2_u64.to_ne_bytes(), &[0; 8], UpdateFlags::Any)
            .unwrap();
        assert!(matches!(
            map.update(&3_u64.to_ne_bytes(), &[0; 8], UpdateFlags::Any),
            Err(MapError::Full)
        ));

        map.delete(&key).unwrap();
        assert!(matches!(map.delete(&key), Err(MapError::NotFound)));
        assert!(matches!(map.delete(&[0; 4]), Err(MapError::InvalidKey(_))));
    }

    #[test]
    fn test_array_semantics() {
        let map = InMemoryMap::new(&MapSpec::new("array", MapKind::Array, 4, 4, 4));
        assert_eq!(map.lookup(&1_u32.to_ne_bytes()).unwrap(), Some(vec![0; 4]));
        map.update(&1_u32.to_ne_bytes(), &[7; 4], UpdateFlags::Any)
            .unwrap();
        assert_eq!(map.lookup(&1_u32.to_ne_bytes()).unwrap(), Some(vec![7; 4]));
        assert!(map
            .update(&4_u32.to_ne_bytes(), &[7; 4], UpdateFlags::Any)
            .is_err());
        assert!(map.delete(&1_u32.to_ne_bytes()).is_err());
    }

    #[test]
    fn test_batch_delete_stops_early() {
        let map = InMemoryMap::new(&MapSpec::new("hash", MapKind::Hash, 8, 8, 16));
        let keys: Vec<u64> = (0..5).collect();
        let values: Vec<u64> = (0..5).collect();
        let keys_bytes = unsafe { plain::as_bytes(&keys[..]) };
        map.update_batch(
            keys_bytes,
            unsafe { plain::as_bytes(&values[..]) },
            5,
            UpdateFlags::Any,
        )
        .unwrap();

        map.inspector().fail_next_batch_delete_after(2);
        let err = map.delete_batch(keys_bytes, 5).unwrap_err();
        assert_eq!(err.processed, 2);
        assert_eq!(map.inspector().len(), 3);

        // The injected failure is one shot.
        assert_eq!(map.delete_batch(&keys_bytes[16..], 3).unwrap(), 3);
        assert!(map.inspector().is_empty());
    }

    #[test]
    fn test_batch_unsupported() {
        let map = hash_map();
        map.inspector().set_batch_supported(false);
        let err = map.delete_batch(&[0; 8], 1).unwrap_err();
        assert_eq!(err.processed, 0);
    }

    #[test]
    fn test_handles_and_map_in_map() {
        let outer = InMemoryMap::new(&MapSpec::new("outer", MapKind::HashOfMaps, 8, 4, 8));
        let inner = InMemoryMap::new(&MapSpec::new("inner", MapKind::Array, 4, 4, 8));
        let inner_inspector = inner.inspector();

        let clone = inner.try_clone().unwrap();
        assert_ne!(clone.raw_fd(), inner.raw_fd());
        assert_eq!(inner_inspector.open_handles(), 2);

        outer
            .update(&1_u64.to_ne_bytes(), &clone.raw_fd().to_ne_bytes(), UpdateFlags::Any)
            .unwrap();
        drop(clone);
        drop(inner);
        assert_eq!(inner_inspector.open_handles(), 0);

        // Still reachable through the outer map.
        assert!(outer.inspector().inner_map(&1_u64.to_ne_bytes()).is_some());
        outer.delete(&1_u64.to_ne_bytes()).unwrap();
        assert!(outer.inspector().inner_map(&1_u64.to_ne_bytes()).is_none());

        // Closed descriptors can't be linked.
        assert!(outer
            .update(&2_u64.to_ne_bytes(), &(-1_i32).to_ne_bytes(), UpdateFlags::Any)
            .is_err());
    }

    #[test]
    fn test_lpm_key_normalization() {
        let map = InMemoryMap::new(&MapSpec::new("lpm", MapKind::LpmTrie, 12, 8, 8));
        let key = |prefix_len: u32, data: u64| {
            let mut k = prefix_len.to_ne_bytes().to_vec();
            k.extend_from_slice(&data.to_be_bytes());
            k
        };

        map.update(&key(4, 0xf000_0000_0000_0000), &[1; 8], UpdateFlags::NoExist)
            .unwrap();
        // Same prefix, different trailing bits.
        assert!(matches!(
            map.update(&key(4, 0xffff_0000_0000_0000), &[1; 8], UpdateFlags::NoExist),
            Err(MapError::AlreadyExists)
        ));
        assert_eq!(
            map.lookup(&key(64, 0xf123_0000_0000_0000)).unwrap(),
            Some(vec![1; 8])
        );
        assert_eq!(map.lookup(&key(64, 0x0123_0000_0000_0000)).unwrap(), None);
        assert!(map.update(&key(65, 0), &[1; 8], UpdateFlags::Any).is_err());
    }
}
