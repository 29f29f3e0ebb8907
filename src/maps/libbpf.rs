use std::collections::HashMap;
use std::mem::size_of;
use std::os::fd::{AsFd, AsRawFd, RawFd};

use libbpf_rs::{MapCore, MapFlags, MapHandle, MapType, Object};
use tracing::debug;

use super::{BatchError, KernelMap, MapError, MapFactory, MapKind, MapSpec, UpdateFlags};
use crate::util::MemlockGuard;

impl From<UpdateFlags> for MapFlags {
    fn from(flags: UpdateFlags) -> Self {
        match flags {
            UpdateFlags::Any => MapFlags::ANY,
            UpdateFlags::NoExist => MapFlags::NO_EXIST,
        }
    }
}

fn batch_opts(elem_flags: UpdateFlags) -> libbpf_sys::bpf_map_batch_opts {
    libbpf_sys::bpf_map_batch_opts {
        sz: size_of::<libbpf_sys::bpf_map_batch_opts>() as libbpf_sys::size_t,
        elem_flags: MapFlags::from(elem_flags).bits(),
        flags: 0,
    }
}

/// Turns the return value of a raw batch call into how many elements the
/// kernel got through.
fn batch_result(ret: i32, processed: u32) -> Result<u32, BatchError> {
    if ret < 0 {
        return Err(BatchError {
            processed,
            source: MapError::from_errno(-ret),
        });
    }
    Ok(processed)
}

/// A kernel BPF map, owned through its own file descriptor.
pub struct LibbpfMap {
    handle: MapHandle,
    name: String,
    max_entries: u32,
}

impl LibbpfMap {
    pub fn new(handle: MapHandle) -> Result<Self, MapError> {
        let max_entries = handle.info()?.info.max_entries;
        let name = handle.name().to_string_lossy().to_string();
        Ok(Self {
            handle,
            name,
            max_entries,
        })
    }
}

impl KernelMap for LibbpfMap {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_entries(&self) -> u32 {
        self.max_entries
    }

    fn raw_fd(&self) -> RawFd {
        self.handle.as_fd().as_raw_fd()
    }

    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>, MapError> {
        Ok(self.handle.lookup(key, MapFlags::ANY)?)
    }

    fn update(&self, key: &[u8], value: &[u8], flags: UpdateFlags) -> Result<(), MapError> {
        Ok(self.handle.update(key, value, flags.into())?)
    }

    fn delete(&self, key: &[u8]) -> Result<(), MapError> {
        Ok(self.handle.delete(key)?)
    }

    fn update_batch(
        &self,
        keys: &[u8],
        values: &[u8],
        count: u32,
        flags: UpdateFlags,
    ) -> Result<u32, BatchError> {
        let mut processed = count;
        let opts = batch_opts(flags);
        // The kernel reads `count` keys and values of the sizes the map was
        // created with, which the callers lay out back to back.
        let ret = unsafe {
            libbpf_sys::bpf_map_update_batch(
                self.raw_fd(),
                keys.as_ptr() as *const libc::c_void,
                values.as_ptr() as *const libc::c_void,
                &mut processed,
                &opts,
            )
        };
        batch_result(ret, processed)
    }

    fn delete_batch(&self, keys: &[u8], count: u32) -> Result<u32, BatchError> {
        let mut processed = count;
        let opts = batch_opts(UpdateFlags::Any);
        let ret = unsafe {
            libbpf_sys::bpf_map_delete_batch(
                self.raw_fd(),
                keys.as_ptr() as *const libc::c_void,
                &mut processed,
                &opts,
            )
        };
        batch_result(ret, processed)
    }

    fn try_clone(&self) -> Result<Box<dyn KernelMap>, MapError> {
        Ok(Box::new(LibbpfMap {
            handle: MapHandle::try_from(&self.handle)?,
            name: self.name.clone(),
            max_entries: self.max_entries,
        }))
    }
}

/// Creates maps in the kernel.
#[derive(Default)]
pub struct LibbpfMapFactory;

impl MapFactory for LibbpfMapFactory {
    fn create_map(&self, spec: &MapSpec) -> Result<Box<dyn KernelMap>, MapError> {
        let map_type = match spec.kind {
            MapKind::Hash => MapType::Hash,
            MapKind::Array => MapType::Array,
            MapKind::LpmTrie => MapType::LpmTrie,
            // Needs an inner map template, these come from the BPF object.
            MapKind::HashOfMaps => {
                return Err(MapError::Unsupported(format!(
                    "creating {} maps at runtime",
                    spec.kind
                )))
            }
        };

        let opts = libbpf_sys::bpf_map_create_opts {
            sz: size_of::<libbpf_sys::bpf_map_create_opts>() as libbpf_sys::size_t,
            map_flags: if spec.no_prealloc {
                libbpf_sys::BPF_F_NO_PREALLOC
            } else {
                0
            },
            ..Default::default()
        };
        let handle = MapHandle::create(
            map_type,
            Some(spec.name.as_str()),
            spec.key_size,
            spec.value_size,
            spec.max_entries,
            &opts,
        )?;
        debug!(
            "created {} map {} with {} entries",
            spec.kind, spec.name, spec.max_entries
        );

        Ok(Box::new(LibbpfMap::new(handle)?))
    }

    fn raise_memlock(&self) -> Result<MemlockGuard, MapError> {
        MemlockGuard::maximize().map_err(|e| MapError::Os(e.into()))
    }
}

/// Opens an independent handle to every map of a loaded BPF object, keyed by
/// map name.
pub fn maps_from_object(object: &Object) -> Result<HashMap<String, Box<dyn KernelMap>>, MapError> {
    object
        .maps()
        .map(|map| {
            let map = LibbpfMap::new(MapHandle::try_from(&map)?)?;
            Ok((map.name.clone(), Box::new(map) as Box<dyn KernelMap>))
        })
        .collect()
}
