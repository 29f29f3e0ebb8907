use thiserror::Error;
use tracing::{debug, info};

use crate::maps::{BatchError, MapError, MapFactory, MapKind, MapSpec, UpdateFlags};

const PROBE_ENTRIES: u32 = 5;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to raise RLIMIT_MEMLOCK: {0}")]
    Memlock(#[source] MapError),
    #[error("failed to create {kind} map for batch probing: {source}")]
    CreateMap {
        kind: MapKind,
        #[source]
        source: MapError,
    },
    #[error("batch update failed: {0}")]
    BatchUpdate(#[source] BatchError),
    #[error("batch delete failed: {0}")]
    BatchDelete(#[source] BatchError),
    #[error("unexpected batch {operation} return: expected {expected} but got {got}")]
    UnexpectedCount {
        operation: &'static str,
        expected: u32,
        got: u32,
    },
}

/// Which map types accept batch operations on the running kernel.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct BatchCapabilities {
    /// Hash and array maps.
    pub generic: bool,
    pub lpm_trie: bool,
}

impl BatchCapabilities {
    /// Probes each map type once. Failures mean "unsupported", older kernels
    /// are expected to fail here.
    pub fn probe(factory: &dyn MapFactory) -> Self {
        let generic = match probe_batch_operations(factory, MapKind::Hash) {
            Ok(()) => {
                info!("Supports generic BPF map batch operations");
                true
            }
            Err(err) => {
                debug!("generic BPF map batch operations unsupported: {}", err);
                false
            }
        };

        let lpm_trie = match probe_batch_operations(factory, MapKind::LpmTrie) {
            Ok(()) => {
                info!("Supports LPM trie BPF map batch operations");
                true
            }
            Err(err) => {
                debug!("LPM trie BPF map batch operations unsupported: {}", err);
                false
            }
        };

        Self { generic, lpm_trie }
    }
}

/// Writes and then deletes a few entries in bulk on a throw away map of
/// type `kind`.
pub fn probe_batch_operations(factory: &dyn MapFactory, kind: MapKind) -> Result<(), ProbeError> {
    // Environments like CI runners might not allow adjusting it.
    let _memlock = factory.raise_memlock().map_err(ProbeError::Memlock)?;

    let values: Vec<u64> = (0..PROBE_ENTRIES as u64).collect();
    let (spec, keys): (MapSpec, Vec<u8>) = match kind {
        MapKind::Array => {
            let keys: Vec<u32> = (0..PROBE_ENTRIES).collect();
            (
                MapSpec::new("probe_batch", kind, 4, 8, PROBE_ENTRIES),
                keys.iter().flat_map(|key| key.to_ne_bytes()).collect(),
            )
        }
        _ => (
            MapSpec::new("probe_batch", kind, 8, 8, PROBE_ENTRIES).with_no_prealloc(true),
            values.iter().flat_map(|key| key.to_ne_bytes()).collect(),
        ),
    };

    let map = factory
        .create_map(&spec)
        .map_err(|source| ProbeError::CreateMap { kind, source })?;

    let value_bytes = unsafe { plain::as_bytes(&values[..]) };
    let updated = map
        .update_batch(&keys, value_bytes, PROBE_ENTRIES, UpdateFlags::Any)
        .map_err(ProbeError::BatchUpdate)?;
    if updated != PROBE_ENTRIES {
        return Err(ProbeError::UnexpectedCount {
            operation: "update",
            expected: PROBE_ENTRIES,
            got: updated,
        });
    }

    let deleted = map
        .delete_batch(&keys, PROBE_ENTRIES)
        .map_err(ProbeError::BatchDelete)?;
    if deleted != PROBE_ENTRIES {
        return Err(ProbeError::UnexpectedCount {
            operation: "delete",
            expected: PROBE_ENTRIES,
            got: deleted,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::maps::memory::InMemoryMapFactory;
    use crate::maps::KernelMap;
    use crate::util::MemlockGuard;

    struct LockedDown;

    impl MapFactory for LockedDown {
        fn create_map(&self, spec: &MapSpec) -> Result<Box<dyn KernelMap>, MapError> {
            InMemoryMapFactory::default().create_map(spec)
        }

        fn raise_memlock(&self) -> Result<MemlockGuard, MapError> {
            Err(MapError::from_errno(libc::EPERM))
        }
    }

    #[rstest]
    #[case::hash(MapKind::Hash)]
    #[case::lpm_trie(MapKind::LpmTrie)]
    fn test_probe_supported(#[case] kind: MapKind) {
        let factory = InMemoryMapFactory::default();
        probe_batch_operations(&factory, kind).unwrap();

        // The probe map is empty again.
        let created = factory.created();
        assert_eq!(created.len(), 1);
        assert!(created[0].is_empty());
        assert_eq!(created[0].open_handles(), 0);
    }

    #[test]
    fn test_arrays_reject_batch_delete() {
        assert!(matches!(
            probe_batch_operations(&InMemoryMapFactory::default(), MapKind::Array),
            Err(ProbeError::BatchDelete(_))
        ));
    }

    #[test]
    fn test_probe_unsupported() {
        let factory = InMemoryMapFactory::new(false);
        assert!(matches!(
            probe_batch_operations(&factory, MapKind::Hash),
            Err(ProbeError::BatchUpdate(_))
        ));
        assert_eq!(
            BatchCapabilities::probe(&factory),
            BatchCapabilities::default()
        );
        assert_eq!(
            BatchCapabilities::probe(&InMemoryMapFactory::default()),
            BatchCapabilities {
                generic: true,
                lpm_trie: true
            }
        );
    }

    #[test]
    fn test_probe_without_memlock() {
        assert!(matches!(
            probe_batch_operations(&LockedDown, MapKind::LpmTrie),
            Err(ProbeError::Memlock(_))
        ));
        assert!(!BatchCapabilities::probe(&LockedDown).generic);
    }
}
