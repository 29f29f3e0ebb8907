use std::sync::Arc;

use tracing::{debug, warn};

use crate::bpf::{
    decode_bias_and_unwind_program, encode_bias_and_unwind_program, FileId, Pid, PidPage,
    PidPageMappingInfo, UnwindProgram, BIT_WIDTH_PAGE,
};
use crate::error::HandlerError;
use crate::maps::{
    delete_batch_plain, delete_plain, lookup_plain, update_plain, KernelMap, MapError, UpdateFlags,
};
use crate::metrics::{ErrorCounter, MetricId};
use crate::util::{ObjectPool, Prefix};

/// Idle scratch records kept per pool.
const POOL_CAPACITY: usize = 64;

/// `pid_page_to_mapping_info`: routes `(pid, address)` to the executable
/// mapped there, its load bias and the unwinder to use.
pub struct PidPageMappings {
    map: Box<dyn KernelMap>,
    keys: ObjectPool<PidPage>,
    values: ObjectPool<PidPageMappingInfo>,
    errors: Arc<ErrorCounter>,
    batch_operations: bool,
}

fn pid_page(pid: Pid, prefix: Prefix) -> Result<PidPage, HandlerError> {
    if prefix.length > BIT_WIDTH_PAGE {
        return Err(HandlerError::InvalidPrefix(prefix.length));
    }
    Ok(PidPage::new(pid, prefix.key, prefix.length))
}

impl PidPageMappings {
    pub fn new(map: Box<dyn KernelMap>, errors: Arc<ErrorCounter>, batch_operations: bool) -> Self {
        Self {
            map,
            keys: ObjectPool::new(POOL_CAPACITY),
            values: ObjectPool::new(POOL_CAPACITY),
            errors,
            batch_operations,
        }
    }

    /// Adds the entry for `prefix` of `pid`. Fails with
    /// [`MapError::AlreadyExists`] if the prefix is already there.
    pub fn insert(
        &self,
        pid: Pid,
        prefix: Prefix,
        file_id: FileId,
        bias: u64,
        program: UnwindProgram,
    ) -> Result<(), HandlerError> {
        let bias_and_unwind_program = encode_bias_and_unwind_program(bias, program)?;
        let key = self.keys.acquire(pid_page(pid, prefix)?);
        let value = self.values.acquire(PidPageMappingInfo {
            file_id: file_id.as_u64(),
            bias_and_unwind_program,
        });

        let result = update_plain(self.map.as_ref(), &*key, &*value, UpdateFlags::NoExist);
        Ok(self
            .errors
            .track(MetricId::PidPageToMappingInfoUpdate, result)?)
    }

    pub fn delete(&self, pid: Pid, prefix: Prefix) -> Result<(), HandlerError> {
        let key = self.keys.acquire(pid_page(pid, prefix)?);
        let result = delete_plain(self.map.as_ref(), &*key);
        Ok(self
            .errors
            .track(MetricId::PidPageToMappingInfoDelete, result)?)
    }

    /// Deletes every prefix of `pid` and returns how many entries were
    /// removed.
    ///
    /// Batch deletes can stop before the end. When that happens all prefixes
    /// are deleted again one by one, and the error carries the count of both
    /// passes. Prefixes already gone are not counted twice.
    pub fn delete_many(&self, pid: Pid, prefixes: &[Prefix]) -> Result<usize, HandlerError> {
        let keys = prefixes
            .iter()
            .map(|prefix| pid_page(pid, *prefix))
            .collect::<Result<Vec<_>, _>>()?;
        if keys.is_empty() {
            return Ok(0);
        }

        if self.batch_operations {
            let result = delete_batch_plain(self.map.as_ref(), &keys);
            match self
                .errors
                .track(MetricId::PidPageToMappingInfoBatchDelete, result)
            {
                Ok(deleted) => return Ok(deleted as usize),
                Err(e) => {
                    debug!(
                        "batch delete of {} prefixes of pid {} stopped: {}, deleting one by one",
                        keys.len(),
                        pid,
                        e
                    );
                    let (deleted, _) = self.delete_one_by_one(&keys);
                    return Err(HandlerError::PartialDelete {
                        deleted: e.processed as usize + deleted,
                        requested: keys.len(),
                        source: Box::new(HandlerError::Batch(e)),
                    });
                }
            }
        }

        let (deleted, errors) = self.delete_one_by_one(&keys);
        if errors.is_empty() {
            return Ok(deleted);
        }
        Err(HandlerError::PartialDelete {
            deleted,
            requested: keys.len(),
            source: Box::new(HandlerError::Multiple(errors)),
        })
    }

    fn delete_one_by_one(&self, keys: &[PidPage]) -> (usize, Vec<MapError>) {
        let mut deleted = 0;
        let mut errors = Vec::new();
        for key in keys {
            let result = delete_plain(self.map.as_ref(), key);
            match self.errors.track(MetricId::PidPageToMappingInfoDelete, result) {
                Ok(()) => deleted += 1,
                Err(e) => errors.push(e),
            }
        }
        if !errors.is_empty() && deleted == 0 {
            warn!("none of {} mappings could be deleted", keys.len());
        }
        (deleted, errors)
    }

    /// File id and bias of the mapping covering `page` of `pid`.
    pub fn lookup(&self, pid: Pid, page: u64) -> Result<(FileId, u64), HandlerError> {
        let key = PidPage::new(pid, page, BIT_WIDTH_PAGE);
        let value: PidPageMappingInfo =
            lookup_plain(self.map.as_ref(), &key)?.ok_or(MapError::NotFound)?;
        let (bias, _) = decode_bias_and_unwind_program(value.bias_and_unwind_program);
        Ok((FileId(value.file_id), bias))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::maps::memory::{InMemoryMapFactory, MapInspector};
    use crate::maps::{MapFactory, MapKind, MapSpec};
    use crate::util::summarize_address_range;

    const PID: Pid = 4242;

    fn mappings(batch_operations: bool) -> (PidPageMappings, MapInspector, Arc<ErrorCounter>) {
        let factory = InMemoryMapFactory::new(batch_operations);
        let map = factory
            .create_map(&MapSpec::new(
                "pid_page_to_mapping_info",
                MapKind::LpmTrie,
                16,
                16,
                4096,
            ))
            .unwrap();
        let inspector = factory.created().remove(0);
        let errors = Arc::new(ErrorCounter::new());
        (
            PidPageMappings::new(map, errors.clone(), batch_operations),
            inspector,
            errors,
        )
    }

    #[test]
    fn test_insert_lookup_delete() {
        let (mappings, _, _) = mappings(true);
        let prefixes = summarize_address_range(0x7f0000001000, 0x7f0000008fff);
        for prefix in &prefixes {
            mappings
                .insert(PID, *prefix, FileId(0xf00), 0x7f0000000000, UnwindProgram::Native)
                .unwrap();
        }

        assert_eq!(
            mappings.lookup(PID, 0x7f0000004321).unwrap(),
            (FileId(0xf00), 0x7f0000000000)
        );
        assert!(mappings.lookup(PID + 1, 0x7f0000004321).is_err());
        assert!(mappings.lookup(PID, 0x7f0000009000).is_err());

        let err = mappings
            .insert(PID, prefixes[0], FileId(1), 0, UnwindProgram::Native)
            .unwrap_err();
        assert!(matches!(err.map_error(), Some(MapError::AlreadyExists)));

        mappings.delete(PID, prefixes[0]).unwrap();
        assert!(matches!(
            mappings.delete(PID, prefixes[0]).unwrap_err().map_error(),
            Some(MapError::NotFound)
        ));
    }

    #[test]
    fn test_invalid_input() {
        let (mappings, inspector, _) = mappings(true);
        assert!(matches!(
            mappings.insert(PID, Prefix::new(0, 65), FileId(1), 0, UnwindProgram::Native),
            Err(HandlerError::InvalidPrefix(65))
        ));
        assert!(matches!(
            mappings.insert(PID, Prefix::address(0), FileId(1), 1 << 56, UnwindProgram::Native),
            Err(HandlerError::EncodingRangeExceeded(_))
        ));
        assert!(inspector.is_empty());
    }

    #[test]
    fn test_interpreter_program_is_stored() {
        let (mappings, inspector, _) = mappings(false);
        mappings
            .insert(PID, Prefix::new(0x1000, 52), FileId(7), 0x10, UnwindProgram::Python)
            .unwrap();
        let value = inspector.get(&inspector.keys()[0]).unwrap();
        let mut info = PidPageMappingInfo::default();
        plain::copy_from_bytes(&mut info, &value).unwrap();
        assert_eq!(
            decode_bias_and_unwind_program(info.bias_and_unwind_program),
            (0x10, UnwindProgram::Python as u8)
        );
    }

    fn insert_all(mappings: &PidPageMappings, n: u64) -> Vec<Prefix> {
        let prefixes: Vec<Prefix> = (0..n).map(|i| Prefix::new(i << 16, 48)).collect();
        for prefix in &prefixes {
            mappings
                .insert(PID, *prefix, FileId(1), 0, UnwindProgram::Native)
                .unwrap();
        }
        prefixes
    }

    #[rstest]
    fn test_delete_many(#[values(true, false)] batch_operations: bool) {
        let (mappings, inspector, errors) = mappings(batch_operations);
        let prefixes = insert_all(&mappings, 10);
        assert_eq!(mappings.delete_many(PID, &prefixes).unwrap(), 10);
        assert!(inspector.is_empty());
        assert!(errors.collect().is_empty());
        assert_eq!(mappings.delete_many(PID, &[]).unwrap(), 0);
    }

    #[test]
    fn test_delete_many_missing_prefixes() {
        let (mappings, inspector, errors) = mappings(false);
        let prefixes = insert_all(&mappings, 4);
        mappings.delete(PID, prefixes[1]).unwrap();
        mappings.delete(PID, prefixes[2]).unwrap();

        match mappings.delete_many(PID, &prefixes) {
            Err(HandlerError::PartialDelete {
                deleted,
                requested,
                source,
            }) => {
                assert_eq!((deleted, requested), (2, 4));
                assert!(matches!(*source, HandlerError::Multiple(ref e) if e.len() == 2));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(inspector.is_empty());
        assert_eq!(errors.collect()[0].value, 2);
    }

    #[test]
    fn test_delete_many_falls_back_after_partial_batch() {
        let n = 8;
        for processed in 0..=n {
            let (mappings, inspector, errors) = mappings(true);
            let prefixes = insert_all(&mappings, n as u64);
            inspector.fail_next_batch_delete_after(processed);

            match mappings.delete_many(PID, &prefixes) {
                Err(HandlerError::PartialDelete {
                    deleted,
                    requested,
                    source,
                }) => {
                    assert_eq!(deleted, n as usize, "processed {}", processed);
                    assert_eq!(requested, n as usize);
                    assert!(matches!(*source, HandlerError::Batch(ref e) if e.processed == processed));
                }
                other => panic!("unexpected {:?}", other),
            }
            assert!(inspector.is_empty());
            let metrics = errors.collect();
            assert!(metrics
                .iter()
                .any(|m| m.id == MetricId::PidPageToMappingInfoBatchDelete));
        }
    }
}
