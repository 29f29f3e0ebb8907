use std::collections::HashMap;
use std::mem::size_of;
use std::ops::Range;
use std::sync::Arc;

use crossbeam_channel::Receiver;
use tracing::{debug, error, info};

use crate::address_mapping::PidPageMappings;
use crate::bpf::{
    FileId, InterpreterType, OffsetRange, Pid, PidPage, PidPageMappingInfo, StackDelta,
    StackDeltaPageInfo, StackDeltaPageKey, UnwindInfo, UnwindProgram,
};
use crate::capabilities::BatchCapabilities;
use crate::error::HandlerError;
use crate::maps::{update_plain, KernelMap, MapFactory, MapKind, MapSpec, UpdateFlags};
use crate::metrics::{ErrorCounter, Metric, MetricId};
use crate::stack_deltas::{BucketRange, StackDeltaBuckets};
use crate::update_pool::AsyncMapUpdaterPool;
use crate::util::Prefix;

/// Everything the rest of the profiler does with the BPF maps.
pub trait EbpfHandler: Send + Sync {
    /// Stores the per process data of an interpreter, `data` being the raw
    /// record the BPF side expects for `typ`.
    fn update_proc_data(
        &self,
        typ: InterpreterType,
        pid: Pid,
        data: &[u8],
    ) -> Result<(), HandlerError>;
    fn delete_proc_data(&self, typ: InterpreterType, pid: Pid) -> Result<(), HandlerError>;

    /// Marks the one or two text ranges of the interpreter loop in `file_id`.
    fn update_interpreter_offsets(
        &self,
        program_index: u16,
        file_id: FileId,
        ranges: &[Range<u64>],
    ) -> Result<(), HandlerError>;

    /// Routes `prefix` of `pid` to an interpreter unwinder.
    fn update_pid_interpreter_mapping(
        &self,
        pid: Pid,
        prefix: Prefix,
        program: UnwindProgram,
        file_id: FileId,
        bias: u64,
    ) -> Result<(), HandlerError>;
    fn delete_pid_interpreter_mapping(&self, pid: Pid, prefix: Prefix)
        -> Result<(), HandlerError>;

    /// Best effort, the BPF side adds pids again as needed.
    fn remove_reported_pid(&self, pid: Pid);

    fn update_unwind_info(&self, index: u16, info: UnwindInfo) -> Result<(), HandlerError>;

    /// Returns the bucket the deltas were stored in.
    fn update_exe_id_to_stack_deltas(
        &self,
        file_id: FileId,
        deltas: &[StackDelta],
    ) -> Result<u16, HandlerError>;
    fn delete_exe_id_to_stack_deltas(&self, file_id: FileId, bucket: u16)
        -> Result<(), HandlerError>;
    fn update_stack_delta_pages(
        &self,
        file_id: FileId,
        deltas_per_page: &[u16],
        bucket: u16,
        first_page: u64,
    ) -> Result<(), HandlerError>;
    fn delete_stack_delta_page(&self, file_id: FileId, page: u64) -> Result<(), HandlerError>;

    fn update_pid_page_mapping_info(
        &self,
        pid: Pid,
        prefix: Prefix,
        file_id: FileId,
        bias: u64,
    ) -> Result<(), HandlerError>;
    /// Returns how many of `prefixes` were deleted.
    fn delete_pid_page_mapping_info(
        &self,
        pid: Pid,
        prefixes: &[Prefix],
    ) -> Result<usize, HandlerError>;
    fn lookup_pid_page_information(
        &self,
        pid: Pid,
        page: u64,
    ) -> Result<(FileId, u64), HandlerError>;

    /// Error counts since the previous call.
    fn collect_metrics(&self) -> Vec<Metric>;
    fn supports_generic_batch_operations(&self) -> bool;
    fn supports_lpm_trie_batch_operations(&self) -> bool;

    /// Blocks until queued stack delta links and unlinks have been applied.
    fn flush_pending_updates(&self);
}

#[derive(Debug, Clone)]
pub struct HandlerConfig {
    pub update_pool_workers: usize,
    pub update_pool_queue_cap: usize,
    pub bucket_range: BucketRange,
    /// Skip probing and always use one syscall per element.
    pub disable_batch_operations: bool,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            update_pool_workers: 16,
            update_pool_queue_cap: 8,
            bucket_range: BucketRange::default(),
            disable_batch_operations: false,
        }
    }
}

const INTERPRETER_OFFSETS: &str = "interpreter_offsets";
const STACK_DELTA_PAGE_TO_INFO: &str = "stack_delta_page_to_info";
const PID_PAGE_TO_MAPPING_INFO: &str = "pid_page_to_mapping_info";
const UNWIND_INFO_ARRAY: &str = "unwind_info_array";
const REPORTED_PIDS: &str = "reported_pids";

/// Maps the handler needs. Loaders can check a BPF object against these,
/// tests can create them.
///
/// The value size of the per process maps depends on the interpreter and is
/// left at 0.
pub fn required_map_specs(config: &HandlerConfig) -> Vec<MapSpec> {
    let mut specs = vec![
        MapSpec::new(
            INTERPRETER_OFFSETS,
            MapKind::Hash,
            size_of::<u64>() as u32,
            size_of::<OffsetRange>() as u32,
            32,
        ),
        MapSpec::new(
            STACK_DELTA_PAGE_TO_INFO,
            MapKind::Hash,
            size_of::<StackDeltaPageKey>() as u32,
            size_of::<StackDeltaPageInfo>() as u32,
            40_000,
        ),
        MapSpec::new(
            PID_PAGE_TO_MAPPING_INFO,
            MapKind::LpmTrie,
            size_of::<PidPage>() as u32,
            size_of::<PidPageMappingInfo>() as u32,
            524_288,
        ),
        MapSpec::new(
            UNWIND_INFO_ARRAY,
            MapKind::Array,
            size_of::<u32>() as u32,
            size_of::<UnwindInfo>() as u32,
            16_384,
        ),
        MapSpec::new(REPORTED_PIDS, MapKind::Hash, size_of::<u32>() as u32, 8, 65_536),
    ];

    specs.extend(
        InterpreterType::WITH_PROC_DATA
            .iter()
            .filter_map(|typ| typ.proc_map_name())
            .map(|name| MapSpec::new(name, MapKind::Hash, size_of::<u32>() as u32, 0, 1024)),
    );

    specs.extend(config.bucket_range.buckets().map(|bucket| {
        MapSpec::new(
            BucketRange::outer_map_name(bucket),
            MapKind::HashOfMaps,
            size_of::<u64>() as u32,
            size_of::<u32>() as u32,
            4096,
        )
    }));

    specs
}

/// Key and value of `interpreter_offsets` for the loop of an interpreter.
/// The second range is optional, for loops split in hot and cold parts.
pub fn interpreter_offset_key_value(
    program_index: u16,
    file_id: FileId,
    ranges: &[Range<u64>],
) -> Result<(u64, OffsetRange), HandlerError> {
    let (first, second) = match ranges {
        [first] => (first, None),
        [first, second] => (first, Some(second)),
        _ => return Err(HandlerError::InvalidRanges(ranges.len())),
    };

    let mut value = OffsetRange {
        lower_offset1: first.start,
        upper_offset1: first.end,
        program_index,
        ..Default::default()
    };
    if let Some(second) = second {
        value.lower_offset2 = second.start;
        value.upper_offset2 = second.end;
    }

    Ok((file_id.as_u64(), value))
}

fn take_map(
    maps: &mut HashMap<String, Box<dyn KernelMap>>,
    name: &str,
) -> Result<Box<dyn KernelMap>, HandlerError> {
    maps.remove(name)
        .ok_or_else(|| HandlerError::MissingMap(name.to_string()))
}

/// The [`EbpfHandler`] over the maps of the loaded BPF object.
pub struct EbpfMaps {
    interpreter_offsets: Box<dyn KernelMap>,
    proc_data: HashMap<InterpreterType, Box<dyn KernelMap>>,
    unwind_info_array: Box<dyn KernelMap>,
    reported_pids: Box<dyn KernelMap>,
    stack_deltas: StackDeltaBuckets,
    mappings: PidPageMappings,
    errors: Arc<ErrorCounter>,
    capabilities: BatchCapabilities,
}

impl EbpfMaps {
    /// Takes the maps the handler needs out of `maps`, keyed by name, probes
    /// for batch operations and starts the update workers. The workers stop
    /// once `stop` receives a value or disconnects.
    pub fn load(
        mut maps: HashMap<String, Box<dyn KernelMap>>,
        factory: Arc<dyn MapFactory>,
        config: HandlerConfig,
        stop: Receiver<()>,
    ) -> Result<Self, HandlerError> {
        config.bucket_range.validate()?;

        let interpreter_offsets = take_map(&mut maps, INTERPRETER_OFFSETS)?;
        let page_to_info = take_map(&mut maps, STACK_DELTA_PAGE_TO_INFO)?;
        let pid_page_to_mapping_info = take_map(&mut maps, PID_PAGE_TO_MAPPING_INFO)?;
        let unwind_info_array = take_map(&mut maps, UNWIND_INFO_ARRAY)?;
        let reported_pids = take_map(&mut maps, REPORTED_PIDS)?;

        let mut proc_data = HashMap::new();
        for typ in InterpreterType::WITH_PROC_DATA {
            if let Some(name) = typ.proc_map_name() {
                proc_data.insert(typ, take_map(&mut maps, name)?);
            }
        }

        let outer_maps = config
            .bucket_range
            .buckets()
            .map(|bucket| take_map(&mut maps, &BucketRange::outer_map_name(bucket)))
            .collect::<Result<Vec<_>, _>>()?;

        let capabilities = if config.disable_batch_operations {
            info!("BPF map batch operations disabled");
            BatchCapabilities::default()
        } else {
            BatchCapabilities::probe(factory.as_ref())
        };

        let errors = Arc::new(ErrorCounter::new());
        let updates = AsyncMapUpdaterPool::new(
            config.update_pool_workers,
            config.update_pool_queue_cap,
            stop,
            errors.clone(),
        )
        .map_err(HandlerError::Spawn)?;

        let stack_deltas = StackDeltaBuckets::new(
            config.bucket_range,
            outer_maps,
            page_to_info,
            factory,
            updates,
            errors.clone(),
            capabilities.generic,
        )?;
        let mappings =
            PidPageMappings::new(pid_page_to_mapping_info, errors.clone(), capabilities.lpm_trie);

        debug!("{} unused maps", maps.len());

        Ok(Self {
            interpreter_offsets,
            proc_data,
            unwind_info_array,
            reported_pids,
            stack_deltas,
            mappings,
            errors,
            capabilities,
        })
    }

    fn proc_data_map(&self, typ: InterpreterType) -> Result<&dyn KernelMap, HandlerError> {
        self.proc_data
            .get(&typ)
            .map(|map| map.as_ref())
            .ok_or(HandlerError::UnsupportedInterpreterType(typ))
    }
}

impl EbpfHandler for EbpfMaps {
    fn update_proc_data(
        &self,
        typ: InterpreterType,
        pid: Pid,
        data: &[u8],
    ) -> Result<(), HandlerError> {
        debug!("loading {:?} data of pid {} into BPF maps", typ, pid);
        let map = self.proc_data_map(typ)?;
        let result = map.update(&pid.to_ne_bytes(), data, UpdateFlags::Any);
        Ok(self.errors.track(MetricId::ProcDataUpdate, result)?)
    }

    fn delete_proc_data(&self, typ: InterpreterType, pid: Pid) -> Result<(), HandlerError> {
        debug!("removing {:?} data of pid {} from BPF maps", typ, pid);
        let map = self.proc_data_map(typ)?;
        let result = map.delete(&pid.to_ne_bytes());
        Ok(self.errors.track(MetricId::ProcDataDelete, result)?)
    }

    fn update_interpreter_offsets(
        &self,
        program_index: u16,
        file_id: FileId,
        ranges: &[Range<u64>],
    ) -> Result<(), HandlerError> {
        let (key, value) = interpreter_offset_key_value(program_index, file_id, ranges)?;
        let result = update_plain(
            self.interpreter_offsets.as_ref(),
            &key,
            &value,
            UpdateFlags::Any,
        );
        self.errors
            .track(MetricId::InterpreterOffsetsUpdate, result)
            .map_err(|e| {
                error!("failed to place interpreter range of {}: {}", file_id, e);
                e.into()
            })
    }

    fn update_pid_interpreter_mapping(
        &self,
        pid: Pid,
        prefix: Prefix,
        program: UnwindProgram,
        file_id: FileId,
        bias: u64,
    ) -> Result<(), HandlerError> {
        self.mappings.insert(pid, prefix, file_id, bias, program)
    }

    fn delete_pid_interpreter_mapping(
        &self,
        pid: Pid,
        prefix: Prefix,
    ) -> Result<(), HandlerError> {
        self.mappings.delete(pid, prefix)
    }

    fn remove_reported_pid(&self, pid: Pid) {
        let _ = self.reported_pids.delete(&pid.to_ne_bytes());
    }

    fn update_unwind_info(&self, index: u16, info: UnwindInfo) -> Result<(), HandlerError> {
        let capacity = self.unwind_info_array.max_entries();
        if index as u32 >= capacity {
            return Err(HandlerError::IndexOutOfRange { index, capacity });
        }

        let result = update_plain(
            self.unwind_info_array.as_ref(),
            &(index as u32),
            &info,
            UpdateFlags::Any,
        );
        Ok(self
            .errors
            .track(MetricId::UnwindInfoArrayUpdate, result)?)
    }

    fn update_exe_id_to_stack_deltas(
        &self,
        file_id: FileId,
        deltas: &[StackDelta],
    ) -> Result<u16, HandlerError> {
        self.stack_deltas.install(file_id, deltas)
    }

    fn delete_exe_id_to_stack_deltas(
        &self,
        file_id: FileId,
        bucket: u16,
    ) -> Result<(), HandlerError> {
        self.stack_deltas.uninstall(file_id, bucket)
    }

    fn update_stack_delta_pages(
        &self,
        file_id: FileId,
        deltas_per_page: &[u16],
        bucket: u16,
        first_page: u64,
    ) -> Result<(), HandlerError> {
        self.stack_deltas
            .update_page_index(file_id, deltas_per_page, bucket, first_page)
    }

    fn delete_stack_delta_page(&self, file_id: FileId, page: u64) -> Result<(), HandlerError> {
        self.stack_deltas.remove_page_index(file_id, page)
    }

    fn update_pid_page_mapping_info(
        &self,
        pid: Pid,
        prefix: Prefix,
        file_id: FileId,
        bias: u64,
    ) -> Result<(), HandlerError> {
        self.mappings
            .insert(pid, prefix, file_id, bias, UnwindProgram::Native)
    }

    fn delete_pid_page_mapping_info(
        &self,
        pid: Pid,
        prefixes: &[Prefix],
    ) -> Result<usize, HandlerError> {
        self.mappings.delete_many(pid, prefixes)
    }

    fn lookup_pid_page_information(
        &self,
        pid: Pid,
        page: u64,
    ) -> Result<(FileId, u64), HandlerError> {
        self.mappings.lookup(pid, page)
    }

    fn collect_metrics(&self) -> Vec<Metric> {
        self.errors.collect()
    }

    fn supports_generic_batch_operations(&self) -> bool {
        self.capabilities.generic
    }

    fn supports_lpm_trie_batch_operations(&self) -> bool {
        self.capabilities.lpm_trie
    }

    fn flush_pending_updates(&self) {
        self.stack_deltas.flush();
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(&[], false)]
    #[case(&[0x10..0x20], true)]
    #[case(&[0x10..0x20, 0x80..0x90], true)]
    #[case(&[0x10..0x20, 0x80..0x90, 0x100..0x110], false)]
    fn test_interpreter_offset_range_count(#[case] ranges: &[Range<u64>], #[case] ok: bool) {
        assert_eq!(
            interpreter_offset_key_value(3, FileId(0xabc), ranges).is_ok(),
            ok
        );
    }

    #[test]
    fn test_interpreter_offset_key_value() {
        let (key, value) = interpreter_offset_key_value(3, FileId(0xabc), &[0x10..0x20]).unwrap();
        assert_eq!(key, 0xabc);
        assert_eq!(
            value,
            OffsetRange {
                lower_offset1: 0x10,
                upper_offset1: 0x20,
                lower_offset2: 0,
                upper_offset2: 0,
                program_index: 3,
                _pad: [0; 6],
            }
        );

        let (_, value) =
            interpreter_offset_key_value(3, FileId(0xabc), &[0x10..0x20, 0x80..0x90]).unwrap();
        assert_eq!((value.lower_offset2, value.upper_offset2), (0x80, 0x90));
    }

    #[test]
    fn test_required_map_specs() {
        let config = HandlerConfig::default();
        let specs = required_map_specs(&config);
        // 5 shared maps, 9 interpreters and 20 buckets.
        assert_eq!(specs.len(), 5 + 9 + 20);
        assert!(specs
            .iter()
            .any(|spec| spec.name == "exe_id_to_23_stack_deltas"));
        assert!(!specs
            .iter()
            .any(|spec| spec.name == "exe_id_to_24_stack_deltas"));
    }
}
