use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

/// Kinds of map operations whose failures are counted.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MetricId {
    UnwindInfoArrayUpdate,
    ExeIdToStackDeltasBatchUpdate,
    ExeIdToStackDeltasUpdate,
    ExeIdToStackDeltasOuterUpdate,
    ExeIdToStackDeltasOuterDelete,
    StackDeltaPageToInfoBatchUpdate,
    StackDeltaPageToInfoUpdate,
    StackDeltaPageToInfoDelete,
    PidPageToMappingInfoUpdate,
    PidPageToMappingInfoDelete,
    PidPageToMappingInfoBatchDelete,
    InterpreterOffsetsUpdate,
    ProcDataUpdate,
    ProcDataDelete,
}

impl MetricId {
    pub fn name(&self) -> &'static str {
        match self {
            MetricId::UnwindInfoArrayUpdate => "unwind_info_array_update_errors",
            MetricId::ExeIdToStackDeltasBatchUpdate => "exe_id_to_stack_deltas_batch_update_errors",
            MetricId::ExeIdToStackDeltasUpdate => "exe_id_to_stack_deltas_update_errors",
            MetricId::ExeIdToStackDeltasOuterUpdate => "exe_id_to_stack_deltas_outer_update_errors",
            MetricId::ExeIdToStackDeltasOuterDelete => "exe_id_to_stack_deltas_outer_delete_errors",
            MetricId::StackDeltaPageToInfoBatchUpdate => {
                "stack_delta_page_to_info_batch_update_errors"
            }
            MetricId::StackDeltaPageToInfoUpdate => "stack_delta_page_to_info_update_errors",
            MetricId::StackDeltaPageToInfoDelete => "stack_delta_page_to_info_delete_errors",
            MetricId::PidPageToMappingInfoUpdate => "pid_page_to_mapping_info_update_errors",
            MetricId::PidPageToMappingInfoDelete => "pid_page_to_mapping_info_delete_errors",
            MetricId::PidPageToMappingInfoBatchDelete => {
                "pid_page_to_mapping_info_batch_delete_errors"
            }
            MetricId::InterpreterOffsetsUpdate => "interpreter_offsets_update_errors",
            MetricId::ProcDataUpdate => "proc_data_update_errors",
            MetricId::ProcDataDelete => "proc_data_delete_errors",
        }
    }
}

impl fmt::Display for MetricId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Metric {
    pub id: MetricId,
    pub value: u64,
}

/// Counts map operation failures per [`MetricId`] until collected.
#[derive(Debug, Default)]
pub struct ErrorCounter {
    counts: Mutex<HashMap<MetricId, u64>>,
}

impl ErrorCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts `result` if it is an error and hands it back untouched.
    pub fn track<T, E>(&self, id: MetricId, result: Result<T, E>) -> Result<T, E> {
        if result.is_err() {
            self.increment(id);
        }
        result
    }

    pub fn increment(&self, id: MetricId) {
        *self
            .counts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(id)
            .or_insert(0) += 1;
    }

    /// Returns the counts gathered since the last call and resets them.
    ///
    /// Kinds that saw no errors since then are not reported at all.
    pub fn collect(&self) -> Vec<Metric> {
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        let mut metrics: Vec<Metric> = counts
            .drain()
            .map(|(id, value)| Metric { id, value })
            .collect();
        metrics.sort_by_key(|metric| metric.id);
        metrics
    }
}
