//! Per executable stack deltas.
//!
//! Each executable gets its own array map holding its deltas, sized to the
//! next power of two. The array is linked into the outer map-in-map of its
//! size class ("bucket") keyed by file id, and `stack_delta_page_to_info`
//! points every 16 bit page of the executable at its run of deltas.

pub mod pages;

use std::mem::size_of;
use std::ops::RangeInclusive;
use std::sync::Arc;

use tracing::{debug, error};

use crate::bpf::{
    FileId, StackDelta, StackDeltaPageInfo, StackDeltaPageKey, STACK_DELTA_BUCKET_LARGEST,
    STACK_DELTA_BUCKET_SMALLEST, STACK_DELTA_PAGE_SIZE,
};
use crate::error::HandlerError;
use crate::maps::{
    delete_plain, update_batch_plain, update_plain, KernelMap, MapFactory, MapKind, MapSpec,
    UpdateFlags,
};
use crate::metrics::{ErrorCounter, MetricId};
use crate::update_pool::AsyncMapUpdaterPool;

/// Buckets with an outer map. Bucket `n` holds executables with up to `2^n`
/// stack deltas.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BucketRange {
    pub smallest: u16,
    pub largest: u16,
}

impl Default for BucketRange {
    fn default() -> Self {
        Self {
            smallest: STACK_DELTA_BUCKET_SMALLEST,
            largest: STACK_DELTA_BUCKET_LARGEST,
        }
    }
}

impl BucketRange {
    /// Inner array maps are indexed with a u32.
    const MAX_BUCKET: u16 = 31;

    pub fn validate(&self) -> Result<(), HandlerError> {
        if self.largest > Self::MAX_BUCKET {
            return Err(HandlerError::InvalidBucket(self.largest));
        }
        if self.smallest > self.largest {
            return Err(HandlerError::InvalidBucket(self.smallest));
        }
        Ok(())
    }

    pub fn contains(&self, bucket: u16) -> bool {
        (self.smallest..=self.largest).contains(&bucket)
    }

    pub fn buckets(&self) -> RangeInclusive<u16> {
        self.smallest..=self.largest
    }

    pub fn capacity(bucket: u16) -> u64 {
        1 << bucket
    }

    pub fn max_deltas(&self) -> u64 {
        Self::capacity(self.largest)
    }

    /// Smallest bucket whose capacity covers `num_deltas`.
    pub fn bucket_for(&self, num_deltas: usize) -> Option<u16> {
        let needed_bits = match num_deltas {
            0 | 1 => 0,
            n => usize::BITS - (n - 1).leading_zeros(),
        };
        let bucket = (needed_bits as u16).max(self.smallest);
        (bucket <= self.largest).then_some(bucket)
    }

    pub fn outer_map_name(bucket: u16) -> String {
        format!("exe_id_to_{}_stack_deltas", bucket)
    }
}

pub struct StackDeltaBuckets {
    range: BucketRange,
    outer_maps: Vec<Arc<dyn KernelMap>>,
    page_to_info: Box<dyn KernelMap>,
    factory: Arc<dyn MapFactory>,
    updates: AsyncMapUpdaterPool,
    errors: Arc<ErrorCounter>,
    batch_operations: bool,
}

impl StackDeltaBuckets {
    /// `outer_maps` holds one map per bucket of `range`, in order.
    pub fn new(
        range: BucketRange,
        outer_maps: Vec<Box<dyn KernelMap>>,
        page_to_info: Box<dyn KernelMap>,
        factory: Arc<dyn MapFactory>,
        updates: AsyncMapUpdaterPool,
        errors: Arc<ErrorCounter>,
        batch_operations: bool,
    ) -> Result<Self, HandlerError> {
        range.validate()?;
        if outer_maps.len() != range.buckets().len() {
            return Err(HandlerError::OuterMapCount {
                expected: range.buckets().len(),
                got: outer_maps.len(),
            });
        }

        Ok(Self {
            range,
            outer_maps: outer_maps.into_iter().map(Arc::from).collect(),
            page_to_info,
            factory,
            updates,
            errors,
            batch_operations,
        })
    }

    pub fn range(&self) -> BucketRange {
        self.range
    }

    fn outer_map(&self, bucket: u16) -> Result<Arc<dyn KernelMap>, HandlerError> {
        if !self.range.contains(bucket) {
            return Err(HandlerError::InvalidBucket(bucket));
        }
        Ok(self.outer_maps[(bucket - self.range.smallest) as usize].clone())
    }

    /// Creates and fills the inner map for `file_id` and queues linking it
    /// into the outer map of its bucket. Returns the bucket.
    ///
    /// The link happens in the background, it might not have landed yet when
    /// this returns.
    pub fn install(&self, file_id: FileId, deltas: &[StackDelta]) -> Result<u16, HandlerError> {
        let bucket =
            self.range
                .bucket_for(deltas.len())
                .ok_or(HandlerError::CapacityExceeded {
                    deltas: deltas.len(),
                    max: self.range.max_deltas(),
                })?;
        let outer = self.outer_map(bucket)?;

        let _memlock = self.factory.raise_memlock()?;
        let inner = self.factory.create_map(&MapSpec::new(
            format!("inner_{}", bucket),
            MapKind::Array,
            size_of::<u32>() as u32,
            size_of::<StackDelta>() as u32,
            BucketRange::capacity(bucket) as u32,
        ))?;

        // The pool and this function both need an open handle and either can
        // finish first, so the pool gets its own.
        let handed_off = inner.try_clone()?;
        self.updates.enqueue_update(outer, file_id, Some(handed_off));

        if deltas.is_empty() {
            return Ok(bucket);
        }

        if self.batch_operations {
            let keys: Vec<u32> = (0..deltas.len() as u32).collect();
            let result = update_batch_plain(inner.as_ref(), &keys, deltas, UpdateFlags::Any);
            self.errors
                .track(MetricId::ExeIdToStackDeltasBatchUpdate, result)
                .map_err(|e| {
                    error!(
                        "failed to batch insert {} deltas for {}: {}",
                        deltas.len(),
                        file_id,
                        e
                    );
                    e
                })?;
            return Ok(bucket);
        }

        for (index, delta) in deltas.iter().enumerate() {
            let result = update_plain(inner.as_ref(), &(index as u32), delta, UpdateFlags::Any);
            self.errors
                .track(MetricId::ExeIdToStackDeltasUpdate, result)
                .map_err(|e| {
                    error!(
                        "failed to insert delta {} for {}: {}",
                        index, file_id, e
                    );
                    e
                })?;
        }

        debug!(
            "installed {} stack deltas for {} in bucket {}",
            deltas.len(),
            file_id,
            bucket
        );
        Ok(bucket)
    }

    /// Queues unlinking the inner map of `file_id`, which frees it.
    pub fn uninstall(&self, file_id: FileId, bucket: u16) -> Result<(), HandlerError> {
        let outer = self.outer_map(bucket)?;
        self.updates.enqueue_update(outer, file_id, None);
        Ok(())
    }

    /// Points the pages starting at `first_page` at consecutive runs of
    /// `deltas_per_page[n]` deltas. Fails if any page is already present.
    pub fn update_page_index(
        &self,
        file_id: FileId,
        deltas_per_page: &[u16],
        bucket: u16,
        first_page: u64,
    ) -> Result<(), HandlerError> {
        if !self.range.contains(bucket) {
            return Err(HandlerError::InvalidBucket(bucket));
        }

        let mut first_delta = 0_u32;
        let mut keys = Vec::with_capacity(deltas_per_page.len());
        let mut values = Vec::with_capacity(deltas_per_page.len());
        for (page_number, &num_deltas) in deltas_per_page.iter().enumerate() {
            let page = (page_number as u64)
                .checked_mul(STACK_DELTA_PAGE_SIZE)
                .and_then(|offset| first_page.checked_add(offset));
            let Some(page) = page else {
                return Err(HandlerError::PageOutOfRange {
                    first_page,
                    pages: deltas_per_page.len(),
                });
            };
            keys.push(StackDeltaPageKey {
                file_id: file_id.as_u64(),
                page,
            });
            values.push(StackDeltaPageInfo {
                first_delta,
                num_deltas,
                map_id: bucket,
            });
            first_delta += num_deltas as u32;
        }

        if keys.is_empty() {
            return Ok(());
        }

        if self.batch_operations {
            let result = update_batch_plain(
                self.page_to_info.as_ref(),
                &keys,
                &values,
                UpdateFlags::NoExist,
            );
            self.errors
                .track(MetricId::StackDeltaPageToInfoBatchUpdate, result)?;
            return Ok(());
        }

        for (key, value) in keys.iter().zip(&values) {
            let result = update_plain(self.page_to_info.as_ref(), key, value, UpdateFlags::NoExist);
            self.errors
                .track(MetricId::StackDeltaPageToInfoUpdate, result)?;
        }
        Ok(())
    }

    pub fn remove_page_index(&self, file_id: FileId, page: u64) -> Result<(), HandlerError> {
        let key = StackDeltaPageKey {
            file_id: file_id.as_u64(),
            page,
        };
        let result = delete_plain(self.page_to_info.as_ref(), &key);
        Ok(self
            .errors
            .track(MetricId::StackDeltaPageToInfoDelete, result)?)
    }

    /// Waits for the queued links and unlinks to be applied.
    pub fn flush(&self) {
        self.updates.flush();
    }
}
