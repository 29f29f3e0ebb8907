//! Background workers that link and unlink stack delta maps in the outer
//! map-in-maps.
//!
//! Updating a map-in-map waits for an RCU grace period in the kernel, which
//! can take a while, so callers hand these updates off and carry on. Updates
//! for the same file always go to the same worker to keep their order.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, select, Receiver, Sender, TryRecvError};
use tracing::{debug, error, warn};

use crate::bpf::FileId;
use crate::maps::{KernelMap, UpdateFlags};
use crate::metrics::{ErrorCounter, MetricId};

/// Link `inner` under `file_id` in `outer`, or remove `file_id` from `outer`
/// when there's no inner map.
struct MapUpdate {
    outer: Arc<dyn KernelMap>,
    file_id: FileId,
    inner: Option<Box<dyn KernelMap>>,
}

enum Job {
    Apply(MapUpdate),
    Flush(Sender<()>),
}

pub struct AsyncMapUpdaterPool {
    inboxes: Vec<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    watcher: Option<JoinHandle<()>>,
    /// Disconnects once the pool is shutting down.
    shutdown: Receiver<()>,
    /// Dropping it releases the watcher when nobody ever signalled `stop`.
    closed: Option<Sender<()>>,
}

impl AsyncMapUpdaterPool {
    /// Spawns `workers` threads with an inbox of `queue_cap` jobs each. The
    /// pool shuts down when `stop` yields a value or is disconnected.
    pub fn new(
        workers: usize,
        queue_cap: usize,
        stop: Receiver<()>,
        errors: Arc<ErrorCounter>,
    ) -> Result<Self, io::Error> {
        let workers_count = workers.max(1);
        let (shutdown_send, shutdown_receive) = bounded::<()>(0);
        let (closed_send, closed_receive) = bounded::<()>(0);

        let watcher = thread::Builder::new()
            .name("map-updater-stop".to_string())
            .spawn(move || {
                select! {
                    recv(stop) -> _ => debug!("stopping map update workers"),
                    recv(closed_receive) -> _ => {},
                }
                drop(shutdown_send);
            })?;

        let mut pool = Self {
            inboxes: Vec::with_capacity(workers_count),
            workers: Vec::with_capacity(workers_count),
            watcher: Some(watcher),
            shutdown: shutdown_receive,
            closed: Some(closed_send),
        };

        for i in 0..workers_count {
            let (send, receive) = bounded::<Job>(queue_cap);
            let shutdown = pool.shutdown.clone();
            let errors = errors.clone();
            // On error the pool is dropped, which joins what was spawned.
            let handle = thread::Builder::new()
                .name(format!("map-updater-{}", i))
                .spawn(move || run_worker(receive, shutdown, &errors))?;
            pool.inboxes.push(send);
            pool.workers.push(handle);
        }

        Ok(pool)
    }

    /// Queues an update of `outer` for `file_id`. Blocks while the inbox of
    /// the worker owning `file_id` is full. Once the pool stopped the update
    /// is dropped and its inner map handle closed.
    pub fn enqueue_update(
        &self,
        outer: Arc<dyn KernelMap>,
        file_id: FileId,
        inner: Option<Box<dyn KernelMap>>,
    ) {
        let worker = (file_id.as_u64() % self.inboxes.len() as u64) as usize;
        let job = Job::Apply(MapUpdate {
            outer,
            file_id,
            inner,
        });

        // Only a panicked worker drops its inbox, the job is closed here.
        if self.inboxes[worker].send(job).is_err() {
            warn!("map update worker {} is gone, dropping update for {}", worker, file_id);
        }
    }

    /// Waits until every update queued before this call has been applied,
    /// or the pool stopped.
    pub fn flush(&self) {
        let (ack_send, ack_receive) = bounded::<()>(self.inboxes.len());
        let mut pending = 0;
        for inbox in &self.inboxes {
            if inbox.send(Job::Flush(ack_send.clone())).is_ok() {
                pending += 1;
            }
        }
        drop(ack_send);

        while pending > 0 {
            select! {
                recv(ack_receive) -> ack => {
                    if ack.is_err() {
                        return;
                    }
                    pending -= 1;
                },
                recv(self.shutdown) -> _ => return,
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        is_shut_down(&self.shutdown)
    }
}

impl Drop for AsyncMapUpdaterPool {
    fn drop(&mut self) {
        self.inboxes.clear();
        self.closed.take();

        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("map update worker panicked");
            }
        }
        if let Some(watcher) = self.watcher.take() {
            let _ = watcher.join();
        }
    }
}

fn is_shut_down(shutdown: &Receiver<()>) -> bool {
    matches!(shutdown.try_recv(), Err(TryRecvError::Disconnected))
}

fn run_worker(inbox: Receiver<Job>, shutdown: Receiver<()>, errors: &ErrorCounter) {
    loop {
        if is_shut_down(&shutdown) {
            discard(&inbox);
            return;
        }

        select! {
            recv(shutdown) -> _ => {
                discard(&inbox);
                return;
            },
            recv(inbox) -> job => match job {
                Ok(Job::Apply(update)) => apply(update, errors),
                Ok(Job::Flush(ack)) => {
                    let _ = ack.send(());
                }
                Err(_) => return,
            },
        }
    }
}

/// Closes the inner map handles of jobs that will never run, including the
/// ones queued after shutdown, until the pool drops the inbox.
fn discard(inbox: &Receiver<Job>) {
    let mut dropped = 0;
    for job in inbox.iter() {
        match job {
            Job::Apply(update) => {
                if update.inner.is_some() {
                    dropped += 1;
                    debug!("closed inner map of {} after shutdown", update.file_id);
                }
            }
            Job::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
    if dropped > 0 {
        debug!("closed {} inner maps of pending updates", dropped);
    }
}

fn apply(update: MapUpdate, errors: &ErrorCounter) {
    let key = update.file_id.to_key_bytes();
    match update.inner {
        Some(inner) => {
            let result = update
                .outer
                .update(&key, &inner.raw_fd().to_ne_bytes(), UpdateFlags::Any);
            if let Err(e) = errors.track(MetricId::ExeIdToStackDeltasOuterUpdate, result) {
                error!(
                    "failed to link stack deltas of {} into {}: {}",
                    update.file_id,
                    update.outer.name(),
                    e
                );
            }
            // The outer map holds its own reference from now on.
            drop(inner);
        }
        None => {
            let result = update.outer.delete(&key);
            if let Err(e) = errors.track(MetricId::ExeIdToStackDeltasOuterDelete, result) {
                error!(
                    "failed to remove stack deltas of {} from {}: {}",
                    update.file_id,
                    update.outer.name(),
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::RawFd;
    use std::time::Duration;

    use super::*;
    use crate::maps::memory::{InMemoryMap, MapInspector, MapOperation};
    use crate::maps::{BatchError, MapError, MapKind, MapSpec};

    fn outer_map() -> Arc<InMemoryMap> {
        Arc::new(InMemoryMap::new(&MapSpec::new(
            "exe_id_to_4_stack_deltas",
            MapKind::HashOfMaps,
            8,
            4,
            64,
        )))
    }

    fn inner_map() -> (Box<dyn KernelMap>, MapInspector) {
        let map = InMemoryMap::new(&MapSpec::new("inner", MapKind::Array, 4, 4, 16));
        let inspector = map.inspector();
        (Box::new(map), inspector)
    }

    /// Blocks every update until the test lets it through.
    struct GatedMap {
        map: Arc<InMemoryMap>,
        gate: Receiver<()>,
    }

    impl KernelMap for GatedMap {
        fn name(&self) -> &str {
            self.map.name()
        }
        fn max_entries(&self) -> u32 {
            self.map.max_entries()
        }
        fn raw_fd(&self) -> RawFd {
            self.map.raw_fd()
        }
        fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>, MapError> {
            self.map.lookup(key)
        }
        fn update(&self, key: &[u8], value: &[u8], flags: UpdateFlags) -> Result<(), MapError> {
            let _ = self.gate.recv();
            self.map.update(key, value, flags)
        }
        fn delete(&self, key: &[u8]) -> Result<(), MapError> {
            self.map.delete(key)
        }
        fn update_batch(
            &self,
            keys: &[u8],
            values: &[u8],
            count: u32,
            flags: UpdateFlags,
        ) -> Result<u32, BatchError> {
            self.map.update_batch(keys, values, count, flags)
        }
        fn delete_batch(&self, keys: &[u8], count: u32) -> Result<u32, BatchError> {
            self.map.delete_batch(keys, count)
        }
        fn try_clone(&self) -> Result<Box<dyn KernelMap>, MapError> {
            self.map.try_clone()
        }
    }

    #[test]
    fn test_link_and_unlink() {
        let (_stop_send, stop) = bounded(1);
        let errors = Arc::new(ErrorCounter::new());
        let pool = AsyncMapUpdaterPool::new(4, 2, stop, errors.clone()).unwrap();
        let outer = outer_map();
        let outer_inspector = outer.inspector();

        let mut inners = Vec::new();
        for file_id in 0..10_u64 {
            let (inner, inspector) = inner_map();
            pool.enqueue_update(outer.clone(), FileId(file_id), Some(inner));
            inners.push(inspector);
        }
        pool.flush();

        assert_eq!(outer_inspector.len(), 10);
        for inspector in &inners {
            // Only the outer map keeps them alive.
            assert_eq!(inspector.open_handles(), 0);
        }

        for file_id in 0..10_u64 {
            pool.enqueue_update(outer.clone(), FileId(file_id), None);
        }
        pool.flush();
        assert!(outer_inspector.is_empty());
        assert!(errors.collect().is_empty());
    }

    #[test]
    fn test_failures_are_counted() {
        let (_stop_send, stop) = bounded(1);
        let errors = Arc::new(ErrorCounter::new());
        let pool = AsyncMapUpdaterPool::new(2, 2, stop, errors.clone()).unwrap();

        pool.enqueue_update(outer_map(), FileId(0xdead), None);
        pool.flush();

        let metrics = errors.collect();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].id, MetricId::ExeIdToStackDeltasOuterDelete);
    }

    #[test]
    fn test_updates_for_one_file_keep_their_order() {
        let (_stop_send, stop) = bounded(1);
        let pool = AsyncMapUpdaterPool::new(3, 1, stop, Arc::new(ErrorCounter::new())).unwrap();
        let outer = outer_map();

        for _ in 0..20 {
            let (inner, _) = inner_map();
            pool.enqueue_update(outer.clone(), FileId(7), Some(inner));
            pool.enqueue_update(outer.clone(), FileId(7), None);
        }
        pool.flush();

        let operations = outer.inspector().operations();
        assert_eq!(operations.len(), 40);
        for pair in operations.chunks(2) {
            assert!(matches!(pair[0], MapOperation::Update { .. }));
            assert!(matches!(pair[1], MapOperation::Delete { .. }));
        }
    }

    #[test]
    fn test_stop_closes_pending_handles() {
        let (stop_send, stop) = bounded(1);
        let pool = AsyncMapUpdaterPool::new(1, 8, stop, Arc::new(ErrorCounter::new())).unwrap();
        let (gate_send, gate) = bounded(0);
        let outer = outer_map();
        let gated: Arc<dyn KernelMap> = Arc::new(GatedMap {
            map: outer.clone(),
            gate,
        });

        let mut inspectors = Vec::new();
        for file_id in 0..4_u64 {
            let (inner, inspector) = inner_map();
            pool.enqueue_update(gated.clone(), FileId(file_id), Some(inner));
            inspectors.push(inspector);
        }

        stop_send.send(()).unwrap();
        while !pool.is_stopped() {
            thread::sleep(Duration::from_millis(1));
        }
        // Let the in flight update finish, if the worker picked one up.
        let _ = gate_send.send_timeout((), Duration::from_millis(100));
        drop(gate_send);

        // New work is refused.
        let (late, late_inspector) = inner_map();
        pool.enqueue_update(gated.clone(), FileId(100), Some(late));
        pool.flush();
        drop(pool);

        assert!(outer.inspector().len() <= 1);
        assert!(!outer.inspector().contains_key(&FileId(100).to_key_bytes()));
        for inspector in inspectors.iter().chain([&late_inspector]) {
            assert_eq!(inspector.open_handles(), 0);
        }
    }

    #[test]
    fn test_updates_after_stop_are_closed() {
        let (stop_send, stop) = bounded(1);
        let pool = AsyncMapUpdaterPool::new(2, 2, stop, Arc::new(ErrorCounter::new())).unwrap();
        let outer = outer_map();
        stop_send.send(()).unwrap();
        while !pool.is_stopped() {
            thread::sleep(Duration::from_millis(1));
        }

        let mut inspectors = Vec::new();
        for file_id in 0..8_u64 {
            let (inner, inspector) = inner_map();
            pool.enqueue_update(outer.clone(), FileId(file_id), Some(inner));
            inspectors.push(inspector);
        }

        // Closed by the workers while the pool is still alive.
        for _ in 0..5000 {
            if inspectors.iter().all(|i| i.open_handles() == 0) {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        for inspector in &inspectors {
            assert_eq!(inspector.open_handles(), 0);
        }
        assert!(outer.inspector().is_empty());
        drop(pool);
    }

    #[test]
    fn test_disconnected_stop_channel_stops_pool() {
        let (stop_send, stop) = bounded::<()>(1);
        let pool = AsyncMapUpdaterPool::new(2, 2, stop, Arc::new(ErrorCounter::new())).unwrap();
        assert!(!pool.is_stopped());
        drop(stop_send);
        while !pool.is_stopped() {
            thread::sleep(Duration::from_millis(1));
        }
        pool.flush();
    }
}
