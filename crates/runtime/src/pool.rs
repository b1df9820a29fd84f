//! Thread pool (§4.7, §6.3): two entry points over the same worker count.
//!
//! Work-stealing mode (`ThreadPool::join` and its three convenience
//! wrappers) drains a shared `crossbeam_deque::Injector` across scoped
//! worker threads plus the caller thread in a single cancellation-free
//! barrier call -- the `find_task` loop below is the pattern documented on
//! `crossbeam_deque::Stealer`. Reservation mode (`ReservationPool`) instead
//! hands the caller a single dedicated worker thread to push heterogeneous
//! work to across several calls, for callers that want to interleave other
//! work between submitting and collecting a result.
//!
//! No repo in the retrieval pack reaches for `crossbeam-deque` directly;
//! this module is grounded in the crate's own published API rather than a
//! sibling example (see DESIGN.md).

use std::iter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Mutex;
use std::thread;

use crossbeam_deque::{Injector, Stealer, Worker};
use crossbeam_utils::CachePadded;
use tracing::{debug, trace};

use crate::error::{RuntimeError, RuntimeResult};

/// Worker count for a pool. `None` picks `online_cpus * 3 / 2` (§6.3
/// default); `Some(0)` is rejected with [`RuntimeError::ZeroThreads`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolConfig {
    pub num_threads: Option<usize>,
}

impl PoolConfig {
    pub fn with_threads(num_threads: usize) -> Self {
        PoolConfig { num_threads: Some(num_threads) }
    }
}

fn resolve_thread_count(requested: Option<usize>) -> RuntimeResult<usize> {
    match requested {
        Some(0) => Err(RuntimeError::ZeroThreads),
        Some(n) => Ok(n),
        None => {
            let cpus = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
            Ok((cpus * 3 / 2).max(1))
        }
    }
}

/// Work-stealing thread pool: one `join` call drains a fixed-size batch of
/// work across `size()` participants (workers + the caller thread).
pub struct ThreadPool {
    size: usize,
}

impl ThreadPool {
    pub fn new(config: PoolConfig) -> RuntimeResult<Self> {
        let size = resolve_thread_count(config.num_threads)?;
        debug!(size, "thread pool created");
        Ok(ThreadPool { size })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `f(i)` once for every `i in 0..len`, collecting results in input
    /// order. Every participant drains from the same injector; there is no
    /// per-item affinity to a particular thread (§4.7).
    pub fn join<T, F>(&self, len: usize, f: F) -> RuntimeResult<Vec<T>>
    where
        T: Send,
        F: Fn(usize) -> RuntimeResult<T> + Sync,
    {
        if len == 0 {
            return Ok(Vec::new());
        }
        trace!(len, participants = self.size, "join: starting work-stealing batch");

        let slots: Vec<Mutex<Option<T>>> = (0..len).map(|_| Mutex::new(None)).collect();
        let injector = Injector::new();
        for i in 0..len {
            injector.push(i);
        }

        let participants = self.size.min(len);
        let workers: Vec<Worker<usize>> = (0..participants).map(|_| Worker::new_fifo()).collect();
        let stealers: Vec<Stealer<usize>> = workers.iter().map(Worker::stealer).collect();

        let failures: Mutex<Vec<(usize, RuntimeError)>> = Mutex::new(Vec::new());

        thread::scope(|scope| {
            let mut workers = workers;
            let caller_worker = workers.pop().expect("participants >= 1");
            for worker in workers {
                let injector = &injector;
                let stealers = &stealers;
                let f = &f;
                let slots = &slots;
                let failures = &failures;
                scope.spawn(move || drain(worker, injector, stealers, f, slots, failures));
            }
            drain(caller_worker, &injector, &stealers, &f, &slots, &failures);
        });

        let failures = failures.into_inner().expect("no poisoned mutex");
        if !failures.is_empty() {
            let first = failures[0].1.to_string();
            return Err(RuntimeError::WorkerFailure { failed: failures.len(), total: len, first });
        }

        Ok(slots
            .into_iter()
            .map(|slot| slot.into_inner().expect("no poisoned mutex").expect("every index processed"))
            .collect())
    }

    /// Convenience wrapper: a flat array of equal-sized items (§4.7).
    pub fn join_items<T, R, F>(&self, items: &[T], f: F) -> RuntimeResult<Vec<R>>
    where
        T: Sync,
        R: Send,
        F: Fn(&T) -> RuntimeResult<R> + Sync,
    {
        self.join(items.len(), |i| f(&items[i]))
    }

    /// Convenience wrapper: a heterogeneous array of argument pointers
    /// (§4.7) -- callers supply their own per-index dispatch closure since
    /// the arguments need not share a type.
    pub fn join_args<R, F>(&self, count: usize, f: F) -> RuntimeResult<Vec<R>>
    where
        R: Send,
        F: Fn(usize) -> RuntimeResult<R> + Sync,
    {
        self.join(count, f)
    }

    /// Convenience wrapper: a single argument broadcast to `n` invocations
    /// (§4.7).
    pub fn broadcast<A, R, F>(&self, n: usize, arg: &A, f: F) -> RuntimeResult<Vec<R>>
    where
        A: Sync,
        R: Send,
        F: Fn(&A) -> RuntimeResult<R> + Sync,
    {
        self.join(n, |_| f(arg))
    }
}

fn drain<T, F>(
    local: Worker<usize>,
    injector: &Injector<usize>,
    stealers: &[Stealer<usize>],
    f: &F,
    slots: &[Mutex<Option<T>>],
    failures: &Mutex<Vec<(usize, RuntimeError)>>,
) where
    F: Fn(usize) -> RuntimeResult<T> + Sync,
{
    while let Some(index) = find_task(&local, injector, stealers) {
        match f(index) {
            Ok(value) => *slots[index].lock().expect("no poisoned mutex") = Some(value),
            Err(err) => failures.lock().expect("no poisoned mutex").push((index, err)),
        }
    }
}

/// The canonical `crossbeam_deque` scavenging loop: try the local queue,
/// then the shared injector, then every sibling's queue, retrying until a
/// round reports no `Retry` (only genuine `Empty`s).
fn find_task<T>(local: &Worker<T>, global: &Injector<T>, stealers: &[Stealer<T>]) -> Option<T> {
    local.pop().or_else(|| {
        iter::repeat_with(|| {
            global.steal_batch_and_pop(local).or_else(|| stealers.iter().map(Stealer::steal).collect())
        })
        .find(|s| !s.is_retry())
        .and_then(|s| s.success())
    })
}

type Job = Box<dyn FnOnce() -> RuntimeResult<()> + Send + 'static>;

struct WorkerChannel {
    jobs: mpsc::Sender<Job>,
    done: Mutex<mpsc::Receiver<RuntimeResult<()>>>,
    // `reserve()` below polls every worker's flag from whichever thread is
    // claiming one, so adjacent `WorkerChannel`s in the `Vec` would
    // otherwise share a cache line and false-share on every scan.
    busy: CachePadded<AtomicBool>,
}

/// Reservation-mode thread pool (§4.7): a fixed set of persistent worker
/// threads, each claimed with `reserve`, fed one job with `submit_work`,
/// and released with `unreserve` after `wait_work` collects the result.
pub struct ReservationPool {
    workers: Vec<WorkerChannel>,
    // Kept alive so the worker loops (and their channels) stay valid for
    // the pool's lifetime; joined implicitly on drop of the pool's owner.
    _threads: Vec<thread::JoinHandle<()>>,
}

impl ReservationPool {
    pub fn new(config: PoolConfig) -> RuntimeResult<Self> {
        let size = resolve_thread_count(config.num_threads)?;
        debug!(size, "reservation pool created");

        let mut workers = Vec::with_capacity(size);
        let mut threads = Vec::with_capacity(size);
        for index in 0..size {
            let (job_tx, job_rx) = mpsc::channel::<Job>();
            let (done_tx, done_rx) = mpsc::channel::<RuntimeResult<()>>();
            let handle = thread::Builder::new()
                .name(format!("fy-value-runtime-worker-{index}"))
                .spawn(move || {
                    for job in job_rx {
                        let result = job();
                        if done_tx.send(result).is_err() {
                            break;
                        }
                    }
                })
                .map_err(|e| RuntimeError::ReservationMisuse(format!("spawn worker {index}: {e}")))?;
            workers.push(WorkerChannel {
                jobs: job_tx,
                done: Mutex::new(done_rx),
                busy: CachePadded::new(AtomicBool::new(false)),
            });
            threads.push(handle);
        }
        Ok(ReservationPool { workers, _threads: threads })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Claim an idle worker. Spins briefly when every worker is busy --
    /// reservation mode is meant for a handful of long-lived handles, not
    /// high-frequency dispatch, so a spin loop (no condvar bookkeeping) is
    /// proportionate here.
    pub fn reserve(&self) -> ReservedWorker<'_> {
        loop {
            for (index, worker) in self.workers.iter().enumerate() {
                if worker.busy.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok() {
                    return ReservedWorker { pool: self, index, submitted: false, released: false };
                }
            }
            thread::yield_now();
        }
    }
}

/// A worker claimed via [`ReservationPool::reserve`]. Follows
/// `submit_work` -> `wait_work` -> `unreserve`; calling these out of order
/// is a [`RuntimeError::ReservationMisuse`], not a panic, since the caller
/// may be driving this from a scripting-language boundary.
pub struct ReservedWorker<'a> {
    pool: &'a ReservationPool,
    index: usize,
    submitted: bool,
    released: bool,
}

impl<'a> ReservedWorker<'a> {
    pub fn submit_work<F>(&mut self, job: F) -> RuntimeResult<()>
    where
        F: FnOnce() -> RuntimeResult<()> + Send + 'static,
    {
        if self.submitted {
            return Err(RuntimeError::ReservationMisuse("submit_work called before a prior wait_work".into()));
        }
        self.pool.workers[self.index]
            .jobs
            .send(Box::new(job))
            .map_err(|_| RuntimeError::ReservationMisuse("worker thread is gone".into()))?;
        self.submitted = true;
        Ok(())
    }

    /// Block for the submitted job's completion.
    pub fn wait_work(&mut self) -> RuntimeResult<()> {
        if !self.submitted {
            return Err(RuntimeError::ReservationMisuse("wait_work called before submit_work".into()));
        }
        let rx = self.pool.workers[self.index].done.lock().expect("no poisoned mutex");
        let result = rx.recv().map_err(|_| RuntimeError::ReservationMisuse("worker thread is gone".into()))?;
        self.submitted = false;
        result
    }

    /// Release the worker back to the pool. A handle dropped without an
    /// explicit call releases automatically (see `Drop`), but `wait_work`
    /// should still be called first to avoid leaking a pending job.
    pub fn unreserve(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.released {
            self.pool.workers[self.index].busy.store(false, Ordering::Release);
            self.released = true;
        }
    }
}

impl<'a> Drop for ReservedWorker<'a> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn zero_threads_is_rejected() {
        let err = ThreadPool::new(PoolConfig::with_threads(0)).unwrap_err();
        assert!(matches!(err, RuntimeError::ZeroThreads));
        let err = ReservationPool::new(PoolConfig::with_threads(0)).unwrap_err();
        assert!(matches!(err, RuntimeError::ZeroThreads));
    }

    #[test]
    #[serial]
    fn default_config_picks_a_nonzero_size() {
        // Reads the process-wide `available_parallelism()` value -- serialized
        // against any other test that depends on it.
        let pool = ThreadPool::new(PoolConfig::default()).unwrap();
        assert!(pool.size() >= 1);
    }

    #[test]
    fn join_runs_every_index_exactly_once() {
        let pool = ThreadPool::new(PoolConfig::with_threads(4)).unwrap();
        let results = pool.join(1000, |i| Ok(i * 2)).unwrap();
        for (i, v) in results.iter().enumerate() {
            assert_eq!(*v, i * 2);
        }
    }

    #[test]
    fn join_on_empty_batch_returns_empty_vec() {
        let pool = ThreadPool::new(PoolConfig::with_threads(4)).unwrap();
        let results: Vec<i32> = pool.join(0, |_| Ok(0)).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn join_surfaces_worker_failures() {
        let pool = ThreadPool::new(PoolConfig::with_threads(4)).unwrap();
        let err = pool
            .join(10, |i| {
                if i == 7 {
                    Err(RuntimeError::InvalidPath("boom".into()))
                } else {
                    Ok(i)
                }
            })
            .unwrap_err();
        match err {
            RuntimeError::WorkerFailure { failed, total, .. } => {
                assert_eq!(failed, 1);
                assert_eq!(total, 10);
            }
            other => panic!("expected WorkerFailure, got {other:?}"),
        }
    }

    #[test]
    fn join_items_and_broadcast_wrappers() {
        let pool = ThreadPool::new(PoolConfig::with_threads(2)).unwrap();
        let items = vec![1, 2, 3, 4, 5];
        let doubled = pool.join_items(&items, |x| Ok(x * 2)).unwrap();
        assert_eq!(doubled, vec![2, 4, 6, 8, 10]);

        let arg = 42;
        let broadcasted = pool.broadcast(3, &arg, |a| Ok(*a)).unwrap();
        assert_eq!(broadcasted, vec![42, 42, 42]);
    }

    #[test]
    fn reservation_pool_round_trips_a_job() {
        let pool = ReservationPool::new(PoolConfig::with_threads(2)).unwrap();
        let result = Arc::new(AtomicUsize::new(0));
        let mut worker = pool.reserve();
        let result_clone = Arc::clone(&result);
        worker
            .submit_work(move || {
                result_clone.store(99, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        worker.wait_work().unwrap();
        worker.unreserve();
        assert_eq!(result.load(Ordering::SeqCst), 99);
    }

    #[test]
    fn reservation_pool_rejects_out_of_order_calls() {
        let pool = ReservationPool::new(PoolConfig::with_threads(1)).unwrap();
        let mut worker = pool.reserve();
        let err = worker.wait_work().unwrap_err();
        assert!(matches!(err, RuntimeError::ReservationMisuse(_)));
    }

    #[test]
    fn reservation_pool_reuses_released_worker() {
        let pool = ReservationPool::new(PoolConfig::with_threads(1)).unwrap();
        {
            let mut worker = pool.reserve();
            worker.submit_work(|| Ok(())).unwrap();
            worker.wait_work().unwrap();
        } // dropped without explicit unreserve -- Drop releases it
        let mut worker = pool.reserve();
        worker.submit_work(|| Ok(())).unwrap();
        worker.wait_work().unwrap();
    }
}
