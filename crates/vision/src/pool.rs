//! Ordered worker pool: work fans out across replicas, results come back in
//! submission order.
//!
//! `submit` picks a replica, hands a job to the shared worker channel and
//! appends a one-shot result slot to the ordered queue; it never waits.
//! `retrieve` pops the head slot under the queue lock, drops the lock, then
//! blocks on that slot alone, so a slow head holds back later results but
//! never blocks `submit`.

use std::{
    collections::VecDeque,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU8, AtomicU64, Ordering},
    },
    thread::JoinHandle,
};

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use metrics::{counter, gauge};
use tracing::{debug, error, info, warn};
use video_ingest::Frame;

use crate::{
    error::{InitError, PoolError},
    replica::{AnnotatedFrame, ModelReplica, ReplicaShared},
    rotation::{RoundRobin, Rotation},
    telemetry::spawn_thread,
};

/// Something a pool worker can run a job on.
pub trait Replica: Send + Sync + 'static {
    type Input: Send + 'static;
    type Output: Send + 'static;

    fn process(&self, input: Self::Input) -> Self::Output;
}

impl Replica for ModelReplica {
    type Input = Frame;
    type Output = Option<AnnotatedFrame>;

    fn process(&self, input: Frame) -> Self::Output {
        self.infer(input)
    }
}

/// Lifecycle of one submitted task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Dispatched,
    Running,
    Completed,
}

impl TaskState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => TaskState::Queued,
            1 => TaskState::Dispatched,
            2 => TaskState::Running,
            _ => TaskState::Completed,
        }
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Result slot for one task, fixed to the replica chosen at submit time.
struct PendingResult<T> {
    seq: u64,
    replica: usize,
    state: Arc<AtomicU8>,
    slot: Receiver<Option<T>>,
}

pub struct WorkerPool<R: Replica> {
    replicas: Vec<Arc<R>>,
    rotation: Box<dyn Rotation>,
    jobs: Option<Sender<Job>>,
    queue: Mutex<VecDeque<PendingResult<R::Output>>>,
    workers: Vec<JoinHandle<()>>,
    next_seq: AtomicU64,
}

impl<R: Replica> WorkerPool<R> {
    /// Build `count` replicas in order (every one after the first receives
    /// replica 0 as its source) and start `count` workers.
    pub fn initialize<F>(count: usize, init: F) -> Result<Self, PoolError>
    where
        F: FnMut(usize, Option<&R>) -> Result<R, InitError>,
    {
        Self::with_rotation(count, init, Box::new(RoundRobin::new()))
    }

    pub fn with_rotation<F>(count: usize, mut init: F, rotation: Box<dyn Rotation>) -> Result<Self, PoolError>
    where
        F: FnMut(usize, Option<&R>) -> Result<R, InitError>,
    {
        if count == 0 {
            return Err(InitError::NoReplicas.into());
        }

        let mut replicas: Vec<Arc<R>> = Vec::with_capacity(count);
        for index in 0..count {
            let source = replicas.first().map(Arc::as_ref);
            let replica = init(index, source)?;
            replicas.push(Arc::new(replica));
        }

        let (jobs, job_rx) = unbounded::<Job>();
        let mut workers = Vec::with_capacity(count);
        for index in 0..count {
            let job_rx = job_rx.clone();
            let handle = spawn_thread(format!("npu-worker-{index}"), move || worker_loop(index, job_rx))
                .map_err(InitError::Spawn)?;
            workers.push(handle);
        }
        info!(replicas = count, "worker pool ready");

        Ok(Self {
            replicas,
            rotation,
            jobs: Some(jobs),
            queue: Mutex::new(VecDeque::new()),
            workers,
            next_seq: AtomicU64::new(0),
        })
    }

    /// Queue `input` on the next replica in rotation. Never blocks on
    /// inference; the queue is unbounded.
    pub fn submit(&self, input: R::Input) -> Result<(), PoolError> {
        let jobs = self.jobs.as_ref().ok_or(PoolError::Closed)?;

        let mut queue = self.lock_queue();
        let replica_index = self.rotation.next_slot(self.replicas.len());
        let replica = Arc::clone(&self.replicas[replica_index]);
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);

        let (slot_tx, slot_rx) = bounded(1);
        let state = Arc::new(AtomicU8::new(TaskState::Queued as u8));
        let job_state = Arc::clone(&state);
        let job: Job = Box::new(move || {
            job_state.store(TaskState::Running as u8, Ordering::Release);
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| replica.process(input)));
            if outcome.is_err() {
                error!(seq, replica = replica_index, "task panicked");
            }
            job_state.store(TaskState::Completed as u8, Ordering::Release);
            let _ = slot_tx.send(outcome.ok());
        });

        jobs.send(job).map_err(|_| PoolError::Closed)?;
        let _ = state.compare_exchange(
            TaskState::Queued as u8,
            TaskState::Dispatched as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        queue.push_back(PendingResult {
            seq,
            replica: replica_index,
            state,
            slot: slot_rx,
        });

        counter!("frames_submitted_total").increment(1);
        gauge!("pool_pending").set(queue.len() as f64);
        debug!(seq, replica = replica_index, pending = queue.len(), "submitted");
        Ok(())
    }

    /// Next result in submission order. `Empty` when nothing is pending;
    /// otherwise blocks until the oldest task finishes.
    pub fn retrieve(&self) -> Result<R::Output, PoolError> {
        let pending = {
            let mut queue = self.lock_queue();
            let head = queue.pop_front().ok_or(PoolError::Empty)?;
            gauge!("pool_pending").set(queue.len() as f64);
            head
        };
        Self::wait(pending)
    }

    pub fn pending(&self) -> usize {
        self.lock_queue().len()
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    pub fn replica(&self, index: usize) -> Option<&R> {
        self.replicas.get(index).map(Arc::as_ref)
    }

    /// State of the oldest outstanding task.
    pub fn head_state(&self) -> Option<TaskState> {
        self.lock_queue()
            .front()
            .map(|head| TaskState::from_u8(head.state.load(Ordering::Acquire)))
    }

    fn wait(pending: PendingResult<R::Output>) -> Result<R::Output, PoolError> {
        match pending.slot.recv() {
            Ok(Some(output)) => Ok(output),
            Ok(None) | Err(_) => {
                warn!(seq = pending.seq, replica = pending.replica, "task lost");
                Err(PoolError::TaskLost { seq: pending.seq })
            }
        }
    }

    fn lock_queue(&self) -> MutexGuard<'_, VecDeque<PendingResult<R::Output>>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<R: Replica> Drop for WorkerPool<R> {
    fn drop(&mut self) {
        let outstanding: Vec<_> = self.lock_queue().drain(..).collect();
        if !outstanding.is_empty() {
            debug!(count = outstanding.len(), "draining outstanding tasks");
        }
        for pending in outstanding {
            let _ = Self::wait(pending);
        }
        gauge!("pool_pending").set(0.0);

        self.jobs.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("worker thread exited with a panic");
            }
        }
        // Replicas drop with the struct, after every worker has stopped.
    }
}

fn worker_loop(index: usize, jobs: Receiver<Job>) {
    debug!(worker = index, "worker started");
    for job in jobs.iter() {
        job();
    }
    debug!(worker = index, "worker stopped");
}

/// Pool of model replicas consuming raw frames.
pub type DetectionPool = WorkerPool<ModelReplica>;

/// Build `shared.config.replicas` model replicas: replica 0 loads the model,
/// the rest duplicate it.
pub fn spawn_detection_pool(shared: Arc<ReplicaShared>) -> Result<DetectionPool, PoolError> {
    let count = shared.config.replicas;
    WorkerPool::initialize(count, |index, source| {
        ModelReplica::init(index, Arc::clone(&shared), source)
    })
}

#[cfg(test)]
mod tests {
    use std::{
        sync::mpsc,
        thread,
        time::Duration,
    };

    use super::*;

    struct Echo(usize);

    impl Replica for Echo {
        type Input = u32;
        type Output = (usize, u32);

        fn process(&self, input: u32) -> (usize, u32) {
            if input == u32::MAX {
                panic!("boom");
            }
            (self.0, input)
        }
    }

    fn echo_pool(count: usize) -> WorkerPool<Echo> {
        WorkerPool::initialize(count, |i, _| Ok(Echo(i))).unwrap()
    }

    #[test]
    fn replicas_after_the_first_see_replica_zero() {
        let mut sources = Vec::new();
        let pool = WorkerPool::initialize(3, |i, src: Option<&Echo>| {
            sources.push(src.map(|r| r.0));
            Ok(Echo(i))
        })
        .unwrap();
        assert_eq!(sources, vec![None, Some(0), Some(0)]);
        assert_eq!(pool.replica_count(), 3);
        assert_eq!(pool.replica(2).map(|r| r.0), Some(2));
    }

    #[test]
    fn init_failure_aborts() {
        let result = WorkerPool::initialize(3, |i, _| {
            if i == 1 {
                Err(InitError::Layout("bad".into()))
            } else {
                Ok(Echo(i))
            }
        });
        assert!(matches!(result, Err(PoolError::Init(InitError::Layout(_)))));
        assert!(matches!(
            WorkerPool::<Echo>::initialize(0, |i, _| Ok(Echo(i))),
            Err(PoolError::Init(InitError::NoReplicas))
        ));
    }

    #[test]
    fn panicking_task_is_reported_and_pool_survives() {
        let pool = echo_pool(1);
        pool.submit(u32::MAX).unwrap();
        pool.submit(7).unwrap();
        assert!(matches!(pool.retrieve(), Err(PoolError::TaskLost { seq: 0 })));
        assert_eq!(pool.retrieve().unwrap(), (0, 7));
    }

    #[test]
    fn head_state_reaches_completed() {
        let pool = echo_pool(2);
        assert_eq!(pool.head_state(), None);
        pool.submit(1).unwrap();
        let mut state = pool.head_state();
        for _ in 0..200 {
            if state == Some(TaskState::Completed) {
                break;
            }
            thread::sleep(Duration::from_millis(5));
            state = pool.head_state();
        }
        assert_eq!(state, Some(TaskState::Completed));
        assert_eq!(pool.pending(), 1);
        pool.retrieve().unwrap();
        assert_eq!(pool.pending(), 0);
    }

    #[test]
    fn drop_drains_outstanding_work() {
        let (tx, rx) = mpsc::channel();
        struct Report(mpsc::Sender<u32>);
        impl Replica for Report {
            type Input = u32;
            type Output = ();
            fn process(&self, input: u32) {
                thread::sleep(Duration::from_millis(10));
                let _ = self.0.send(input);
            }
        }
        let pool = WorkerPool::initialize(2, |_, _| Ok(Report(tx.clone()))).unwrap();
        for i in 0..6 {
            pool.submit(i).unwrap();
        }
        drop(pool);
        let mut done: Vec<u32> = rx.try_iter().collect();
        done.sort_unstable();
        assert_eq!(done, (0..6).collect::<Vec<_>>());
    }
}
