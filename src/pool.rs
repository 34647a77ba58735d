//! A small static worker pool that can serve as the executor for pooled
//! batches.
//!
//! The pool is deliberately plain: a fixed set of workers, started once, that
//! share a single lock-free injector queue and sleep on a condition variable
//! when the queue is empty. There is no resizing, work stealing or
//! backpressure. It exists so that [`Pooled`](crate::launch::Pooled) batches
//! have something to run on out of the box; any other [`Executor`] works as
//! well.

use std::{
    cell::Cell,
    panic::{self, AssertUnwindSafe},
    sync::atomic::{AtomicUsize, Ordering},
    thread,
};

use crossbeam_queue::SegQueue;
use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace};

use crate::{
    latch::{AtomicLatch, Latch, Probe},
    launch::Executor,
    util::{panic_message, CallOnDrop},
};

// -----------------------------------------------------------------------------
// Thread pool types

/// The largest number of workers a pool can start. Space for this many worker
/// control blocks is allocated up front.
pub const MAX_THREADS: usize = 32;

/// A unit of work queued on the pool.
type PoolTask = Box<dyn FnOnce(&WorkerThread) + Send>;

/// The `ThreadPool` object distributes submitted tasks to a fixed set of worker
/// threads.
///
/// Thread pools should be static and const constructed:
///
/// ```
/// # use threadjobs::pool::ThreadPool;
/// static COMPUTE: ThreadPool = ThreadPool::new();
///
/// COMPUTE.start(2);
/// COMPUTE.spawn(|| println!("Do your work here"));
/// COMPUTE.wait_until_inactive();
/// COMPUTE.shutdown();
/// ```
///
/// A pool starts with no workers. [`ThreadPool::start`] sets its size once;
/// later calls leave a running pool as it is. Submitting to a pool that has no
/// workers starts it with a single worker. [`ThreadPool::shutdown`] stops
/// every worker, after which the pool may be started again.
pub struct ThreadPool {
    /// Control blocks for each worker thread.
    threads: [CachePadded<ThreadControl>; MAX_THREADS],
    /// A queue of pending tasks that can be taken by any worker. It uses the
    /// lock-free queue from crossbeam.
    queue: SegQueue<PoolTask>,
    /// The thread pool state is a collection of infrequently modified shared
    /// data. It's bundled together into a cache line so that atomic writes
    /// don't cause unrelated cache-misses.
    state: CachePadded<ThreadPoolState>,
    /// The number of submitted tasks which have not yet run to completion.
    ///
    /// Closely related to `ThreadPoolState::is_active`.
    active_tally: CachePadded<AtomicUsize>,
}

/// Core information about the thread pool. This data may be read from
/// frequently and should only be written to infrequently.
struct ThreadPoolState {
    /// Tracks the number of currently running threads, including sleeping
    /// threads. This is only written while `lifecycle` is held, but can be
    /// read at any time.
    running_threads: AtomicUsize,
    /// Guards starting and shutting down the pool.
    lifecycle: Mutex<()>,
    /// Set to `true` while `active_tally > 0`, and used to wait for
    /// inactivity.
    is_active: Mutex<bool>,
    /// Used to notify waiters when `is_active` changes.
    activity_changed: Condvar,
}

/// A control mechanism for a single worker thread, implementing sleeping,
/// wakeups and a termination procedure.
struct ThreadControl {
    /// Set to true when the worker is sleeping. Allows the thread to sleep
    /// until awakened by another thread.
    is_sleeping: Mutex<bool>,
    /// Used to wake a sleeping thread.
    awakened: Condvar,
    /// Set to true when the thread is running. Allows other threads to sleep
    /// until this thread stops or starts.
    is_running: Mutex<bool>,
    /// Used to wake other threads when the thread stops or starts.
    synchronized: Condvar,
    /// A latch that terminates the thread when set.
    should_terminate: AtomicLatch,
}

// -----------------------------------------------------------------------------
// Thread pool creation and maintenance

/// The initial value of each worker's control block. We have this instead of
/// `ThreadControl::new()` so that it can be used with the const array
/// initialization syntax.
const THREAD_CONTROL: CachePadded<ThreadControl> = CachePadded::new(ThreadControl {
    is_sleeping: Mutex::new(false),
    awakened: Condvar::new(),
    is_running: Mutex::new(false),
    synchronized: Condvar::new(),
    should_terminate: AtomicLatch::new(),
});

impl ThreadPool {
    /// Creates a new thread pool. This function should be used to define a
    /// `static` variable rather than to allocate something on the stack during
    /// runtime.
    pub const fn new() -> ThreadPool {
        ThreadPool {
            threads: [THREAD_CONTROL; MAX_THREADS],
            queue: SegQueue::new(),
            state: CachePadded::new(ThreadPoolState {
                running_threads: AtomicUsize::new(0),
                lifecycle: Mutex::new(()),
                is_active: Mutex::new(false),
                activity_changed: Condvar::new(),
            }),
            active_tally: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Returns the number of running worker threads.
    pub fn size(&'static self) -> usize {
        self.state.running_threads.load(Ordering::Acquire)
    }

    /// Starts the pool with one worker per unit of available parallelism. See
    /// [`ThreadPool::start`].
    pub fn start_available(&'static self) -> usize {
        let available = thread::available_parallelism()
            .map(|num_threads| num_threads.get())
            .unwrap_or(1);
        self.start(available)
    }

    /// Starts the pool with `size` workers, clamped to between one and
    /// [`MAX_THREADS`]. Returns the number of running workers.
    ///
    /// A pool that is already running keeps its current size. Fewer workers
    /// than requested are started if the OS refuses to spawn more threads. A
    /// worker of this pool cannot start it.
    pub fn start(&'static self, size: usize) -> usize {
        if self.current_thread_index().is_some() {
            return self.size();
        }

        // Only one thread may start or stop the pool at a time.
        let _lifecycle = self.state.lifecycle.lock();

        let current_size = self.state.running_threads.load(Ordering::Acquire);
        if current_size > 0 {
            return current_size;
        }

        let requested = size.clamp(1, MAX_THREADS);
        let mut started = 0;
        for index in 0..requested {
            let spawned = self.threads[index].run(index, move || main_loop(self, index));
            if let Err(error) = spawned {
                error!(index, %error, "failed to spawn pool worker");
                break;
            }
            started += 1;
        }

        // Wait for each thread to become ready.
        for index in 0..started {
            self.threads[index].await_ready();
        }

        self.state.running_threads.store(started, Ordering::Release);
        debug!(workers = started, "started thread pool");
        started
    }

    /// Stops every worker and waits for them to exit. Tasks still queued, or
    /// queued while the pool shuts down, stay queued and run once the pool is
    /// started again. A worker of this pool cannot shut it down.
    pub fn shutdown(&'static self) {
        if self.current_thread_index().is_some() {
            return;
        }

        let _lifecycle = self.state.lifecycle.lock();

        // Clear the visible size first so nothing tries to wake the threads we
        // are about to stop.
        let current_size = self.state.running_threads.swap(0, Ordering::AcqRel);
        if current_size == 0 {
            return;
        }

        for index in 0..current_size {
            self.threads[index].halt();
        }
        for index in 0..current_size {
            self.threads[index].await_termination();
        }

        debug!(workers = current_size, "shut down thread pool");
    }

    /// Returns an opaque identifier for this thread pool.
    fn id(&'static self) -> usize {
        // We can rely on `self` not to change since it's a static ref.
        self as *const Self as usize
    }

    /// Returns the index of the current thread within this pool, or `None` if
    /// the current thread is not one of this pool's workers.
    pub fn current_thread_index(&'static self) -> Option<usize> {
        WORKER_THREAD_STATE
            .with(Cell::get)
            .filter(|&(pool_id, _)| pool_id == self.id())
            .map(|(_, index)| index)
    }

    /// Queues a task and wakes a worker to run it.
    fn inject(&'static self, task: PoolTask) {
        self.queue.push(task);
        self.wake_any(1);
    }

    /// Pops a task from the thread pool's injector queue.
    fn pop(&'static self) -> Option<PoolTask> {
        self.queue.pop()
    }

    /// Tries to wake a number of threads. Returns the number of threads
    /// actually woken.
    fn wake_any(&'static self, num_to_wake: usize) -> usize {
        let mut num_woken = 0;
        if num_to_wake > 0 {
            // Iterate through the threads, trying to wake each one until we run
            // out or have reached our target number.
            let num_threads = self.state.running_threads.load(Ordering::Relaxed);
            for index in 0..num_threads {
                if self.threads[index].wake() {
                    num_woken += 1;
                    if num_to_wake == num_woken {
                        break;
                    }
                }
            }
        }
        num_woken
    }

    /// Marks new activity on the thread pool. This is what powers
    /// `wait_until_inactive`. A call to this should always be paired with a
    /// corresponding call to `mark_inactive` when the activity completes.
    fn mark_active(&'static self) {
        if self.active_tally.fetch_add(1, Ordering::AcqRel) == 0 {
            self.publish_activity();
        }
    }

    /// Marks the end of some thread pool activity. See `mark_active` for more
    /// information.
    fn mark_inactive(&'static self) {
        if self.active_tally.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.publish_activity();
        }
    }

    /// Republishes `is_active` from the tally. The tally is re-read under the
    /// lock, so whichever transition takes the lock last leaves the flag
    /// matching the current tally.
    fn publish_activity(&'static self) {
        let mut is_active = self.state.is_active.lock();
        *is_active = self.active_tally.load(Ordering::Acquire) > 0;
        self.state.activity_changed.notify_all();
    }

    /// Waits until every task submitted to the pool has run to completion.
    pub fn wait_until_inactive(&'static self) {
        let mut is_active = self.state.is_active.lock();
        while *is_active {
            self.state.activity_changed.wait(&mut is_active);
        }
    }
}

impl Default for ThreadPool {
    fn default() -> Self {
        Self::new()
    }
}

// -----------------------------------------------------------------------------
// Thread control

impl ThreadControl {
    /// Spawns the worker thread for this control block.
    ///
    /// The `ThreadControl` api is split into two halves: one half is intended
    /// to be called by the "controller" (the thread that calls this) and the
    /// other half is intended to be called by the "worker" (the thread this
    /// spawns).
    fn run<F>(&'static self, index: usize, f: F) -> std::io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        thread::Builder::new()
            .name(format!("threadjobs-worker-{index}"))
            .spawn(f)
            .map(drop)
    }

    /// The controller may call this to wait until the worker calls
    /// `post_ready_status`.
    fn await_ready(&'static self) {
        let mut is_running = self.is_running.lock();
        while !*is_running {
            self.synchronized.wait(&mut is_running);
        }
    }

    /// The worker should call this to indicate that it is now entering its
    /// main loop.
    fn post_ready_status(&'static self) {
        let mut is_running = self.is_running.lock();
        *is_running = true;
        self.synchronized.notify_all();
    }

    /// The controller should call this whenever it wishes to wake the worker.
    /// Returns `true` if the worker was asleep.
    fn wake(&'static self) -> bool {
        let mut is_sleeping = self.is_sleeping.lock();
        if *is_sleeping {
            *is_sleeping = false;
            self.awakened.notify_one();
            true
        } else {
            false
        }
    }

    /// The controller should call this to tell the worker to exit its main
    /// loop.
    fn halt(&'static self) {
        self.should_terminate.set();
        self.wake();
    }

    /// The controller may call this to wait until the worker calls
    /// `post_termination_status`.
    fn await_termination(&'static self) {
        let mut is_running = self.is_running.lock();
        while *is_running {
            self.synchronized.wait(&mut is_running);
        }
    }

    /// The worker should call this right before it terminates.
    fn post_termination_status(&'static self) {
        self.should_terminate.reset();
        let mut is_running = self.is_running.lock();
        *is_running = false;
        self.synchronized.notify_all();
    }
}

// -----------------------------------------------------------------------------
// Core API

impl ThreadPool {
    /// Spawns a new closure onto the thread pool. The closure cannot hold
    /// references other than those with `'static` lifetime.
    pub fn spawn<F>(&'static self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(move |_| f());
    }

    /// Submits a task which receives the worker it runs on. If the pool has no
    /// workers, it is started with one first. If no worker can be started the
    /// task is dropped without running.
    ///
    /// A panic inside the task is caught and logged; it does not take the
    /// worker down with it.
    pub fn submit<F>(&'static self, f: F)
    where
        F: FnOnce(&WorkerThread) + Send + 'static,
    {
        if self.size() == 0 && self.start(1) == 0 {
            error!("no pool worker available, dropping task");
            return;
        }

        // Marks some thread pool activity. This is decremented at the (*).
        self.mark_active();
        self.inject(Box::new(move |worker: &WorkerThread| {
            // (*) Mark the activity complete, even if `f` panics.
            let _guard = CallOnDrop(|| self.mark_inactive());
            f(worker);
        }));
    }
}

impl Executor for &'static ThreadPool {
    type Context = WorkerThread;

    fn submit<F>(&self, task: F)
    where
        F: FnOnce(&WorkerThread) + Send + 'static,
    {
        ThreadPool::submit(*self, task)
    }
}

// -----------------------------------------------------------------------------
// Worker threads

/// The context handed to every task: the worker the task is running on.
pub struct WorkerThread {
    thread_pool: &'static ThreadPool,
    index: usize,
}

thread_local! {
    /// The `(pool id, worker index)` of the current thread, if it is a worker.
    static WORKER_THREAD_STATE: Cell<Option<(usize, usize)>> = const { Cell::new(None) };
}

impl WorkerThread {
    /// Returns the thread pool to which the worker belongs.
    #[inline]
    pub fn thread_pool(&self) -> &'static ThreadPool {
        self.thread_pool
    }

    /// Returns the unique index of the thread within the thread pool.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns this worker's control block.
    #[inline]
    fn control(&self) -> &'static ThreadControl {
        &self.thread_pool.threads[self.index]
    }

    /// Runs a task, containing any panic to the task itself.
    fn execute(&self, task: PoolTask) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| task(self))) {
            error!(
                worker = self.index,
                panic = %panic_message(payload.as_ref()),
                "pool task panicked"
            );
        }
    }

    /// Runs tasks until the provided latch is set, sleeping whenever the queue
    /// is empty.
    fn run_until<L: Probe>(&self, latch: &L) {
        let control = self.control();
        while !latch.probe() {
            if let Some(task) = self.thread_pool.pop() {
                self.execute(task);
                continue;
            }

            let mut is_sleeping = control.is_sleeping.lock();

            // Both checks happen under the sleep lock. Anyone who sets the
            // latch or queues a task takes this lock afterwards to wake us, so
            // neither can slip in between the checks and the wait.
            if latch.probe() || !self.thread_pool.queue.is_empty() {
                continue;
            }

            *is_sleeping = true;
            while *is_sleeping {
                control.awakened.wait(&mut is_sleeping);
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Main worker loop

/// This is the main loop for a worker thread. It runs tasks from the injector
/// queue until the worker is asked to terminate.
fn main_loop(thread_pool: &'static ThreadPool, index: usize) {
    let control = &thread_pool.threads[index];
    let worker_thread = WorkerThread { thread_pool, index };

    WORKER_THREAD_STATE.with(|state| state.set(Some((thread_pool.id(), index))));
    trace!(index, "pool worker starting");

    // Inform the controller that we are starting the main worker loop.
    control.post_ready_status();

    worker_thread.run_until(&control.should_terminate);

    WORKER_THREAD_STATE.with(|state| state.set(None));
    trace!(index, "pool worker exiting");

    // Inform the controller that we are terminating.
    control.post_termination_status();
}
