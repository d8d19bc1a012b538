//! Dual task queue marshalling work between the realtime and non-realtime
//! worlds.
//!
//! Two worker threads are created up front: a realtime worker in the
//! time-constraint scheduling band and an ordinary time-share worker. Tasks
//! travel through intrusive atomic LIFO stacks and are drained in insertion
//! order; submitters signal a counting semaphore, and sync submitters park on
//! a completion semaphore that the worker broadcasts after every finished
//! task. Async submissions draw from a pre-allocated free list so the IO
//! callback never allocates.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::clients::map::ClientMap;
use crate::clients::Clients;
use crate::clock;
use crate::driver::{HostBridge, PropertySelector};
use crate::error::DriverError;

/// Nominal per-wake computation budget for the realtime worker.
pub const RT_NOMINAL_COMPUTATION_NS: u64 = 50_000;
/// Hard per-wake computation budget for the realtime worker.
pub const RT_MAXIMUM_COMPUTATION_NS: u64 = 200_000;

// A sync waiter re-checks its completion flag at least this often, so a
// missed broadcast cannot strand it.
const SYNC_WAIT_TIMEOUT: Duration = Duration::from_nanos(RT_MAXIMUM_COMPUTATION_NS * 4);

// Pre-allocated async tasks. Sized so realtime submitters never have to
// allocate in practice.
const FREE_LIST_SIZE: usize = 64;

/// Return value reported by a sync task that never set one.
pub const TASK_RETURN_UNSET: u64 = u64::MAX;

/// Work items the queue knows how to run.
pub enum TaskKind {
    /// Shut down the worker that dequeues this task.
    StopWorker,
    /// Swap the client map's primary and shadow sides. Realtime worker only.
    SwapClientShadowMaps(Arc<ClientMap>),
    /// Mark a client as doing IO. Non-realtime worker only.
    StartClientIo(Arc<Clients>, u32),
    /// Mark a client as no longer doing IO. Non-realtime worker only.
    StopClientIo(Arc<Clients>, u32),
    /// Forward a property-changed notification to the host. Non-realtime
    /// worker only.
    SendPropertyNotification(Arc<HostBridge>, u32, PropertySelector),
    /// Free-list placeholder carrying no work.
    Idle,
}

/// One unit of work exchanged with a worker thread.
pub struct Task {
    kind: Mutex<TaskKind>,
    is_sync: bool,
    complete: AtomicBool,
    return_value: AtomicU64,
    next: AtomicPtr<Task>,
}

impl Task {
    fn new(kind: TaskKind, is_sync: bool) -> Self {
        Self {
            kind: Mutex::new(kind),
            is_sync,
            complete: AtomicBool::new(false),
            return_value: AtomicU64::new(TASK_RETURN_UNSET),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

// Treiber stack of reference-counted tasks. Push/pop transfer one strong
// count through a raw pointer; `pop_all_reversed` hands the whole chain to a
// single consumer in insertion order.
struct TaskStack {
    head: AtomicPtr<Task>,
}

unsafe impl Send for TaskStack {}
unsafe impl Sync for TaskStack {}

impl TaskStack {
    const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn push(&self, task: Arc<Task>) {
        let raw = Arc::into_raw(task) as *mut Task;
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            unsafe { (*raw).next.store(head, Ordering::Relaxed) };
            match self
                .head
                .compare_exchange_weak(head, raw, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    fn pop(&self) -> Option<Arc<Task>> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            if head.is_null() {
                return None;
            }
            let next = unsafe { (*head).next.load(Ordering::Relaxed) };
            match self
                .head
                .compare_exchange_weak(head, next, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => return Some(unsafe { Arc::from_raw(head) }),
                Err(current) => head = current,
            }
        }
    }

    // Detach the whole stack atomically and reverse it so the caller walks
    // tasks in the order they were pushed.
    fn pop_all_reversed(&self) -> TaskChain {
        let mut head = self.head.swap(ptr::null_mut(), Ordering::AcqRel);
        let mut reversed: *mut Task = ptr::null_mut();
        while !head.is_null() {
            let next = unsafe { (*head).next.load(Ordering::Relaxed) };
            unsafe { (*head).next.store(reversed, Ordering::Relaxed) };
            reversed = head;
            head = next;
        }
        TaskChain { head: reversed }
    }
}

impl Drop for TaskStack {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

struct TaskChain {
    head: *mut Task,
}

impl Iterator for TaskChain {
    type Item = Arc<Task>;

    fn next(&mut self) -> Option<Arc<Task>> {
        if self.head.is_null() {
            return None;
        }
        let task = unsafe { Arc::from_raw(self.head) };
        self.head = task.next.load(Ordering::Relaxed);
        Some(task)
    }
}

impl Drop for TaskChain {
    fn drop(&mut self) {
        for _ in self.by_ref() {}
    }
}

// Counting semaphore with a broadcast wake, standing in for the mach
// semaphore pair the kernel would provide. `post_all` wakes every waiter
// without granting permits; waiters of that flavor must re-check their own
// predicate, which is exactly what the sync-completion protocol does.
struct Semaphore {
    count: Mutex<u32>,
    cond: Condvar,
}

impl Semaphore {
    fn new() -> Self {
        Self {
            count: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    fn post(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.cond.notify_one();
    }

    fn post_all(&self) {
        let _count = self.count.lock();
        self.cond.notify_all();
    }

    fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cond.wait(&mut count);
        }
        *count -= 1;
    }

    fn wait_timeout(&self, timeout: Duration) {
        let mut count = self.count.lock();
        let _ = self.cond.wait_for(&mut count, timeout);
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum WorkerRole {
    RealTime,
    NonRealTime,
}

struct Shared {
    rt_tasks: TaskStack,
    non_rt_tasks: TaskStack,
    free_list: TaskStack,
    rt_work_queued: Semaphore,
    non_rt_work_queued: Semaphore,
    rt_sync_completed: Semaphore,
    non_rt_sync_completed: Semaphore,
}

impl Shared {
    fn queue_sync(&self, on_realtime: bool, kind: TaskKind) -> u64 {
        let task = Arc::new(Task::new(kind, true));
        let (tasks, work_queued, completed) = if on_realtime {
            (&self.rt_tasks, &self.rt_work_queued, &self.rt_sync_completed)
        } else {
            (
                &self.non_rt_tasks,
                &self.non_rt_work_queued,
                &self.non_rt_sync_completed,
            )
        };

        tasks.push(task.clone());
        work_queued.post();

        // The worker broadcasts after every completed task, and waits can
        // resolve out of submission order, so park in a loop and re-check our
        // own flag after every wake.
        let mut logged_late = false;
        while !task.complete.load(Ordering::Acquire) {
            completed.wait_timeout(SYNC_WAIT_TIMEOUT);
            if !logged_late && !task.complete.load(Ordering::Acquire) {
                debug!(on_realtime, "sync task taking longer than expected");
                logged_late = true;
            }
        }
        if logged_late {
            debug!(on_realtime, "late sync task finished");
        }
        task.return_value.load(Ordering::Acquire)
    }

    fn queue_async(&self, kind: TaskKind) {
        let task = match self.free_list.pop() {
            Some(task) => task,
            None => {
                warn!("task free list empty, allocating on the submitting thread");
                Arc::new(Task::new(TaskKind::Idle, false))
            }
        };
        *task.kind.lock() = kind;
        task.complete.store(false, Ordering::Relaxed);
        task.return_value.store(TASK_RETURN_UNSET, Ordering::Relaxed);
        self.non_rt_tasks.push(task);
        self.non_rt_work_queued.post();
    }

    fn worker_loop(&self, role: WorkerRole) {
        let (work_queued, tasks, completed) = match role {
            WorkerRole::RealTime => (&self.rt_work_queued, &self.rt_tasks, &self.rt_sync_completed),
            WorkerRole::NonRealTime => (
                &self.non_rt_work_queued,
                &self.non_rt_tasks,
                &self.non_rt_sync_completed,
            ),
        };

        let mut should_stop = false;
        while !should_stop {
            work_queued.wait();

            for task in tasks.pop_all_reversed() {
                should_stop = self.process(role, &task);

                if task.is_sync {
                    // The submitter may drop its handle the moment this flag
                    // flips; do not touch the task afterwards.
                    task.complete.store(true, Ordering::Release);
                    completed.post_all();
                } else if role == WorkerRole::NonRealTime {
                    *task.kind.lock() = TaskKind::Idle;
                    self.free_list.push(task);
                }

                if should_stop {
                    break;
                }
            }
        }
    }

    fn process(&self, role: WorkerRole, task: &Task) -> bool {
        let kind = std::mem::replace(&mut *task.kind.lock(), TaskKind::Idle);
        match kind {
            TaskKind::StopWorker => {
                debug!(
                    realtime = (role == WorkerRole::RealTime),
                    "worker stopping"
                );
                return true;
            }
            TaskKind::SwapClientShadowMaps(map) => {
                debug_assert!(role == WorkerRole::RealTime);
                map.swap_in_shadow_maps_rt();
            }
            TaskKind::StartClientIo(clients, client_id) => {
                debug_assert!(role == WorkerRole::NonRealTime);
                match clients.start_io_non_rt(client_id) {
                    Ok(did_start) => task
                        .return_value
                        .store(u64::from(did_start), Ordering::Relaxed),
                    Err(DriverError::InvalidClient(_)) => {
                        // The client may have been removed before this task
                        // ran; nothing to do.
                        debug!(client_id, "ignoring start for unknown client");
                    }
                    Err(err) => warn!(client_id, %err, "client io start failed"),
                }
            }
            TaskKind::StopClientIo(clients, client_id) => {
                debug_assert!(role == WorkerRole::NonRealTime);
                match clients.stop_io_non_rt(client_id) {
                    Ok(did_stop) => task
                        .return_value
                        .store(u64::from(did_stop), Ordering::Relaxed),
                    Err(DriverError::InvalidClient(_)) => {
                        debug!(client_id, "ignoring stop for unknown client");
                    }
                    Err(err) => warn!(client_id, %err, "client io stop failed"),
                }
            }
            TaskKind::SendPropertyNotification(host, object_id, selector) => {
                debug_assert!(role == WorkerRole::NonRealTime);
                host.properties_changed(object_id, selector);
            }
            TaskKind::Idle => {}
        }
        false
    }
}

/// The queue pair and its two worker threads.
///
/// Dropping the queue submits a stop task to each worker and joins them.
pub struct TaskQueue {
    shared: Arc<Shared>,
    rt_worker: Option<JoinHandle<()>>,
    non_rt_worker: Option<JoinHandle<()>>,
}

impl TaskQueue {
    /// Create the queue and start both workers.
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            rt_tasks: TaskStack::new(),
            non_rt_tasks: TaskStack::new(),
            free_list: TaskStack::new(),
            rt_work_queued: Semaphore::new(),
            non_rt_work_queued: Semaphore::new(),
            rt_sync_completed: Semaphore::new(),
            non_rt_sync_completed: Semaphore::new(),
        });

        for _ in 0..FREE_LIST_SIZE {
            shared
                .free_list
                .push(Arc::new(Task::new(TaskKind::Idle, false)));
        }

        let rt_shared = shared.clone();
        let rt_worker = std::thread::Builder::new()
            .name("loopback-task-rt".into())
            .spawn(move || {
                clock::promote_current_thread_to_time_constraint(
                    RT_NOMINAL_COMPUTATION_NS,
                    RT_MAXIMUM_COMPUTATION_NS,
                );
                rt_shared.worker_loop(WorkerRole::RealTime);
            })
            .expect("spawn realtime worker");

        let non_rt_shared = shared.clone();
        let non_rt_worker = std::thread::Builder::new()
            .name("loopback-task".into())
            .spawn(move || non_rt_shared.worker_loop(WorkerRole::NonRealTime))
            .expect("spawn non-realtime worker");

        Self {
            shared,
            rt_worker: Some(rt_worker),
            non_rt_worker: Some(non_rt_worker),
        }
    }

    /// Submit `kind` to the chosen worker and block until it has run.
    /// Returns the task's return value, or [`TASK_RETURN_UNSET`].
    pub fn queue_sync(&self, on_realtime: bool, kind: TaskKind) -> u64 {
        self.shared.queue_sync(on_realtime, kind)
    }

    /// Submit `kind` to the non-realtime worker without waiting. Safe to
    /// call from realtime threads.
    pub fn queue_async(&self, kind: TaskKind) {
        self.shared.queue_async(kind);
    }

    /// Have the realtime worker swap `map`'s primary and shadow sides,
    /// returning once the swap is done.
    pub(crate) fn queue_sync_swap_client_shadow_maps(&self, map: Arc<ClientMap>) {
        self.queue_sync(true, TaskKind::SwapClientShadowMaps(map));
    }

    /// Run a client IO start through the non-realtime worker, keeping it
    /// ordered with any queued async updates. Returns whether the device
    /// went from idle to running.
    pub fn queue_sync_start_client_io(
        &self,
        clients: Arc<Clients>,
        client_id: u32,
    ) -> Result<bool, DriverError> {
        match self.queue_sync(false, TaskKind::StartClientIo(clients, client_id)) {
            TASK_RETURN_UNSET => Err(DriverError::IllegalOperation(
                "could not update client io state",
            )),
            value => Ok(value != 0),
        }
    }

    /// Sync counterpart of [`TaskQueue::queue_async_stop_client_io`].
    /// Returns whether the device went from running to idle.
    pub fn queue_sync_stop_client_io(
        &self,
        clients: Arc<Clients>,
        client_id: u32,
    ) -> Result<bool, DriverError> {
        match self.queue_sync(false, TaskKind::StopClientIo(clients, client_id)) {
            TASK_RETURN_UNSET => Err(DriverError::IllegalOperation(
                "could not update client io state",
            )),
            value => Ok(value != 0),
        }
    }

    /// Queue a client IO start without waiting for it.
    pub fn queue_async_start_client_io(&self, clients: Arc<Clients>, client_id: u32) {
        self.queue_async(TaskKind::StartClientIo(clients, client_id));
    }

    /// Queue a client IO stop without waiting for it.
    pub fn queue_async_stop_client_io(&self, clients: Arc<Clients>, client_id: u32) {
        self.queue_async(TaskKind::StopClientIo(clients, client_id));
    }

    /// Queue a property-changed notification toward the host.
    pub fn queue_async_send_property_notification(
        &self,
        host: Arc<HostBridge>,
        object_id: u32,
        selector: PropertySelector,
    ) {
        self.queue_async(TaskKind::SendPropertyNotification(host, object_id, selector));
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.shared.queue_sync(true, TaskKind::StopWorker);
        self.shared.queue_sync(false, TaskKind::StopWorker);
        if let Some(worker) = self.rt_worker.take() {
            let _ = worker.join();
        }
        if let Some(worker) = self.non_rt_worker.take() {
            let _ = worker.join();
        }
    }
}
