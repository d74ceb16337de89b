//! Shared timer scheduler.
//!
//! Retransmitters, cumulative-ack flushes and keep-alives all need
//! "run this later" with cheap cancellation.  Rather than one thread per
//! timer, a [`TimerQueue`] keeps every pending task in a deadline heap and
//! runs them from a single scheduler thread:
//!
//! ```text
//!   schedule(delay, task) ──▶ heap: (deadline, id)   tasks: id → task
//!                                    │
//!             scheduler thread ◀─────┘  pop earliest, wait until due,
//!                                       run task with the lock released
//! ```
//!
//! Cancelling removes the task from the map; its heap entry is skipped when
//! it surfaces.  Tasks may schedule further tasks (self-rearming timers).
//! Tasks run one at a time and must not block.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

type Task = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Inner {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    tasks: HashMap<u64, Task>,
    next_id: u64,
    shutdown: bool,
}

#[derive(Default)]
struct Shared {
    inner: Mutex<Inner>,
    wake: Condvar,
}

/// Owner of the scheduler thread.  Dropping it stops the thread; pending
/// tasks are discarded without running.
pub struct TimerQueue {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
    thread_id: Option<ThreadId>,
}

impl TimerQueue {
    pub fn new() -> std::io::Result<Self> {
        let shared = Arc::new(Shared::default());
        let worker = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("rudp-timer".into())
            .spawn(move || run(&worker))?;
        let thread_id = Some(thread.thread().id());
        Ok(Self {
            shared,
            thread: Some(thread),
            thread_id,
        })
    }

    /// A cloneable handle for scheduling onto this queue.
    pub fn handle(&self) -> Timers {
        Timers {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Number of tasks still waiting to run.
    pub fn pending(&self) -> usize {
        self.shared.inner.lock().tasks.len()
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        let tasks = {
            let mut inner = self.shared.inner.lock();
            inner.shutdown = true;
            inner.heap.clear();
            std::mem::take(&mut inner.tasks)
        };
        self.shared.wake.notify_all();
        drop(tasks);

        // The last owner may be dropped from inside a task.
        if self.thread_id == Some(thread::current().id()) {
            return;
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("[timer] scheduler thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for TimerQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerQueue")
            .field("pending", &self.pending())
            .finish()
    }
}

/// Scheduling handle.  Outlives nothing: once the queue is dropped, new
/// tasks are discarded.
#[derive(Clone)]
pub struct Timers {
    shared: Arc<Shared>,
}

impl Timers {
    /// Run `task` once after `delay`.
    pub fn schedule(&self, delay: Duration, task: impl FnOnce() + Send + 'static) -> TimerHandle {
        let mut inner = self.shared.inner.lock();
        let id = inner.next_id;
        inner.next_id = inner.next_id.wrapping_add(1);
        if inner.shutdown {
            drop(inner);
            return TimerHandle {
                id,
                shared: Weak::new(),
            };
        }
        inner.heap.push(Reverse((Instant::now() + delay, id)));
        inner.tasks.insert(id, Box::new(task));
        drop(inner);
        self.shared.wake.notify_one();
        TimerHandle {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }
}

impl std::fmt::Debug for Timers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Timers")
    }
}

/// A scheduled task.  Dropping the handle does not cancel it.
#[derive(Debug)]
pub struct TimerHandle {
    id: u64,
    shared: Weak<Shared>,
}

impl TimerHandle {
    /// Cancel the task.  Returns `false` if it already ran or was cancelled.
    pub fn cancel(&self) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let task = shared.inner.lock().tasks.remove(&self.id);
        task.is_some()
    }
}

fn run(shared: &Shared) {
    let mut inner = shared.inner.lock();
    loop {
        if inner.shutdown {
            break;
        }
        let Some(&Reverse((deadline, id))) = inner.heap.peek() else {
            shared.wake.wait(&mut inner);
            continue;
        };
        if deadline > Instant::now() {
            shared.wake.wait_until(&mut inner, deadline);
            continue;
        }
        inner.heap.pop();
        if let Some(task) = inner.tasks.remove(&id) {
            MutexGuard::unlocked(&mut inner, || {
                if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                    log::error!("[timer] task {id} panicked");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn task_runs_after_delay() {
        let queue = TimerQueue::new().unwrap();
        let (tx, rx) = mpsc::channel();
        let start = Instant::now();
        queue.handle().schedule(Duration::from_millis(30), move || {
            tx.send(Instant::now()).unwrap();
        });
        let fired = rx.recv_timeout(Duration::from_secs(2)).expect("task ran");
        assert!(fired - start >= Duration::from_millis(30));
    }

    #[test]
    fn tasks_run_in_deadline_order() {
        let queue = TimerQueue::new().unwrap();
        let timers = queue.handle();
        let (tx, rx) = mpsc::channel();
        for (delay, tag) in [(60, 'c'), (20, 'a'), (40, 'b')] {
            let tx = tx.clone();
            timers.schedule(Duration::from_millis(delay), move || tx.send(tag).unwrap());
        }
        let order: Vec<char> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert_eq!(order, vec!['a', 'b', 'c']);
    }

    #[test]
    fn cancelled_task_never_runs() {
        let queue = TimerQueue::new().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let handle = queue.handle().schedule(Duration::from_millis(30), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert!(handle.cancel());
        assert!(!handle.cancel());
        thread::sleep(Duration::from_millis(80));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn task_can_reschedule_itself() {
        fn tick(timers: Timers, count: Arc<AtomicUsize>, tx: mpsc::Sender<()>) {
            if count.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                tx.send(()).unwrap();
                return;
            }
            let next = timers.clone();
            timers.schedule(Duration::from_millis(5), move || tick(next, count, tx));
        }

        let queue = TimerQueue::new().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        let timers = queue.handle();
        let c = Arc::clone(&count);
        queue
            .handle()
            .schedule(Duration::from_millis(5), move || tick(timers, c, tx));
        rx.recv_timeout(Duration::from_secs(2)).expect("three ticks");
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn panicking_task_does_not_stop_the_scheduler() {
        let queue = TimerQueue::new().unwrap();
        let timers = queue.handle();
        let (tx, rx) = mpsc::channel();
        timers.schedule(Duration::ZERO, || panic!("boom"));
        timers.schedule(Duration::from_millis(10), move || tx.send(()).unwrap());
        rx.recv_timeout(Duration::from_secs(2)).expect("second task ran");
    }

    #[test]
    fn schedule_after_drop_is_inert() {
        let queue = TimerQueue::new().unwrap();
        let timers = queue.handle();
        drop(queue);
        let handle = timers.schedule(Duration::ZERO, || unreachable!());
        assert!(!handle.cancel());
    }
}
