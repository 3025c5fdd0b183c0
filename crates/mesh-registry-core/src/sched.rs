//! Deadline-ordered task queue and the reactor loop that owns it.
//!
//! One reactor task per context drives every background concern: cache GC,
//! circuit-breaker timing passes, health-check dispatch, rate-limit
//! reconciliation and the periodic discover polls. Tasks are closures that
//! may re-arm themselves by returning [`TaskOutcome::Reschedule`]. A
//! panicking task is logged and dropped; it never kills the reactor.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::clock;

/// What a task wants after one run.
pub enum TaskOutcome {
    Done,
    Reschedule(Duration),
}

/// A scheduled closure; receives the reactor's current time.
pub type Task = Box<dyn FnMut(u64) -> TaskOutcome + Send>;

/// Cancellation handle returned by `schedule`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(u64);

struct Scheduled {
    deadline_ms: u64,
    seq: u64,
    id: u64,
    task: Task,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.deadline_ms == other.deadline_ms && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    // Reversed so the std max-heap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.deadline_ms, other.seq).cmp(&(self.deadline_ms, self.seq))
    }
}

/// Min-heap of timed tasks. Owned by a single reactor; not thread-safe by
/// itself.
#[derive(Default)]
pub struct TaskQueue {
    heap: BinaryHeap<Scheduled>,
    cancelled: HashSet<u64>,
    next_seq: u64,
}

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, task: Task, delay: Duration, now_ms: u64) -> TaskHandle {
        let id = NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed);
        self.schedule_with_id(id, task, delay, now_ms);
        TaskHandle(id)
    }

    fn schedule_with_id(&mut self, id: u64, task: Task, delay: Duration, now_ms: u64) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Scheduled {
            deadline_ms: now_ms.saturating_add(delay.as_millis() as u64),
            seq,
            id,
            task,
        });
    }

    pub fn cancel(&mut self, handle: TaskHandle) {
        self.cancelled.insert(handle.0);
    }

    /// Earliest pending deadline, if any.
    pub fn next_deadline_ms(&self) -> Option<u64> {
        self.heap.peek().map(|entry| entry.deadline_ms)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Runs every task whose deadline has passed; re-arms tasks that ask
    /// for it. Returns how many tasks ran.
    pub fn run_due(&mut self, now_ms: u64) -> usize {
        let mut ran = 0;
        while self
            .heap
            .peek()
            .is_some_and(|entry| entry.deadline_ms <= now_ms)
        {
            let Some(mut entry) = self.heap.pop() else {
                break;
            };
            if self.cancelled.remove(&entry.id) {
                continue;
            }
            ran += 1;
            let outcome = catch_unwind(AssertUnwindSafe(|| (entry.task)(now_ms)));
            match outcome {
                Ok(TaskOutcome::Reschedule(delay)) => {
                    self.schedule_with_id(entry.id, entry.task, delay, now_ms);
                }
                Ok(TaskOutcome::Done) => {}
                Err(_) => {
                    tracing::warn!(task_id = entry.id, "scheduled task panicked; dropped");
                }
            }
        }
        ran
    }
}

enum Command {
    Schedule {
        id: u64,
        task: Task,
        delay: Duration,
    },
    RunNow(Task),
    Cancel(TaskHandle),
    Shutdown,
}

/// Clonable handle for scheduling work onto a running reactor.
#[derive(Clone)]
pub struct ReactorHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl ReactorHandle {
    pub fn schedule(&self, task: Task, delay: Duration) -> TaskHandle {
        let id = NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed);
        let _ = self.tx.send(Command::Schedule { id, task, delay });
        TaskHandle(id)
    }

    pub fn run_now(&self, task: Task) {
        let _ = self.tx.send(Command::RunNow(task));
    }

    pub fn cancel(&self, handle: TaskHandle) {
        let _ = self.tx.send(Command::Cancel(handle));
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }
}

/// The reactor: drains commands and dispatches due tasks on one owner task.
pub struct Reactor {
    queue: TaskQueue,
    rx: mpsc::UnboundedReceiver<Command>,
    tick: Duration,
}

impl Reactor {
    pub fn new() -> (Self, ReactorHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                queue: TaskQueue::new(),
                rx,
                tick: Duration::from_millis(50),
            },
            ReactorHandle { tx },
        )
    }

    /// Runs until shutdown is requested or every handle is dropped.
    pub async fn run(self) {
        let Reactor {
            mut queue,
            mut rx,
            tick,
        } = self;
        loop {
            let now_ms = clock::tick();
            while let Ok(command) = rx.try_recv() {
                if !apply(&mut queue, command, now_ms) {
                    return;
                }
            }
            queue.run_due(now_ms);

            let sleep = match queue.next_deadline_ms() {
                Some(deadline) => Duration::from_millis(deadline.saturating_sub(now_ms).max(1)),
                None => tick,
            };
            tokio::select! {
                command = rx.recv() => match command {
                    Some(command) => {
                        let now_ms = clock::tick();
                        if !apply(&mut queue, command, now_ms) {
                            return;
                        }
                    }
                    None => return,
                },
                _ = tokio::time::sleep(sleep) => {}
            }
        }
    }
}

fn apply(queue: &mut TaskQueue, command: Command, now_ms: u64) -> bool {
    match command {
        Command::Schedule { id, task, delay } => {
            queue.schedule_with_id(id, task, delay, now_ms);
        }
        Command::RunNow(mut task) => {
            let outcome = catch_unwind(AssertUnwindSafe(|| task(now_ms)));
            match outcome {
                Ok(TaskOutcome::Reschedule(delay)) => {
                    queue.schedule(task, delay, now_ms);
                }
                Ok(TaskOutcome::Done) => {}
                Err(_) => {
                    tracing::warn!("immediate task panicked; dropped");
                }
            }
        }
        Command::Cancel(handle) => queue.cancel(handle),
        Command::Shutdown => return false,
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn due_tasks_run_in_deadline_order() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut queue = TaskQueue::new();
        for (label, delay) in [("late", 20u64), ("early", 5), ("mid", 10)] {
            let order = order.clone();
            queue.schedule(
                Box::new(move |_| {
                    order.lock().push(label);
                    TaskOutcome::Done
                }),
                Duration::from_millis(delay),
                0,
            );
        }
        assert_eq!(queue.run_due(4), 0);
        assert_eq!(queue.run_due(25), 3);
        assert_eq!(*order.lock(), vec!["early", "mid", "late"]);
    }

    #[test]
    fn rescheduling_task_reruns() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut queue = TaskQueue::new();
        let seen = count.clone();
        queue.schedule(
            Box::new(move |_| {
                let n = seen.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    TaskOutcome::Reschedule(Duration::from_millis(10))
                } else {
                    TaskOutcome::Done
                }
            }),
            Duration::from_millis(10),
            0,
        );
        queue.run_due(10);
        queue.run_due(20);
        queue.run_due(30);
        queue.run_due(40);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn cancelled_task_never_runs() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut queue = TaskQueue::new();
        let seen = count.clone();
        let handle = queue.schedule(
            Box::new(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                TaskOutcome::Done
            }),
            Duration::from_millis(10),
            0,
        );
        queue.cancel(handle);
        queue.run_due(100);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn panicking_task_does_not_poison_queue() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut queue = TaskQueue::new();
        queue.schedule(
            Box::new(|_| panic!("probe failure")),
            Duration::from_millis(5),
            0,
        );
        let seen = count.clone();
        queue.schedule(
            Box::new(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                TaskOutcome::Done
            }),
            Duration::from_millis(10),
            0,
        );
        queue.run_due(50);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reactor_runs_immediate_tasks() {
        let (reactor, handle) = Reactor::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let seen = ran.clone();
        let join = tokio::spawn(reactor.run());
        handle.run_now(Box::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            TaskOutcome::Done
        }));
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown();
        join.await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reactor_runs_scheduled_tasks() {
        let (reactor, handle) = Reactor::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let seen = ran.clone();
        let join = tokio::spawn(reactor.run());
        handle.schedule(
            Box::new(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                TaskOutcome::Done
            }),
            Duration::from_millis(1),
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.shutdown();
        join.await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
