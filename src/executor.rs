//! Bounded-concurrency batch runner with per-task timeouts and retries.
//!
//! Items are submitted in fixed-size batches to a pool of scoped worker
//! threads. Each attempt gets a deadline once a worker picks it up; an
//! attempt that misses it is abandoned and the item resubmitted until the
//! retry budget runs out. Errors returned by the work function are terminal.
//! Every input item ends up in exactly one of the two result maps.

use crate::config::TaskSettings;
use crossbeam_channel::{unbounded, RecvTimeoutError};
use serde::Serialize;
use std::{
    any::Any,
    collections::{HashMap, HashSet},
    fmt,
    hash::Hash,
    panic::{self, AssertUnwindSafe},
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum TaskFailure {
    Timeout,
    Error(String),
    Panicked(String),
    /// The pool stopped before the item resolved.
    Aborted,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskFailure::Timeout => write!(f, "Timeout"),
            TaskFailure::Error(message) => write!(f, "{message}"),
            TaskFailure::Panicked(message) => write!(f, "task panicked: {message}"),
            TaskFailure::Aborted => write!(f, "worker pool stopped"),
        }
    }
}

/// Partition of a batch run.
#[derive(Debug)]
pub struct TaskOutcome<I, T> {
    pub succeeded: HashMap<I, T>,
    pub failed: HashMap<I, TaskFailure>,
}

impl<I: Eq + Hash, T> TaskOutcome<I, T> {
    fn new() -> Self {
        Self {
            succeeded: HashMap::new(),
            failed: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct TaskRetryExecutor {
    pool_size: usize,
    batch_size: usize,
    timeout: Duration,
    max_retries: u32,
}

impl TaskRetryExecutor {
    pub fn new(pool_size: usize, batch_size: usize, timeout: Duration, max_retries: u32) -> Self {
        Self {
            pool_size: pool_size.max(1),
            batch_size: batch_size.max(1),
            timeout,
            max_retries,
        }
    }

    pub fn from_settings(settings: &TaskSettings) -> Self {
        let pool_size = settings.pool_size.unwrap_or_else(logical_cores);
        Self::new(
            pool_size,
            settings.batch_size,
            settings.timeout(),
            settings.max_retries,
        )
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Runs `work` once per distinct item.
    ///
    /// Blocks until every item resolved and every worker thread exited,
    /// including threads still busy with abandoned (timed out) attempts.
    pub fn run<I, T, E, F>(&self, items: &[I], work: F) -> TaskOutcome<I, T>
    where
        I: Clone + Eq + Hash + Send + Sync,
        T: Send,
        E: fmt::Display,
        F: Fn(&I) -> Result<T, E> + Sync,
    {
        self.run_attempts(items, |item, _attempt| work(item))
    }

    /// Like [`run`](Self::run), but also hands `work` the attempt number
    /// (0 for the first try). An abandoned attempt may still be running
    /// when its retry starts, so work with side effects should keep them
    /// apart per attempt.
    pub fn run_attempts<I, T, E, F>(&self, items: &[I], work: F) -> TaskOutcome<I, T>
    where
        I: Clone + Eq + Hash + Send + Sync,
        T: Send,
        E: fmt::Display,
        F: Fn(&I, u32) -> Result<T, E> + Sync,
    {
        let items = distinct(items);
        let mut outcome = TaskOutcome::new();
        if items.is_empty() {
            return outcome;
        }

        let cancelled = AtomicBool::new(false);

        thread::scope(|scope| {
            let (job_tx, job_rx) = unbounded::<Job>();
            let (event_tx, event_rx) = unbounded::<Event<T>>();
            let _cancel_guard = CancelOnDrop(&cancelled);

            for _ in 0..self.pool_size {
                let job_rx = job_rx.clone();
                let event_tx = event_tx.clone();
                let (items, work, cancelled) = (&items, &work, &cancelled);
                scope.spawn(move || {
                    for job in job_rx.iter() {
                        if cancelled.load(Ordering::Relaxed) {
                            continue;
                        }
                        if event_tx.send(Event::Started(job)).is_err() {
                            break;
                        }
                        let result = panic::catch_unwind(AssertUnwindSafe(|| {
                            work(&items[job.index], job.attempt)
                        }));
                        let result = match result {
                            Ok(Ok(value)) => Ok(value),
                            Ok(Err(err)) => Err(TaskFailure::Error(err.to_string())),
                            Err(payload) => Err(TaskFailure::Panicked(panic_message(payload))),
                        };
                        if event_tx.send(Event::Finished(job, result)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(job_rx);
            drop(event_tx);

            let mut coordinator = Coordinator {
                executor: self,
                items: &items,
                job_tx: &job_tx,
                pending: HashMap::new(),
                outcome: &mut outcome,
            };
            let indices: Vec<usize> = (0..items.len()).collect();
            for batch in indices.chunks(self.batch_size) {
                for &index in batch {
                    coordinator.submit(index, 0, 0);
                }
                coordinator.drain(&event_rx);
            }

            cancelled.store(true, Ordering::Relaxed);
            drop(job_tx);
        });

        outcome
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Job {
    index: usize,
    attempt: u32,
}

enum Event<T> {
    Started(Job),
    Finished(Job, Result<T, TaskFailure>),
}

struct Pending {
    attempt: u32,
    retries: u32,
    deadline: Option<Instant>,
}

struct Coordinator<'a, I, T> {
    executor: &'a TaskRetryExecutor,
    items: &'a [I],
    job_tx: &'a crossbeam_channel::Sender<Job>,
    pending: HashMap<usize, Pending>,
    outcome: &'a mut TaskOutcome<I, T>,
}

impl<I, T> Coordinator<'_, I, T>
where
    I: Clone + Eq + Hash,
{
    fn submit(&mut self, index: usize, attempt: u32, retries: u32) {
        let job = Job { index, attempt };
        if self.job_tx.send(job).is_err() {
            self.fail(index, TaskFailure::Aborted);
            return;
        }
        self.pending.insert(
            index,
            Pending {
                attempt,
                retries,
                deadline: None,
            },
        );
    }

    /// Collects completions in whatever order the pool yields them until
    /// the current batch (including its retries) is resolved.
    fn drain(&mut self, events: &crossbeam_channel::Receiver<Event<T>>) {
        while !self.pending.is_empty() {
            let next_deadline = self.pending.values().filter_map(|p| p.deadline).min();
            let event = match next_deadline {
                Some(deadline) => events.recv_deadline(deadline),
                None => events.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };

            match event {
                Ok(Event::Started(job)) => {
                    let timeout = self.executor.timeout;
                    if let Some(pending) = self.current_mut(job) {
                        pending.deadline = Some(Instant::now() + timeout);
                    }
                }
                Ok(Event::Finished(job, result)) => {
                    if self.current_mut(job).is_none() {
                        debug!("ignoring late result for abandoned attempt {}", job.attempt);
                        continue;
                    }
                    self.pending.remove(&job.index);
                    match result {
                        Ok(value) => {
                            self.outcome
                                .succeeded
                                .insert(self.items[job.index].clone(), value);
                        }
                        Err(failure) => self.fail(job.index, failure),
                    }
                }
                Err(RecvTimeoutError::Timeout) => self.expire(Instant::now()),
                Err(RecvTimeoutError::Disconnected) => {
                    let stranded: Vec<usize> = self.pending.drain().map(|(index, _)| index).collect();
                    for index in stranded {
                        self.fail(index, TaskFailure::Aborted);
                    }
                }
            }
        }
    }

    fn expire(&mut self, now: Instant) {
        let expired: Vec<usize> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.deadline.is_some_and(|deadline| deadline <= now))
            .map(|(index, _)| *index)
            .collect();

        for index in expired {
            let Some(pending) = self.pending.remove(&index) else {
                continue;
            };
            let retries = pending.retries + 1;
            if retries > self.executor.max_retries {
                warn!("task {index} timed out, retries exhausted");
                self.fail(index, TaskFailure::Timeout);
            } else {
                warn!(
                    "task {index} timed out, retry {retries}/{}",
                    self.executor.max_retries
                );
                self.submit(index, pending.attempt + 1, retries);
            }
        }
    }

    fn current_mut(&mut self, job: Job) -> Option<&mut Pending> {
        self.pending
            .get_mut(&job.index)
            .filter(|pending| pending.attempt == job.attempt)
    }

    fn fail(&mut self, index: usize, failure: TaskFailure) {
        self.outcome
            .failed
            .insert(self.items[index].clone(), failure);
    }
}

/// Makes queued jobs no-ops if the coordinator unwinds.
struct CancelOnDrop<'a>(&'a AtomicBool);

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

fn distinct<I: Clone + Eq + Hash>(items: &[I]) -> Vec<I> {
    let mut seen = HashSet::new();
    items
        .iter()
        .filter(|item| seen.insert((*item).clone()))
        .cloned()
        .collect()
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return message.to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "unknown panic".to_string()
}

pub fn logical_cores() -> usize {
    thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    fn executor(pool: usize, batch: usize, timeout_ms: u64, retries: u32) -> TaskRetryExecutor {
        TaskRetryExecutor::new(pool, batch, Duration::from_millis(timeout_ms), retries)
    }

    #[test]
    fn partitions_every_item_exactly_once() {
        let items: Vec<u32> = (0..37).collect();
        let outcome = executor(4, 10, 5_000, 1).run(&items, |item| {
            if item % 5 == 0 {
                Err(format!("bad item {item}"))
            } else {
                Ok(item * 2)
            }
        });

        assert_eq!(outcome.len(), items.len());
        for item in &items {
            let in_success = outcome.succeeded.contains_key(item);
            let in_failure = outcome.failed.contains_key(item);
            assert!(in_success ^ in_failure, "item {item} resolved twice or never");
        }
        assert_eq!(outcome.succeeded.get(&3), Some(&6));
        assert_eq!(
            outcome.failed.get(&10),
            Some(&TaskFailure::Error("bad item 10".to_string()))
        );
    }

    #[test]
    fn duplicate_items_resolve_once() {
        let calls = AtomicUsize::new(0);
        let outcome = executor(2, 10, 5_000, 0).run(&["a", "a", "b"], |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(())
        });
        assert_eq!(outcome.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn always_slow_item_is_retried_then_fails_with_timeout() {
        let attempts = AtomicUsize::new(0);
        let outcome = executor(4, 10, 50, 2).run(&["slow", "fast"], |item| {
            if *item == "slow" {
                attempts.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(300));
            }
            Ok::<_, String>(item.len())
        });

        assert_eq!(outcome.failed.get("slow"), Some(&TaskFailure::Timeout));
        assert_eq!(outcome.failed["slow"].to_string(), "Timeout");
        assert_eq!(outcome.succeeded.get("fast"), Some(&4));
        // One initial attempt plus max_retries resubmissions.
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn overlapping_attempts_carry_distinct_numbers() {
        let seen = Mutex::new(Vec::new());
        let outcome = executor(4, 10, 50, 2).run_attempts(&["slow"], |_, attempt| {
            seen.lock().unwrap().push(attempt);
            thread::sleep(Duration::from_millis(200));
            Ok::<_, String>(attempt)
        });

        assert_eq!(outcome.failed.get("slow"), Some(&TaskFailure::Timeout));
        let mut seen = seen.into_inner().unwrap();
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn item_that_recovers_within_budget_succeeds() {
        let attempts = AtomicUsize::new(0);
        let outcome = executor(4, 10, 100, 3).run(&["flaky"], |_| {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < 2 {
                thread::sleep(Duration::from_millis(500));
            }
            Ok::<_, String>(attempt)
        });

        assert!(outcome.failed.is_empty());
        assert_eq!(outcome.succeeded.get("flaky"), Some(&2));
    }

    #[test]
    fn errors_are_not_retried() {
        let attempts = AtomicUsize::new(0);
        let outcome = executor(2, 10, 5_000, 5).run(&[1], |_| {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>("boom")
        });
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.failed.get(&1), Some(&TaskFailure::Error("boom".into())));
    }

    #[test]
    fn panics_become_failures() {
        let outcome = executor(2, 10, 5_000, 0).run(&[1, 2], |item| {
            if *item == 2 {
                panic!("exploded on {item}");
            }
            Ok::<_, String>(*item)
        });
        assert_eq!(outcome.succeeded.get(&1), Some(&1));
        assert_eq!(
            outcome.failed.get(&2),
            Some(&TaskFailure::Panicked("exploded on 2".to_string()))
        );
    }

    #[test]
    fn concurrency_never_exceeds_pool_size() {
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let items: Vec<u32> = (0..24).collect();
        let outcome = executor(3, 10, 5_000, 0).run(&items, |_| {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(10));
            active.fetch_sub(1, Ordering::SeqCst);
            Ok::<_, String>(())
        });
        assert_eq!(outcome.succeeded.len(), 24);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn batches_finish_before_the_next_starts() {
        let order = Mutex::new(Vec::new());
        let items: Vec<u32> = (0..6).collect();
        executor(4, 3, 5_000, 0).run(&items, |item| {
            order.lock().unwrap().push(*item);
            Ok::<_, String>(())
        });
        let order = order.into_inner().unwrap();
        let first: HashSet<u32> = order[..3].iter().copied().collect();
        assert_eq!(first, HashSet::from([0, 1, 2]));
    }

    #[test]
    fn empty_input_spawns_nothing() {
        let outcome = executor(2, 10, 100, 0).run(&Vec::<u8>::new(), |_| Ok::<_, String>(()));
        assert!(outcome.is_empty());
    }
}
