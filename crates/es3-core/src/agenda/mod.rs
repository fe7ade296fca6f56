//! Task queue, worker pool and dispatch policy.
//!
//! One lock covers the queue, per-class in-use counts, the working count and
//! the segments-in-flight counter; a second lock covers statistics so
//! schedulers never stall on progress updates. Workers scan queued tasks in
//! (segment need, class, ordinal, insertion) order and dispatch the first
//! task whose class has capacity and whose segments can be reserved without
//! blocking. Blocking segment acquisition is only ever done without the
//! queue lock held, so the pool condition and the queue share one condvar
//! safely.

mod progress;
mod segment;
mod task;
mod worker;

pub use segment::Segment;
pub use task::{Task, TaskClass};
pub use worker::RetryPolicy;

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use crate::config::Es3Config;

/// Queue position: ascending segment need, then class scan order, then
/// ordinal, then insertion sequence.
type QueueKey = (usize, usize, i64, u64);

struct QueueState {
    tasks: BTreeMap<QueueKey, Box<dyn Task>>,
    seq: u64,
    working: usize,
    in_use: [usize; 3],
    segments_in_flight: usize,
}

struct Stats {
    submitted: usize,
    done: usize,
    failed: usize,
    counters: BTreeMap<String, u64>,
}

/// The scheduler: queue, worker pool, segment pool and progress accounting.
pub struct Agenda {
    queue: Mutex<QueueState>,
    cond: Condvar,
    stats: Mutex<Stats>,
    limits: [usize; 3],
    segment_size: u64,
    max_in_flight: usize,
    quiet: bool,
    final_quiet: bool,
    retry: RetryPolicy,
    started: Instant,
}

impl Agenda {
    pub fn new(
        unbound: usize,
        cpu_bound: usize,
        io_bound: usize,
        quiet: bool,
        final_quiet: bool,
        segment_size: u64,
        max_in_flight: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(QueueState {
                tasks: BTreeMap::new(),
                seq: 0,
                working: 0,
                in_use: [0; 3],
                segments_in_flight: 0,
            }),
            cond: Condvar::new(),
            stats: Mutex::new(Stats {
                submitted: 0,
                done: 0,
                failed: 0,
                counters: BTreeMap::new(),
            }),
            limits: [unbound, cpu_bound, io_bound],
            segment_size,
            max_in_flight,
            quiet,
            final_quiet,
            retry: RetryPolicy::default(),
            started: Instant::now(),
        })
    }

    /// Agenda sized from a normalized config.
    pub fn from_config(cfg: &Es3Config, quiet: bool, final_quiet: bool) -> Arc<Self> {
        Self::new(
            cfg.thread_num,
            cfg.compressor_threads,
            cfg.reader_threads,
            quiet,
            final_quiet,
            cfg.segment_size,
            cfg.segments_in_flight,
        )
    }

    /// Replaces the retry policy. Must be called before the agenda is
    /// shared with any worker or task.
    pub fn with_retry_policy(self: Arc<Self>, retry: RetryPolicy) -> Arc<Self> {
        let mut this = Arc::try_unwrap(self).unwrap_or_else(|_| panic!("agenda already shared"));
        this.retry = retry;
        Arc::new(this)
    }

    pub fn segment_size(&self) -> u64 {
        self.segment_size
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Inserts a task into its (segment need, class, ordinal) bucket and
    /// wakes one worker.
    pub fn schedule(&self, task: Box<dyn Task>) {
        {
            let mut q = self.queue.lock().unwrap();
            let key =
                (task.segments_needed(), task.class().rank(), task.ordinal(), q.seq);
            q.seq += 1;
            q.tasks.insert(key, task);
        }
        self.cond.notify_one();
        self.stats.lock().unwrap().submitted += 1;
    }

    /// Runs workers until the queue drains, then joins them. Returns the
    /// number of tasks that exhausted their retries.
    pub fn run(self: &Arc<Self>) -> usize {
        let mut handles = Vec::new();
        let thread_num: usize = self.limits.iter().sum();
        for _ in 0..thread_num {
            let agenda = Arc::clone(self);
            handles.push(std::thread::spawn(move || worker::worker_loop(&agenda)));
        }
        if !self.quiet {
            let agenda = Arc::clone(self);
            handles.push(std::thread::spawn(move || progress::progress_loop(&agenda)));
        }
        for handle in handles {
            let _ = handle.join();
        }
        if !self.quiet {
            // Redraw once after the join so the final counts stay visible.
            self.draw_progress_widget();
            eprintln!();
        }
        if !self.final_quiet {
            self.print_epilogue();
        }
        self.stats.lock().unwrap().failed
    }

    /// Number of tasks still queued (not dispatched). Non-zero after `run`
    /// means completing tasks scheduled follow-up work the drained pool
    /// never picked up; drivers re-run the schedule in that case.
    pub fn tasks_count(&self) -> usize {
        self.queue.lock().unwrap().tasks.len()
    }

    /// Descriptions of all queued tasks, for end-of-run diagnostics.
    pub fn queued_descriptions(&self) -> Vec<String> {
        let q = self.queue.lock().unwrap();
        q.tasks.values().map(|t| t.describe()).collect()
    }

    /// Current number of reserved pool slots.
    pub fn segments_in_flight(&self) -> usize {
        self.queue.lock().unwrap().segments_in_flight
    }

    /// Accumulates a named byte counter (e.g. "uploaded").
    pub fn add_stat_counter(&self, name: &str, val: u64) {
        let mut stats = self.stats.lock().unwrap();
        *stats.counters.entry(name.to_string()).or_insert(0) += val;
    }

    /// (submitted, done, failed) snapshot.
    pub fn task_counts(&self) -> (usize, usize, usize) {
        let stats = self.stats.lock().unwrap();
        (stats.submitted, stats.done, stats.failed)
    }

    /// Byte counter snapshot.
    pub fn stat_counter(&self, name: &str) -> u64 {
        self.stats.lock().unwrap().counters.get(name).copied().unwrap_or(0)
    }

    /// Blocks until `n` pool slots can be reserved, then returns the
    /// segments. Must not be called while holding any agenda-visible lock.
    pub fn acquire_segments(self: &Arc<Self>, n: usize) -> Vec<Segment> {
        let mut q = self.queue.lock().unwrap();
        while self.max_in_flight - q.segments_in_flight < n {
            q = self.cond.wait(q).unwrap();
        }
        q.segments_in_flight += n;
        drop(q);
        (0..n).map(|_| Segment::new(Arc::clone(self))).collect()
    }

    pub(crate) fn release_segment_slot(&self) {
        {
            let mut q = self.queue.lock().unwrap();
            debug_assert!(q.segments_in_flight > 0);
            q.segments_in_flight -= 1;
        }
        // A freed slot may unblock any sleeping worker's scan.
        self.cond.notify_all();
    }

    /// Claims the next dispatchable task together with its reserved
    /// segments. Returns `None` when the queue is empty and nothing is in
    /// flight (worker shutdown).
    fn claim(self: &Arc<Self>) -> Option<(Box<dyn Task>, Vec<Segment>)> {
        let mut q = self.queue.lock().unwrap();
        loop {
            if q.tasks.is_empty() && q.working == 0 {
                return None;
            }

            let mut chosen: Option<QueueKey> = None;
            for (&key, _) in q.tasks.iter() {
                let (need, rank, _, _) = key;
                // Unbound borrows capacity from other classes; the rest cap
                // out at their own limit.
                if rank != TaskClass::Unbound.rank() && q.in_use[rank] >= self.limits[rank] {
                    continue;
                }
                if need > self.max_in_flight - q.segments_in_flight {
                    continue;
                }
                chosen = Some(key);
                break;
            }

            if let Some(key) = chosen {
                let task = q.tasks.remove(&key).unwrap();
                q.working += 1;
                q.in_use[key.1] += 1;
                q.segments_in_flight += key.0;
                drop(q);
                let segments = (0..key.0).map(|_| Segment::new(Arc::clone(self))).collect();
                return Some((task, segments));
            }

            q = self.cond.wait(q).unwrap();
        }
    }

    /// Post-execution bookkeeping; wakes one worker while work remains, all
    /// of them once the queue has fully drained.
    fn cleanup(&self, class: TaskClass, fail: bool) {
        let finished = {
            let mut q = self.queue.lock().unwrap();
            q.working -= 1;
            debug_assert!(q.in_use[class.rank()] > 0);
            q.in_use[class.rank()] -= 1;
            q.tasks.is_empty() && q.working == 0
        };
        if finished {
            self.cond.notify_all();
        } else {
            self.cond.notify_one();
        }

        let mut stats = self.stats.lock().unwrap();
        stats.done += 1;
        if fail {
            stats.failed += 1;
        }
    }

    fn draw_progress_widget(&self) {
        let stats = self.stats.lock().unwrap();
        let mut line = format!("Tasks: [{}/{}]", stats.done, stats.submitted);
        if stats.failed > 0 {
            line.push_str(&format!(" Failed tasks: {}", stats.failed));
        }
        drop(stats);
        use std::io::Write;
        let mut err = std::io::stderr();
        let _ = write!(err, "{}\r", line);
        let _ = err.flush();
    }

    fn print_epilogue(&self) {
        let elapsed = self.started.elapsed();
        let millis = elapsed.as_millis().max(1) as u64;
        eprintln!("time taken [sec]: {}.{:03}", millis / 1000, millis % 1000);
        let stats = self.stats.lock().unwrap();
        for (name, val) in stats.counters.iter() {
            let avg = val * 1000 / millis;
            eprintln!("{} [B]: {}, average [B/sec]: {}", name, val, avg);
        }
    }

    fn work_remains(&self) -> bool {
        let q = self.queue.lock().unwrap();
        !q.tasks.is_empty() || q.working > 0
    }
}
