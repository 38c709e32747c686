//! Producer threads and their bounded event queues.
//!
//! One thread per event class. Each producer runs the shared dispatch stream
//! and generates an event whenever a drawn value lands in its own range; the
//! finished batch goes into the class's bounded queue, where the consumer
//! collects it in dispatch order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use rand::SeedableRng;
use rand::rngs::StdRng;

use super::classes::{EventClass, GenContext, generate_event};
use super::dispatch::{DispatchRange, DispatchRng};
use crate::flowrec::FlowRecord;

/// Content-RNG seed for one class: decorrelated from the dispatch seed and
/// from the other classes.
pub(crate) fn content_seed(seed: u32, class_index: usize) -> u64 {
    u64::from(seed) ^ (class_index as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

pub(crate) enum PopError {
    /// The producer stopped generating but the dispatch stream still selected
    /// it: the streams have desynchronized.
    Starved,
    /// Shutdown was requested while waiting.
    ShutDown,
}

struct QueueState {
    batches: VecDeque<Vec<FlowRecord>>,
    done: bool,
}

/// Bounded batch queue shared between one producer and the consumer.
pub(crate) struct WorkerQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
}

impl WorkerQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                batches: VecDeque::new(),
                done: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Block until the queue has room, then push. Returns `false` when
    /// shutdown interrupted the wait.
    fn push(&self, batch: Vec<FlowRecord>, max_available: usize, shutdown: &AtomicBool) -> bool {
        let mut st = self.state.lock().expect("worker queue poisoned");
        while st.batches.len() >= max_available {
            if shutdown.load(Ordering::Relaxed) {
                return false;
            }
            st = self.cond.wait(st).expect("worker queue poisoned");
        }
        let was_empty = st.batches.is_empty();
        st.batches.push_back(batch);
        drop(st);
        if was_empty {
            // The consumer only sleeps on an empty queue.
            self.cond.notify_all();
        }
        true
    }

    /// Block until a batch is available and take it.
    pub(crate) fn pop(&self, shutdown: &AtomicBool) -> Result<Vec<FlowRecord>, PopError> {
        let mut st = self.state.lock().expect("worker queue poisoned");
        loop {
            if let Some(batch) = st.batches.pop_front() {
                drop(st);
                self.cond.notify_all();
                return Ok(batch);
            }
            if st.done {
                return Err(PopError::Starved);
            }
            if shutdown.load(Ordering::Relaxed) {
                return Err(PopError::ShutDown);
            }
            st = self.cond.wait(st).expect("worker queue poisoned");
        }
    }

    /// Mark the producer done and linger until the consumer drains the queue
    /// (or shutdown cuts the drain short).
    fn finish(&self, shutdown: &AtomicBool) {
        let mut st = self.state.lock().expect("worker queue poisoned");
        st.done = true;
        self.cond.notify_all();
        while !st.batches.is_empty() && !shutdown.load(Ordering::Relaxed) {
            st = self.cond.wait(st).expect("worker queue poisoned");
        }
    }

    /// Wake every waiter. Taken with the queue lock held so a waiter cannot
    /// check the shutdown flag and miss the notification.
    pub(crate) fn wake(&self) {
        let _guard = self.state.lock().expect("worker queue poisoned");
        self.cond.notify_all();
    }
}

/// Timing and bound parameters a producer runs with.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ProducerParams {
    pub seed: u32,
    pub start_time_ms: i64,
    pub end_time_ms: i64,
    pub time_step_ms: i64,
    pub events_per_step: u32,
    pub max_available: usize,
}

/// Handle to one spawned producer.
pub(crate) struct Producer {
    pub name: &'static str,
    pub queue: Arc<WorkerQueue>,
    handle: Option<JoinHandle<()>>,
}

impl Producer {
    pub(crate) fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

pub(crate) fn spawn_producer(
    class_index: usize,
    class: EventClass,
    range: DispatchRange,
    params: ProducerParams,
    ctx: Arc<GenContext>,
    shutdown: Arc<AtomicBool>,
) -> Producer {
    let queue = Arc::new(WorkerQueue::new());
    let name = class.name;
    let thread_queue = Arc::clone(&queue);
    let handle = std::thread::spawn(move || {
        let mut dispatch = DispatchRng::new(params.seed);
        let mut content = StdRng::seed_from_u64(content_seed(params.seed, class_index));
        let mut now = params.start_time_ms;
        let mut events_in_step = 0u32;

        while now <= params.end_time_ms && !shutdown.load(Ordering::Relaxed) {
            let value = dispatch.next_value();
            if range.contains(value) {
                let batch = generate_event(&class, &mut content, &ctx, now);
                if !thread_queue.push(batch, params.max_available, &shutdown) {
                    break;
                }
            }
            // Every drawn value is one event somewhere in the system; the
            // class clock advances with the global event count.
            events_in_step += 1;
            if events_in_step == params.events_per_step {
                events_in_step = 0;
                now += params.time_step_ms;
            }
        }
        thread_queue.finish(&shutdown);
        log::debug!("producer {} finished", class.name);
    });
    Producer {
        name,
        queue,
        handle: Some(handle),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_push_pop_in_order() {
        let queue = WorkerQueue::new();
        let shutdown = AtomicBool::new(false);
        for i in 0..3u32 {
            let rec = FlowRecord {
                packets: i,
                ..FlowRecord::default()
            };
            assert!(queue.push(vec![rec], 8, &shutdown));
        }
        for i in 0..3u32 {
            let batch = queue.pop(&shutdown).unwrap_or_else(|_| panic!("pop {i}"));
            assert_eq!(batch[0].packets, i);
        }
    }

    #[test]
    fn test_pop_after_done_is_starvation() {
        let queue = WorkerQueue::new();
        let shutdown = AtomicBool::new(false);
        queue.push(vec![FlowRecord::default()], 8, &shutdown);
        {
            let mut st = queue.state.lock().unwrap();
            st.done = true;
        }
        assert!(queue.pop(&shutdown).is_ok());
        assert!(matches!(queue.pop(&shutdown), Err(PopError::Starved)));
    }

    #[test]
    fn test_push_respects_bound_until_shutdown() {
        let queue = Arc::new(WorkerQueue::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        assert!(queue.push(vec![FlowRecord::default()], 1, &shutdown));
        // Queue is full; a second push must block until shutdown releases it.
        let q = Arc::clone(&queue);
        let s = Arc::clone(&shutdown);
        let blocked = std::thread::spawn(move || q.push(vec![FlowRecord::default()], 1, &s));
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!blocked.is_finished());

        shutdown.store(true, Ordering::Relaxed);
        queue.wake();
        assert!(!blocked.join().unwrap());
    }

    #[test]
    fn test_content_seed_varies_by_class() {
        let a = content_seed(12345, 0);
        let b = content_seed(12345, 1);
        assert_ne!(a, b);
        assert_eq!(a, content_seed(12345, 0));
    }
}
