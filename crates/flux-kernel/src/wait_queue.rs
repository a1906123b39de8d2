//! Delayed re-enqueue: a process-wide min-heap keyed by wakeup time.
//!
//! Used by the scheduler to defer a denied task for a short backoff, and
//! available to callers in `flux-nyx` for any other short, one-shot delay.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use std::sync::Mutex;

use tokio::task::JoinHandle;

/// A queued callable plus the unix-millis timestamp at which it should fire.
struct Entry {
    wake_at_millis: i64,
    seq: u64,
    process: Box<dyn FnOnce() + Send>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.wake_at_millis == other.wake_at_millis && self.seq == other.seq
    }
}
impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // `BinaryHeap` is a max-heap; reverse so the earliest wakeup sorts
        // highest, with insertion order as a stable tie-break.
        other
            .wake_at_millis
            .cmp(&self.wake_at_millis)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Inner {
    heap: Mutex<BinaryHeap<Entry>>,
    next_seq: std::sync::atomic::AtomicU64,
}

/// A background-ticked delay queue.
#[derive(Clone)]
pub struct WaitQueue {
    inner: Arc<Inner>,
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                heap: Mutex::new(BinaryHeap::new()),
                next_seq: std::sync::atomic::AtomicU64::new(0),
            }),
        }
    }

    /// Schedules `process` to run (on a fresh task) after `delay`.
    pub fn add(&self, delay: Duration, process: impl FnOnce() + Send + 'static) {
        let wake_at_millis = now_millis() + delay.as_millis() as i64;
        let seq = self
            .inner
            .next_seq
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.inner.heap.lock().unwrap().push(Entry {
            wake_at_millis,
            seq,
            process: Box::new(process),
        });
    }

    /// Spawns the 50ms tick loop. Runs until the returned handle is aborted.
    pub fn start(&self) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(50)).await;
                let due = {
                    let mut heap = inner.heap.lock().unwrap();
                    let mut due = Vec::new();
                    let now = now_millis();
                    while let Some(top) = heap.peek() {
                        if top.wake_at_millis > now {
                            break;
                        }
                        due.push(heap.pop().unwrap());
                    }
                    due
                };
                for entry in due {
                    tokio::spawn(async move { (entry.process)() });
                }
            }
        })
    }
}

fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
