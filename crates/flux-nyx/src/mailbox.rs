//! Priority mailbox: a max-heap by integer priority with FIFO tie-break,
//! used by every actor in this crate as its inbox.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Mutex;

use crate::mail::Mail;

/// Wraps a [`Mail`] with an insertion sequence so that `BinaryHeap`
/// (a max-heap) breaks priority ties in FIFO order — the earliest-inserted
/// mail among equal priorities pops first.
struct Entry {
    mail: Mail,
    seq: u64,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.mail.priority == other.mail.priority && self.seq == other.seq
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
        // Higher priority pops first; among equal priorities, lower seq
        // (earlier insertion) pops first — so invert seq ordering.
        self.mail
            .priority
            .cmp(&other.mail.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// A max-heap by priority, FIFO within a priority.
pub struct Mailbox {
    heap: Mutex<BinaryHeap<Entry>>,
    next_seq: Mutex<u64>,
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Mailbox {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            next_seq: Mutex::new(0),
        }
    }

    /// Pushes `mail` onto the heap. Never blocks.
    pub fn add(&self, mail: Mail) {
        let seq = {
            let mut next = self.next_seq.lock().unwrap();
            let seq = *next;
            *next += 1;
            seq
        };
        self.heap.lock().unwrap().push(Entry { mail, seq });
    }

    /// Returns the highest-priority mail without removing it.
    pub fn peek(&self) -> Option<Mail> {
        self.heap.lock().unwrap().peek().map(|e| e.mail.clone())
    }

    /// Removes and returns the highest-priority mail.
    pub fn pop(&self) -> Option<Mail> {
        self.heap.lock().unwrap().pop().map(|e| e.mail)
    }

    pub fn size(&self) -> usize {
        self.heap.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }
}
