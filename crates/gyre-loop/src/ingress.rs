// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Chunked ingress queue.
//!
//! Multi-producer FIFO of tasks stored in a chain of fixed-capacity
//! chunks. Drained chunks hand their storage back to a per-queue pool,
//! so steady-state push/pop cycles allocate nothing once warmed up.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::task::Task;

pub(crate) const MIN_CHUNK_SIZE: usize = 16;
pub(crate) const MAX_CHUNK_SIZE: usize = 4096;
pub(crate) const DEFAULT_CHUNK_SIZE: usize = 16;

/// Effective chunk capacity for a requested size: non-positive requests
/// take the default; everything else is clamped to `[16, 4096]` and
/// rounded down to a power of two (50 becomes 32, not 64).
pub(crate) fn effective_chunk_size(requested: i64) -> usize {
    if requested <= 0 {
        return DEFAULT_CHUNK_SIZE;
    }
    let clamped = (requested as usize).clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);
    1usize << (usize::BITS - 1 - clamped.leading_zeros())
}

/// One fixed-capacity segment of the queue. `read..write` is the live
/// window.
struct Chunk {
    slots: Box<[Option<Task>]>,
    read: usize,
    write: usize,
}

impl Chunk {
    fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots: slots.into_boxed_slice(),
            read: 0,
            write: 0,
        }
    }

    fn reset(&mut self) {
        self.read = 0;
        self.write = 0;
    }

    fn is_full(&self) -> bool {
        self.write == self.slots.len()
    }

    fn is_drained(&self) -> bool {
        self.read == self.write
    }
}

struct Inner {
    /// Front chunk is the pop side, back chunk the push side.
    chunks: VecDeque<Chunk>,
    pool: Vec<Chunk>,
    len: usize,
    /// Lifetime count of fresh chunk allocations, for the steady-state
    /// zero-allocation property.
    allocated: usize,
}

impl Inner {
    fn acquire_chunk(&mut self, capacity: usize) -> Chunk {
        match self.pool.pop() {
            Some(mut chunk) => {
                chunk.reset();
                chunk
            }
            None => {
                self.allocated += 1;
                Chunk::new(capacity)
            }
        }
    }
}

/// Multi-producer, single-consumer chunked FIFO.
pub(crate) struct ChunkedQueue {
    inner: Mutex<Inner>,
    chunk_size: usize,
}

impl ChunkedQueue {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                chunks: VecDeque::new(),
                pool: Vec::new(),
                len: 0,
                allocated: 0,
            }),
            chunk_size,
        }
    }

    /// Append a task. Any thread.
    pub fn push(&self, task: Task) {
        let mut inner = self.inner.lock().unwrap();
        let needs_chunk = match inner.chunks.back() {
            Some(tail) => tail.is_full(),
            None => true,
        };
        if needs_chunk {
            let chunk = inner.acquire_chunk(self.chunk_size);
            inner.chunks.push_back(chunk);
        }
        let tail = inner.chunks.back_mut().unwrap();
        let idx = tail.write;
        tail.slots[idx] = Some(task);
        tail.write += 1;
        inner.len += 1;
    }

    /// Pop the oldest task. Loop thread only.
    pub fn pop(&self) -> Option<Task> {
        let mut inner = self.inner.lock().unwrap();
        Self::pop_locked(&mut inner)
    }

    fn pop_locked(inner: &mut Inner) -> Option<Task> {
        loop {
            let chunk_count = inner.chunks.len();
            let head = inner.chunks.front_mut()?;
            if !head.is_drained() {
                let task = head.slots[head.read].take();
                head.read += 1;
                inner.len -= 1;
                return task;
            }
            if head.is_full() || chunk_count > 1 {
                // Exhausted chunk: return its storage to the pool and
                // check the successor, which may itself be empty.
                let chunk = inner.chunks.pop_front().unwrap();
                inner.pool.push(chunk);
                continue;
            }
            // Sole, partially-filled, fully-drained chunk: rewind it so
            // the window never runs off the end.
            head.reset();
            return None;
        }
    }

    /// Pop up to `max` tasks into `buf` under one lock acquisition.
    /// Returns the number popped.
    pub fn pop_batch(&self, buf: &mut Vec<Task>, max: usize) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let mut popped = 0;
        while popped < max {
            match Self::pop_locked(&mut inner) {
                Some(task) => {
                    buf.push(task);
                    popped += 1;
                }
                None => break,
            }
        }
        popped
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lifetime chunk allocations. Stable across warmed-up push/pop
    /// cycles.
    pub fn allocated_chunks(&self) -> usize {
        self.inner.lock().unwrap().allocated
    }
}
