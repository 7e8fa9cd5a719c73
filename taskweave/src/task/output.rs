use crate::error::PoolError;
use crate::pool::LfIndexedPool;
use crate::task::{AsyncTask, TaskStatus};
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// Edges stored per output chunk.
pub(crate) const OUTPUT_CHUNK_CAPACITY: usize = 15;

pub(crate) type OutputPool = LfIndexedPool<OutputChunk>;

/// "`task` waits on me through bit `bit`".
pub(crate) struct Edge {
    pub(crate) task: AsyncTask,
    pub(crate) bit: u8,
    pub(crate) strong: bool,
}

/// Fixed-capacity block of edges, linked through pool indices.
pub(crate) struct OutputChunk {
    edges: [Option<Edge>; OUTPUT_CHUNK_CAPACITY],
    len: u8,
    next: Option<u32>,
    index: u32,
}

impl Default for OutputChunk {
    fn default() -> Self {
        Self {
            edges: std::array::from_fn(|_| None),
            len: 0,
            next: None,
            index: u32::MAX,
        }
    }
}

impl OutputChunk {
    fn is_full(&self) -> bool {
        self.len as usize == OUTPUT_CHUNK_CAPACITY
    }

    fn push(&mut self, edge: Edge) {
        debug_assert!(!self.is_full());
        self.edges[self.len as usize] = Some(edge);
        self.len += 1;
    }
}

/// Result of trying to record an edge on a predecessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AddOutput {
    Recorded,
    /// The predecessor had already finished, nothing was recorded.
    Finished(TaskStatus),
}

/// Head of a task's output chunk list. Lives behind the task's output lock.
#[derive(Default)]
pub(crate) struct OutputList {
    head: Option<u32>,

    // Kept while chunks are linked so a task dropped before finishing can
    // still hand them back.
    pool: Option<Arc<OutputPool>>,
}

impl OutputList {
    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Appends `edge` unless the owning task already finished.
    ///
    /// `status` is read by the caller while holding the output lock, which
    /// orders it against `release`: a finishing task publishes its terminal
    /// status before it takes the lock to walk its edges.
    pub(crate) fn add(
        &mut self,
        pool: &Arc<OutputPool>,
        status: TaskStatus,
        edge: Edge,
    ) -> Result<AddOutput, PoolError> {
        if status.is_finished() {
            return Ok(AddOutput::Finished(status));
        }

        let mut cursor = self.head;
        while let Some(index) = cursor {
            // Safety: linked chunks are only touched under the output lock.
            let chunk = unsafe { pool.get_unchecked_mut(index) };

            if !chunk.is_full() {
                chunk.push(edge);
                return Ok(AddOutput::Recorded);
            }

            cursor = chunk.next;
        }

        let index = pool.assign_with(OutputChunk::default)?;

        // Safety: freshly assigned, not yet linked anywhere.
        let chunk = unsafe { pool.get_unchecked_mut(index) };
        debug_assert_eq!(chunk.len, 0);

        chunk.index = index;
        chunk.next = self.head;
        chunk.push(edge);

        self.head = Some(index);
        self.pool.get_or_insert_with(|| pool.clone());

        Ok(AddOutput::Recorded)
    }

    /// Drops every edge recorded for `task` and returns how many were found.
    ///
    /// Chunks stay linked even when emptied, they go back to the pool on
    /// `release`.
    pub(crate) fn unlink(&mut self, task: &AsyncTask) -> usize {
        let Some(pool) = self.pool.as_ref() else {
            return 0;
        };

        let mut removed = 0;
        let mut cursor = self.head;

        while let Some(index) = cursor {
            // Safety: linked chunks are only touched under the output lock.
            let chunk = unsafe { pool.get_unchecked_mut(index) };
            let mut kept = 0;

            for i in 0..chunk.len as usize {
                match chunk.edges[i].take() {
                    Some(edge) if edge.task.ptr_eq(task) => removed += 1,
                    Some(edge) => {
                        chunk.edges[kept] = Some(edge);
                        kept += 1;
                    }
                    None => {}
                }
            }

            chunk.len = kept as u8;
            cursor = chunk.next;
        }

        removed
    }

    /// Notifies every recorded dependent and returns all chunks to the pool.
    ///
    /// For each edge the canceled counter is bumped *before* the wait bit is
    /// cleared, so a puller that observes the cleared bit also observes the
    /// cancellation. Returns the number of edges visited.
    pub(crate) fn release(&mut self, canceled: bool) -> usize {
        let Some(pool) = self.pool.take() else {
            debug_assert!(self.head.is_none());
            return 0;
        };

        let mut visited = 0;
        let mut cursor = self.head.take();

        while let Some(index) = cursor {
            // Safety: unlinking under the output lock, nobody else holds it.
            let chunk = unsafe { pool.get_unchecked_mut(index) };
            debug_assert_eq!(chunk.index, index);

            for slot in chunk.edges[..chunk.len as usize].iter_mut() {
                let Some(edge) = slot.take() else {
                    continue;
                };

                let core = &edge.task.0;
                if canceled && edge.strong {
                    core.canceled_deps.fetch_add(1, Ordering::Relaxed);
                }
                core.wait_bits.fetch_and(!(1u64 << edge.bit), Ordering::Release);
                visited += 1;
            }

            chunk.len = 0;
            cursor = chunk.next.take();

            let unassigned = pool.unassign(index);
            debug_assert!(unassigned, "output chunk {index} released twice");
        }

        visited
    }
}
