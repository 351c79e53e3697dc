/*!
 * Delay Heap
 * Indexed binary min-heap of scheduled tasks with leader-follower waits
 *
 * One queued mutex guards the whole structure; the `available`
 * condition wakes takers when a new head arrives. Every sift updates
 * the moved task's heap index, so cancellation locates its victim in
 * O(1) and removes in O(log n).
 *
 * Leader-follower: exactly one thread performs the timed wait for the
 * current head; the rest wait untimed and rotate in when the leader
 * returns or an earlier head invalidates it.
 */

use std::sync::Arc;

use crate::core::{Nanos, SyncResult};
use crate::sync::parker;
use crate::sync::{Mutex, MutexCondition};

use super::task::ScheduledTask;

const INITIAL_CAPACITY: usize = 16;

struct HeapCore {
    tasks: Vec<Arc<ScheduledTask>>,
    /// Parker id of the thread doing the timed wait for the head.
    leader: Option<u64>,
}

pub(crate) struct DelayHeap {
    lock: Mutex<HeapCore>,
    available: MutexCondition,
}

impl DelayHeap {
    pub(crate) fn new() -> Self {
        let lock = Mutex::new(HeapCore {
            tasks: Vec::with_capacity(INITIAL_CAPACITY),
            leader: None,
        });
        let available = lock.new_condition();
        Self { lock, available }
    }

    /// Insert a task; if it became the new head, invalidate the
    /// leader and wake one taker to re-evaluate its wait.
    pub(crate) fn offer(&self, task: Arc<ScheduledTask>) {
        let mut heap = self.lock.lock();
        if heap.tasks.len() == heap.tasks.capacity() {
            // grow by 50%
            let grow = (heap.tasks.capacity() / 2).max(1);
            heap.tasks.reserve_exact(grow);
        }
        let k = heap.tasks.len();
        heap.tasks.push(Arc::clone(&task));
        sift_up(&mut heap.tasks, k);
        if Arc::ptr_eq(&heap.tasks[0], &task) {
            heap.leader = None;
            let _ = self.available.signal();
        }
    }

    /// Remove and return the head if it is due; `None` otherwise.
    pub(crate) fn poll(&self) -> Option<Arc<ScheduledTask>> {
        let mut heap = self.lock.lock();
        match heap.tasks.first() {
            Some(first) if first.delay_nanos() <= 0 => {
                let first = Arc::clone(first);
                Some(finish_poll(&mut heap, first))
            }
            _ => None,
        }
    }

    /// Block until the head becomes due, then remove and return it.
    pub(crate) fn take(&self) -> SyncResult<Arc<ScheduledTask>> {
        let mut heap = self.lock.lock_interruptibly()?;
        let result = loop {
            if heap.tasks.is_empty() {
                if let Err(err) = self.available.wait(&mut heap) {
                    break Err(err);
                }
            } else {
                let first = Arc::clone(&heap.tasks[0]);
                let delay = first.delay_nanos();
                if delay <= 0 {
                    break Ok(finish_poll(&mut heap, first));
                }
                drop(first); // don't retain the head while waiting
                if heap.leader.is_some() {
                    if let Err(err) = self.available.wait(&mut heap) {
                        break Err(err);
                    }
                } else {
                    let me = parker::current().id();
                    heap.leader = Some(me);
                    let waited = self.available.wait_nanos(&mut heap, delay);
                    if heap.leader == Some(me) {
                        heap.leader = None;
                    }
                    if let Err(err) = waited {
                        break Err(err);
                    }
                }
            }
        };
        if heap.leader.is_none() && !heap.tasks.is_empty() {
            let _ = self.available.signal();
        }
        result
    }

    /// Timed take; `Ok(None)` when the budget runs out first.
    pub(crate) fn poll_deadline(&self, mut nanos: Nanos) -> SyncResult<Option<Arc<ScheduledTask>>> {
        let mut heap = self.lock.lock_interruptibly()?;
        let result = loop {
            if heap.tasks.is_empty() {
                if nanos <= 0 {
                    break Ok(None);
                }
                match self.available.wait_nanos(&mut heap, nanos) {
                    Ok(remaining) => nanos = remaining,
                    Err(err) => break Err(err),
                }
            } else {
                let first = Arc::clone(&heap.tasks[0]);
                let delay = first.delay_nanos();
                if delay <= 0 {
                    break Ok(Some(finish_poll(&mut heap, first)));
                }
                if nanos <= 0 {
                    break Ok(None);
                }
                drop(first);
                if nanos < delay || heap.leader.is_some() {
                    match self.available.wait_nanos(&mut heap, nanos) {
                        Ok(remaining) => nanos = remaining,
                        Err(err) => break Err(err),
                    }
                } else {
                    let me = parker::current().id();
                    heap.leader = Some(me);
                    let waited = self.available.wait_nanos(&mut heap, delay);
                    if heap.leader == Some(me) {
                        heap.leader = None;
                    }
                    match waited {
                        Ok(time_left) => nanos -= delay - time_left,
                        Err(err) => break Err(err),
                    }
                }
            }
        };
        if heap.leader.is_none() && !heap.tasks.is_empty() {
            let _ = self.available.signal();
        }
        result
    }

    /// Remove an arbitrary task. The carried heap index makes the
    /// common case O(1) to locate; a stale index falls back to a
    /// linear scan.
    pub(crate) fn remove(&self, task: &ScheduledTask) -> bool {
        let mut heap = self.lock.lock();
        let index = {
            let hinted = task.heap_index();
            let by_hint = hinted >= 0
                && (hinted as usize) < heap.tasks.len()
                && std::ptr::eq(
                    Arc::as_ptr(&heap.tasks[hinted as usize]),
                    task as *const ScheduledTask,
                );
            if by_hint {
                hinted as usize
            } else {
                match heap
                    .tasks
                    .iter()
                    .position(|t| std::ptr::eq(Arc::as_ptr(t), task as *const ScheduledTask))
                {
                    Some(i) => i,
                    None => return false,
                }
            }
        };

        heap.tasks[index].set_heap_index(-1);
        let last_index = heap.tasks.len() - 1;
        let replacement = match heap.tasks.pop() {
            Some(t) => t,
            None => return false,
        };
        if last_index != index {
            let replacement_raw = Arc::as_ptr(&replacement);
            heap.tasks[index] = replacement;
            sift_down(&mut heap.tasks, index);
            if std::ptr::eq(Arc::as_ptr(&heap.tasks[index]), replacement_raw) {
                sift_up(&mut heap.tasks, index);
            }
        }
        true
    }

    /// Current head without removing it.
    pub(crate) fn peek(&self) -> Option<Arc<ScheduledTask>> {
        self.lock.lock().tasks.first().cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock.lock().tasks.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.lock.lock().tasks.is_empty()
    }

    /// Read-mostly copy for inspection; iteration order is heap
    /// order, not execution order.
    pub(crate) fn snapshot(&self) -> Vec<Arc<ScheduledTask>> {
        self.lock.lock().tasks.clone()
    }

    /// Empty the heap, returning everything that was queued.
    pub(crate) fn drain(&self) -> Vec<Arc<ScheduledTask>> {
        let mut heap = self.lock.lock();
        heap.leader = None;
        let drained = std::mem::take(&mut heap.tasks);
        for task in &drained {
            task.set_heap_index(-1);
        }
        drained
    }
}

/// Bubble the entry at `k` up to its heap-ordered slot, maintaining
/// heap indices on every move.
fn sift_up(tasks: &mut [Arc<ScheduledTask>], mut k: usize) {
    let key = Arc::clone(&tasks[k]);
    while k > 0 {
        let parent = (k - 1) >> 1;
        if !key.precedes(&tasks[parent]) {
            break;
        }
        tasks[k] = Arc::clone(&tasks[parent]);
        tasks[k].set_heap_index(k as i64);
        k = parent;
    }
    key.set_heap_index(k as i64);
    tasks[k] = key;
}

/// Sink the entry at `k` down to its heap-ordered slot.
fn sift_down(tasks: &mut [Arc<ScheduledTask>], mut k: usize) {
    let n = tasks.len();
    let key = Arc::clone(&tasks[k]);
    let half = n >> 1;
    while k < half {
        let mut child = (k << 1) + 1;
        let right = child + 1;
        if right < n && tasks[right].precedes(&tasks[child]) {
            child = right;
        }
        if !tasks[child].precedes(&key) {
            break;
        }
        tasks[k] = Arc::clone(&tasks[child]);
        tasks[k].set_heap_index(k as i64);
        k = child;
    }
    key.set_heap_index(k as i64);
    tasks[k] = key;
}

/// Detach the head: move the last entry to the root and restore heap
/// order. The removed task's index is reset to −1.
fn finish_poll(heap: &mut HeapCore, task: Arc<ScheduledTask>) -> Arc<ScheduledTask> {
    if let Some(last) = heap.tasks.pop() {
        if !heap.tasks.is_empty() {
            heap.tasks[0] = last;
            sift_down(&mut heap.tasks, 0);
        }
    }
    task.set_heap_index(-1);
    task
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::clock;
    use crate::sched::task::Payload;
    use std::sync::Weak;

    fn task_due_in(ms: i64, sequence: u64) -> Arc<ScheduledTask> {
        let payload: Payload = Box::new(|| {});
        ScheduledTask::new(
            Weak::new(),
            payload,
            clock::now_nanos() + ms * 1_000_000,
            0,
            sequence,
        )
    }

    #[test]
    fn test_offer_orders_by_trigger() {
        let heap = DelayHeap::new();
        heap.offer(task_due_in(300, 0));
        heap.offer(task_due_in(100, 1));
        heap.offer(task_due_in(200, 2));
        assert_eq!(heap.len(), 3);
        assert_eq!(heap.peek().unwrap().sequence(), 1);
    }

    #[test]
    fn test_heap_index_matches_position() {
        let heap = DelayHeap::new();
        for i in 0..20 {
            heap.offer(task_due_in(((i * 37) % 11) * 50, i as u64));
        }
        for (position, task) in heap.snapshot().iter().enumerate() {
            assert_eq!(task.heap_index(), position as i64);
        }
    }

    #[test]
    fn test_fifo_tiebreak_by_sequence() {
        let heap = DelayHeap::new();
        let trigger = clock::now_nanos() - 1_000_000; // already due
        for sequence in [2u64, 0, 1] {
            let payload: Payload = Box::new(|| {});
            heap.offer(ScheduledTask::new(Weak::new(), payload, trigger, 0, sequence));
        }
        assert_eq!(heap.poll().unwrap().sequence(), 0);
        assert_eq!(heap.poll().unwrap().sequence(), 1);
        assert_eq!(heap.poll().unwrap().sequence(), 2);
        assert!(heap.poll().is_none());
    }

    #[test]
    fn test_poll_ignores_undue_head() {
        let heap = DelayHeap::new();
        heap.offer(task_due_in(10_000, 0));
        assert!(heap.poll().is_none());
        assert_eq!(heap.len(), 1);
    }

    #[test]
    fn test_take_returns_due_head() {
        let heap = DelayHeap::new();
        let task = task_due_in(-5, 7);
        heap.offer(Arc::clone(&task));
        let taken = heap.take().unwrap();
        assert!(Arc::ptr_eq(&taken, &task));
        assert_eq!(taken.heap_index(), -1);
        assert!(heap.is_empty());
    }

    #[test]
    fn test_remove_keeps_invariants() {
        let heap = DelayHeap::new();
        let tasks: Vec<_> = (0..9).map(|i| task_due_in(i * 100, i as u64)).collect();
        for task in &tasks {
            heap.offer(Arc::clone(task));
        }

        assert!(heap.remove(&tasks[4]));
        assert_eq!(tasks[4].heap_index(), -1);
        assert!(!heap.remove(&tasks[4]));
        assert_eq!(heap.len(), 8);
        for (position, task) in heap.snapshot().iter().enumerate() {
            assert_eq!(task.heap_index(), position as i64);
        }
    }

    #[test]
    fn test_drain_resets_indices() {
        let heap = DelayHeap::new();
        for i in 0..4 {
            heap.offer(task_due_in(i * 100, i as u64));
        }
        let drained = heap.drain();
        assert_eq!(drained.len(), 4);
        assert!(heap.is_empty());
        for task in &drained {
            assert_eq!(task.heap_index(), -1);
        }
    }
}
