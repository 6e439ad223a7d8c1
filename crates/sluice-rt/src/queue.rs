//! Bounded producer/consumer FIFO with an attached free-list.
//!
//! The queue runs in one of two modes, chosen at construction:
//!
//! - **Mutex mode**: a singly-linked list guarded by a `parking_lot`
//!   mutex. Popped nodes go to a free-list and are reused by later
//!   insertions, so steady-state traffic does not allocate.
//! - **Lock-free mode**: a Michael–Scott queue with a dummy head node,
//!   correct for a single producer and a single consumer only. Packet
//!   queues qualify: the producer is the source filter's dispatch call,
//!   the consumer is the destination filter's process task. The
//!   free-list uses the same dummy-head layout.
//!
//! [`FilterQueue::res_add`] refuses to enqueue once the queue holds 50
//! items, which keeps reservoir queues from ballooning during packet
//! bursts.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use parking_lot::Mutex;

/// Reservoir queues refuse new entries past this size.
const RES_MAX_ITEMS: u32 = 50;

struct Node<T> {
    next: AtomicPtr<Node<T>>,
    data: Option<T>,
}

impl<T> Node<T> {
    fn new(data: Option<T>) -> *mut Node<T> {
        Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            data,
        }))
    }
}

/// A linked FIFO guarded by a mutex, with node reuse.
struct LockedInner<T> {
    head: *mut Node<T>,
    tail: *mut Node<T>,
    res_head: *mut Node<T>,
    res_tail: *mut Node<T>,
}

unsafe impl<T: Send> Send for LockedInner<T> {}

/// Michael–Scott SPSC queue state: `head` is a dummy node.
struct LockFree<T> {
    head: AtomicPtr<Node<T>>,
    tail: AtomicPtr<Node<T>>,
    res_head: AtomicPtr<Node<T>>,
    res_tail: AtomicPtr<Node<T>>,
}

unsafe impl<T: Send> Send for LockFree<T> {}
unsafe impl<T: Send> Sync for LockFree<T> {}

enum Mode<T> {
    Locked(Mutex<LockedInner<T>>),
    LockFree(LockFree<T>),
}

/// Bounded FIFO + free-list, see module docs for the two modes.
pub struct FilterQueue<T> {
    mode: Mode<T>,
    nb_items: AtomicU32,
}

impl<T> FilterQueue<T> {
    /// Create a queue. `use_mutex` selects the locked mode; lock-free
    /// mode is only sound for single-producer/single-consumer use.
    pub fn new(use_mutex: bool) -> Self {
        let mode = if use_mutex {
            Mode::Locked(Mutex::new(LockedInner {
                head: ptr::null_mut(),
                tail: ptr::null_mut(),
                res_head: ptr::null_mut(),
                res_tail: ptr::null_mut(),
            }))
        } else {
            Mode::LockFree(LockFree {
                head: AtomicPtr::new(Node::new(None)),
                tail: AtomicPtr::new(ptr::null_mut()),
                res_head: AtomicPtr::new(Node::new(None)),
                res_tail: AtomicPtr::new(ptr::null_mut()),
            })
        };
        let q = FilterQueue {
            mode,
            nb_items: AtomicU32::new(0),
        };
        if let Mode::LockFree(lf) = &q.mode {
            lf.tail.store(lf.head.load(Ordering::Relaxed), Ordering::Relaxed);
            lf.res_tail
                .store(lf.res_head.load(Ordering::Relaxed), Ordering::Relaxed);
        }
        q
    }

    /// Append an item at the tail.
    pub fn add(&self, item: T) {
        match &self.mode {
            Mode::Locked(mx) => {
                let mut q = mx.lock();
                // reuse a free-list node when available
                let node = if !q.res_head.is_null() {
                    let node = q.res_head;
                    unsafe {
                        q.res_head = (*node).next.load(Ordering::Relaxed);
                        (*node).next.store(ptr::null_mut(), Ordering::Relaxed);
                        (*node).data = Some(item);
                    }
                    if q.res_head.is_null() {
                        q.res_tail = ptr::null_mut();
                    }
                    node
                } else {
                    Node::new(Some(item))
                };
                if q.tail.is_null() {
                    q.head = node;
                    q.tail = node;
                } else {
                    unsafe { (*q.tail).next.store(node, Ordering::Relaxed) };
                    q.tail = node;
                }
                self.nb_items.fetch_add(1, Ordering::AcqRel);
            }
            Mode::LockFree(lf) => {
                let node = match lockfree_dequeue_node(&lf.res_head, &lf.res_tail) {
                    Some((node, data)) => {
                        debug_assert!(data.is_none());
                        unsafe {
                            (*node).next.store(ptr::null_mut(), Ordering::Relaxed);
                            (*node).data = Some(item);
                        }
                        node
                    }
                    None => Node::new(Some(item)),
                };
                lockfree_enqueue(node, &lf.tail);
                self.nb_items.fetch_add(1, Ordering::AcqRel);
            }
        }
    }

    /// Remove and return the head item.
    pub fn pop(&self) -> Option<T> {
        match &self.mode {
            Mode::Locked(mx) => {
                let mut q = mx.lock();
                if q.head.is_null() {
                    return None;
                }
                let node = q.head;
                let data = unsafe {
                    q.head = (*node).next.load(Ordering::Relaxed);
                    (*node).next.store(ptr::null_mut(), Ordering::Relaxed);
                    (*node).data.take()
                };
                if q.head.is_null() {
                    q.tail = ptr::null_mut();
                }
                // park the node on the free-list
                if q.res_tail.is_null() {
                    q.res_head = node;
                    q.res_tail = node;
                } else {
                    unsafe { (*q.res_tail).next.store(node, Ordering::Relaxed) };
                    q.res_tail = node;
                }
                self.nb_items.fetch_sub(1, Ordering::AcqRel);
                data
            }
            Mode::LockFree(lf) => {
                let (slot, data) = lockfree_dequeue_node(&lf.head, &lf.tail)?;
                let data = data?;
                self.nb_items.fetch_sub(1, Ordering::AcqRel);
                unsafe {
                    (*slot).data = None;
                    (*slot).next.store(ptr::null_mut(), Ordering::Relaxed);
                }
                lockfree_enqueue(slot, &lf.res_tail);
                Some(data)
            }
        }
    }

    /// Number of queued items (`add`s minus `pop`s).
    pub fn count(&self) -> u32 {
        self.nb_items.load(Ordering::Acquire)
    }

    /// Enqueue into a reservoir, refusing past the cap. Returns `false`
    /// (and drops the item) when the reservoir is full.
    pub fn res_add(&self, item: T) -> bool {
        if self.count() >= RES_MAX_ITEMS {
            return false;
        }
        self.add(item);
        true
    }

    /// Run `f` on the head item without removing it.
    ///
    /// In lock-free mode this is only meaningful from the consumer
    /// thread, which is the only thread allowed to retire the head.
    pub fn peek_head<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.peek(0, f)
    }

    /// Run `f` on the item at position `idx` from the head.
    pub fn peek<R>(&self, idx: u32, f: impl FnOnce(&T) -> R) -> Option<R> {
        match &self.mode {
            Mode::Locked(mx) => {
                let q = mx.lock();
                let mut it = q.head;
                let mut idx = idx;
                while !it.is_null() && idx > 0 {
                    it = unsafe { (*it).next.load(Ordering::Relaxed) };
                    idx -= 1;
                }
                if it.is_null() {
                    None
                } else {
                    unsafe { (*it).data.as_ref().map(f) }
                }
            }
            Mode::LockFree(lf) => {
                let head = lf.head.load(Ordering::Acquire);
                let mut it = unsafe { (*head).next.load(Ordering::Acquire) };
                let mut idx = idx;
                while !it.is_null() && idx > 0 {
                    it = unsafe { (*it).next.load(Ordering::Acquire) };
                    idx -= 1;
                }
                if it.is_null() {
                    None
                } else {
                    unsafe { (*it).data.as_ref().map(f) }
                }
            }
        }
    }
}

impl<T: Clone> FilterQueue<T> {
    /// Peek the head item without removing it.
    pub fn head(&self) -> Option<T> {
        self.get(0)
    }

    /// Peek the item at position `idx` from the head.
    ///
    /// In lock-free mode this walks live links and is only meaningful
    /// from the consumer thread.
    pub fn get(&self, idx: u32) -> Option<T> {
        match &self.mode {
            Mode::Locked(mx) => {
                let q = mx.lock();
                let mut it = q.head;
                let mut idx = idx;
                while !it.is_null() && idx > 0 {
                    it = unsafe { (*it).next.load(Ordering::Relaxed) };
                    idx -= 1;
                }
                if it.is_null() {
                    None
                } else {
                    unsafe { (*it).data.clone() }
                }
            }
            Mode::LockFree(lf) => {
                let head = lf.head.load(Ordering::Acquire);
                let mut it = unsafe { (*head).next.load(Ordering::Acquire) };
                let mut idx = idx;
                while !it.is_null() && idx > 0 {
                    it = unsafe { (*it).next.load(Ordering::Acquire) };
                    idx -= 1;
                }
                if it.is_null() {
                    None
                } else {
                    unsafe { (*it).data.clone() }
                }
            }
        }
    }

    /// Visit every queued item in order.
    pub fn for_each(&self, mut f: impl FnMut(&T)) {
        match &self.mode {
            Mode::Locked(mx) => {
                let q = mx.lock();
                let mut it = q.head;
                while !it.is_null() {
                    unsafe {
                        if let Some(data) = &(*it).data {
                            f(data);
                        }
                        it = (*it).next.load(Ordering::Relaxed);
                    }
                }
            }
            Mode::LockFree(lf) => {
                let head = lf.head.load(Ordering::Acquire);
                let mut it = unsafe { (*head).next.load(Ordering::Acquire) };
                while !it.is_null() {
                    unsafe {
                        if let Some(data) = &(*it).data {
                            f(data);
                        }
                        it = (*it).next.load(Ordering::Acquire);
                    }
                }
            }
        }
    }
}

/// Enqueue `node` after the tail, fixing up a lagging tail pointer.
fn lockfree_enqueue<T>(node: *mut Node<T>, tail_ptr: &AtomicPtr<Node<T>>) {
    let mut tail;
    loop {
        tail = tail_ptr.load(Ordering::Acquire);
        let next = unsafe { (*tail).next.load(Ordering::Acquire) };
        if next.is_null() {
            if unsafe {
                (*tail)
                    .next
                    .compare_exchange(ptr::null_mut(), node, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            } {
                break;
            }
        } else {
            // tail not pointing at the last node, move it along
            let _ = tail_ptr.compare_exchange(tail, next, Ordering::AcqRel, Ordering::Acquire);
        }
    }
    let _ = tail_ptr.compare_exchange(tail, node, Ordering::AcqRel, Ordering::Acquire);
}

/// Dequeue past the dummy head. Returns the retired head node (which
/// becomes the new dummy's predecessor) and the dequeued payload.
fn lockfree_dequeue_node<T>(
    head_ptr: &AtomicPtr<Node<T>>,
    tail_ptr: &AtomicPtr<Node<T>>,
) -> Option<(*mut Node<T>, Option<T>)> {
    loop {
        let head = head_ptr.load(Ordering::Acquire);
        let tail = tail_ptr.load(Ordering::Acquire);
        let next = unsafe { (*head).next.load(Ordering::Acquire) };
        if head != head_ptr.load(Ordering::Acquire) {
            continue;
        }
        if head == tail {
            // first slot is dummy, an empty next means an empty queue
            if next.is_null() {
                return None;
            }
            let _ = tail_ptr.compare_exchange(tail, next, Ordering::AcqRel, Ordering::Acquire);
        } else {
            debug_assert!(!next.is_null());
            let data = unsafe { (*next).data.take() };
            if head_ptr
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some((head, data));
            }
            // lost the race: put the payload back for the winner
            unsafe { (*next).data = data };
        }
    }
}

impl<T> Drop for FilterQueue<T> {
    fn drop(&mut self) {
        unsafe fn free_chain<T>(mut it: *mut Node<T>) {
            while !it.is_null() {
                let node = unsafe { Box::from_raw(it) };
                it = node.next.load(Ordering::Relaxed);
            }
        }
        match &mut self.mode {
            Mode::Locked(mx) => {
                let q = mx.get_mut();
                unsafe {
                    free_chain(q.head);
                    free_chain(q.res_head);
                }
            }
            Mode::LockFree(lf) => unsafe {
                free_chain(lf.head.load(Ordering::Relaxed));
                free_chain(lf.res_head.load(Ordering::Relaxed));
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn locked_fifo_order() {
        let q = FilterQueue::new(true);
        for i in 0..10 {
            q.add(i);
        }
        assert_eq!(q.count(), 10);
        for i in 0..10 {
            assert_eq!(q.pop(), Some(i));
        }
        assert_eq!(q.pop(), None);
        assert_eq!(q.count(), 0);
    }

    #[test]
    fn lockfree_fifo_order() {
        let q = FilterQueue::new(false);
        for i in 0..10 {
            q.add(i);
        }
        assert_eq!(q.count(), 10);
        for i in 0..10 {
            assert_eq!(q.pop(), Some(i));
        }
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn node_reuse_keeps_count_consistent() {
        let q = FilterQueue::new(true);
        for round in 0..5 {
            for i in 0..20 {
                q.add(round * 100 + i);
            }
            for i in 0..20 {
                assert_eq!(q.pop(), Some(round * 100 + i));
            }
        }
        assert_eq!(q.count(), 0);
    }

    #[test]
    fn head_and_get() {
        for use_mutex in [true, false] {
            let q = FilterQueue::new(use_mutex);
            q.add("a");
            q.add("b");
            q.add("c");
            assert_eq!(q.head(), Some("a"));
            assert_eq!(q.get(1), Some("b"));
            assert_eq!(q.get(2), Some("c"));
            assert_eq!(q.get(3), None);
            // head() does not consume
            assert_eq!(q.pop(), Some("a"));
        }
    }

    #[test]
    fn for_each_visits_in_order() {
        let q = FilterQueue::new(true);
        q.add(1);
        q.add(2);
        q.add(3);
        let mut seen = Vec::new();
        q.for_each(|v| seen.push(*v));
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn peek_does_not_consume() {
        for use_mutex in [true, false] {
            let q: FilterQueue<Box<u32>> = FilterQueue::new(use_mutex);
            assert_eq!(q.peek_head(|v| **v), None);
            q.add(Box::new(7));
            q.add(Box::new(8));
            assert_eq!(q.peek_head(|v| **v), Some(7));
            assert_eq!(q.peek(1, |v| **v), Some(8));
            assert_eq!(q.count(), 2);
            assert_eq!(*q.pop().unwrap(), 7);
        }
    }

    #[test]
    fn res_add_caps_at_fifty() {
        let q = FilterQueue::new(true);
        for i in 0..50 {
            assert!(q.res_add(i), "item {i} should be accepted");
        }
        assert!(!q.res_add(50));
        assert_eq!(q.count(), 50);
    }

    #[test]
    fn lockfree_spsc_threads() {
        let q = Arc::new(FilterQueue::new(false));
        let producer = {
            let q = Arc::clone(&q);
            std::thread::spawn(move || {
                for i in 0..10_000u32 {
                    q.add(i);
                }
            })
        };
        let consumer = {
            let q = Arc::clone(&q);
            std::thread::spawn(move || {
                let mut expect = 0u32;
                while expect < 10_000 {
                    if let Some(v) = q.pop() {
                        assert_eq!(v, expect);
                        expect += 1;
                    } else {
                        std::hint::spin_loop();
                    }
                }
            })
        };
        producer.join().unwrap();
        consumer.join().unwrap();
        assert_eq!(q.count(), 0);
    }
}
