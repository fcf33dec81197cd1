//! Intrusive lock-free LIFO.
//!
//! Nodes carry their own next pointer, so pushing never allocates.
//! Multi-producer, single-consumer: the cleanup services are the only
//! poppers of their queues, which is what makes the unsynchronized read
//! of a popped node's next pointer sound.

use alloc::sync::Arc;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

/// A type that embeds the LIFO link.
pub trait LifoNode: Sized {
    fn lifo_next(&self) -> &AtomicPtr<Self>;
}

pub struct AtomicLifo<T: LifoNode> {
    head: AtomicPtr<T>,
}

impl<T: LifoNode> AtomicLifo<T> {
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Push from any context, including interrupt handlers.
    pub fn push(&self, item: Arc<T>) {
        let raw = Arc::into_raw(item) as *mut T;
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            unsafe { (*raw).lifo_next().store(head, Ordering::Relaxed) };
            match self
                .head
                .compare_exchange_weak(head, raw, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    /// Pop the most recently pushed item. Single consumer only.
    pub fn pop(&self) -> Option<Arc<T>> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            if head.is_null() {
                return None;
            }
            let next = unsafe { (*head).lifo_next().load(Ordering::Relaxed) };
            match self
                .head
                .compare_exchange_weak(head, next, Ordering::Acquire, Ordering::Acquire)
            {
                Ok(_) => {
                    let item = unsafe { Arc::from_raw(head) };
                    item.lifo_next().store(ptr::null_mut(), Ordering::Relaxed);
                    return Some(item);
                }
                Err(current) => head = current,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Node {
        value: u32,
        next: AtomicPtr<Node>,
    }

    impl Node {
        fn new(value: u32) -> Arc<Node> {
            Arc::new(Node {
                value,
                next: AtomicPtr::new(ptr::null_mut()),
            })
        }
    }

    impl LifoNode for Node {
        fn lifo_next(&self) -> &AtomicPtr<Node> {
            &self.next
        }
    }

    #[test]
    fn pops_in_reverse_push_order() {
        let lifo = AtomicLifo::new();
        assert!(lifo.is_empty());

        lifo.push(Node::new(1));
        lifo.push(Node::new(2));
        lifo.push(Node::new(3));

        assert_eq!(lifo.pop().unwrap().value, 3);
        assert_eq!(lifo.pop().unwrap().value, 2);
        assert_eq!(lifo.pop().unwrap().value, 1);
        assert!(lifo.pop().is_none());
    }

    #[test]
    fn concurrent_producers_single_consumer() {
        static LIFO: AtomicLifo<Node> = AtomicLifo::new();

        let producers: Vec<_> = (0..4)
            .map(|p| {
                std::thread::spawn(move || {
                    for i in 0..100 {
                        LIFO.push(Node::new(p * 100 + i));
                    }
                })
            })
            .collect();

        let mut seen = std::collections::HashSet::new();
        while seen.len() < 400 {
            if let Some(node) = LIFO.pop() {
                assert!(seen.insert(node.value), "popped the same node twice");
            } else {
                std::thread::yield_now();
            }
        }
        for producer in producers {
            producer.join().unwrap();
        }
        assert!(LIFO.pop().is_none());
    }
}
