//! Concurrent sets of span handles.

use crossbeam_queue::SegQueue;

use crate::span::SpanId;

/// An internally synchronized set of span handles.
///
/// Push and pop are atomic with respect to each other; a handle popped
/// from a set is owned by the popper. This is the only allocator
/// structure mutated by multiple threads concurrently.
#[derive(Default)]
pub(crate) struct SpanSet {
    inner: SegQueue<SpanId>,
}

impl SpanSet {
    pub fn new() -> Self {
        Self {
            inner: SegQueue::new(),
        }
    }

    pub fn push(&self, id: SpanId) {
        self.inner.push(id);
    }

    pub fn pop(&self) -> Option<SpanId> {
        self.inner.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::SpanId;

    #[test]
    fn test_push_pop() {
        let set = SpanSet::new();
        assert!(set.is_empty());
        set.push(SpanId::from_raw(3));
        set.push(SpanId::from_raw(9));
        assert!(!set.is_empty());
        assert_eq!(set.pop(), Some(SpanId::from_raw(3)));
        assert_eq!(set.pop(), Some(SpanId::from_raw(9)));
        assert_eq!(set.pop(), None);
    }
}
