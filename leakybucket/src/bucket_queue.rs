//! Ordered buffer of the events a bucket has accepted.
//!
//! This is a thin wrapper around `VecDeque` that can optionally enforce a
//! maximum size set at construction time. When pushing to a full bounded
//! queue, the oldest element is removed first.

use std::{collections::VecDeque, num::NonZeroUsize};

/// An ordered, bounded-or-unbounded queue.
#[derive(Clone, Debug)]
pub struct BucketQueue<T> {
    buf: VecDeque<T>,
    max_size: Option<NonZeroUsize>,
}

impl<T> BucketQueue<T> {
    /// Create a queue that grows without bound.
    pub fn unbounded() -> Self {
        Self {
            buf: VecDeque::new(),
            max_size: None,
        }
    }

    /// Create a queue holding at most `max_size` elements.
    pub fn bounded(max_size: NonZeroUsize) -> Self {
        Self {
            buf: VecDeque::with_capacity(max_size.get()),
            max_size: Some(max_size),
        }
    }

    /// Create a queue, bounded if `max_size` is given and nonzero.
    pub fn new(max_size: Option<usize>) -> Self {
        match max_size.and_then(NonZeroUsize::new) {
            Some(max_size) => Self::bounded(max_size),
            None => Self::unbounded(),
        }
    }

    /// Push an element to the back of the queue.
    /// If the queue is bounded and full, the oldest element is removed first.
    pub fn push_back(&mut self, value: T) {
        if let Some(max_size) = self.max_size
            && self.buf.len() >= max_size.get()
        {
            self.buf.pop_front();
        }
        self.buf.push_back(value);
    }

    /// Returns the number of elements in the queue.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns true if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Returns the size limit, if any.
    pub fn max_size(&self) -> Option<NonZeroUsize> {
        self.max_size
    }

    /// Returns an iterator over the elements, from oldest to newest.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.buf.iter()
    }

    /// Clears the queue, removing all elements.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

impl<T: Clone> BucketQueue<T> {
    /// Copy the contents, from oldest to newest.
    pub fn to_vec(&self) -> Vec<T> {
        self.buf.iter().cloned().collect()
    }
}

impl<T> Default for BucketQueue<T> {
    fn default() -> Self {
        Self::unbounded()
    }
}
