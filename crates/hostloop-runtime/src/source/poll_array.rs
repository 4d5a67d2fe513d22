//! Fixed-capacity array of poll requests
//!
//! Filled from the event-source framework each iteration. The capacity is a
//! protocol invariant sized well above any realistic pending-source count,
//! so running out is a bug in a source, not a condition to recover from.

use std::os::unix::io::RawFd;

use hostloop_core::IoCondition;

use crate::sys::PollRequest;

/// Ordered (descriptor, interest, result) entries with a hard capacity
#[derive(Debug)]
pub struct PollRequestArray {
    entries: Vec<PollRequest>,
    capacity: usize,
}

impl PollRequestArray {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an entry.
    ///
    /// # Panics
    ///
    /// When the array is full. Pending sources must never outnumber the
    /// configured capacity.
    pub fn push(&mut self, fd: RawFd, events: IoCondition) {
        assert!(
            self.entries.len() < self.capacity,
            "poll request array overflow: capacity {} exceeded (fd {})",
            self.capacity,
            fd
        );
        self.entries.push(PollRequest::new(fd, events));
    }

    #[inline]
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[inline]
    pub fn truncate(&mut self, len: usize) {
        self.entries.truncate(len);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn as_slice(&self) -> &[PollRequest] {
        &self.entries
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [PollRequest] {
        &mut self.entries
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PollRequest> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, PollRequest> {
        self.entries.iter_mut()
    }
}
