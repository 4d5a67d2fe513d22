//! Descriptor sets for `select(2)`
//!
//! Three disjoint interest sets (read, write, error) plus the highest
//! descriptor seen. Rebuilt from scratch every iteration; collaborators add
//! interest, the wait overwrites the sets with observed readiness.

use std::os::unix::io::RawFd;

use hostloop_core::{kwarn, IoCondition, LoopError, LoopResult};

/// Descriptors at or above this cannot be placed in an `fd_set`
pub const FD_SETSIZE: usize = libc::FD_SETSIZE as usize;

/// Fails for descriptors an `fd_set` cannot hold
pub fn check_select_range(fd: RawFd) -> LoopResult<()> {
    if fd >= 0 && (fd as usize) < FD_SETSIZE {
        Ok(())
    } else {
        Err(LoopError::DescriptorOutOfRange { fd, limit: FD_SETSIZE })
    }
}

/// One `fd_set`
#[derive(Clone, Copy)]
pub struct FdSet {
    raw: libc::fd_set,
}

impl FdSet {
    pub fn new() -> Self {
        let mut raw = std::mem::MaybeUninit::<libc::fd_set>::uninit();
        // Safety: FD_ZERO fully initializes the set
        unsafe {
            libc::FD_ZERO(raw.as_mut_ptr());
            Self { raw: raw.assume_init() }
        }
    }

    #[inline]
    fn check_fd(fd: RawFd) {
        assert!(
            fd >= 0 && (fd as usize) < FD_SETSIZE,
            "descriptor {} outside select() range 0..{}",
            fd,
            FD_SETSIZE
        );
    }

    #[inline]
    pub fn insert(&mut self, fd: RawFd) {
        Self::check_fd(fd);
        // Safety: fd is in range
        unsafe { libc::FD_SET(fd, &mut self.raw) }
    }

    #[inline]
    pub fn remove(&mut self, fd: RawFd) {
        Self::check_fd(fd);
        // Safety: fd is in range
        unsafe { libc::FD_CLR(fd, &mut self.raw) }
    }

    #[inline]
    pub fn contains(&self, fd: RawFd) -> bool {
        if fd < 0 || fd as usize >= FD_SETSIZE {
            return false;
        }
        // Safety: fd is in range
        unsafe { libc::FD_ISSET(fd, &self.raw) }
    }

    #[inline]
    pub fn clear(&mut self) {
        // Safety: raw is a valid fd_set
        unsafe { libc::FD_ZERO(&mut self.raw) }
    }

    #[inline]
    pub(crate) fn as_mut_ptr(&mut self) -> *mut libc::fd_set {
        &mut self.raw
    }
}

impl Default for FdSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Read/write/error interest sets plus the highest descriptor
#[derive(Clone, Copy)]
pub struct DescriptorSet {
    pub read: FdSet,
    pub write: FdSet,
    pub error: FdSet,
    /// Highest descriptor in any set, -1 when empty
    pub max_fd: RawFd,
}

impl DescriptorSet {
    pub fn new() -> Self {
        Self {
            read: FdSet::new(),
            write: FdSet::new(),
            error: FdSet::new(),
            max_fd: -1,
        }
    }

    /// Empty all three sets and forget the max descriptor
    pub fn reset(&mut self) {
        self.read.clear();
        self.write.clear();
        self.error.clear();
        self.max_fd = -1;
    }

    /// Empty the sets but keep `max_fd`, for when a wait left them undefined
    pub fn clear_readiness(&mut self) {
        self.read.clear();
        self.write.clear();
        self.error.clear();
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.max_fd < 0
    }

    /// Add `fd` to every set named by `interest`. Descriptors outside the
    /// `select(2)` range are skipped with a warning.
    pub fn add(&mut self, fd: RawFd, interest: IoCondition) {
        if let Err(e) = check_select_range(fd) {
            kwarn!("fdset: skipping {}", e);
            return;
        }
        let mut added = false;
        if interest.contains(IoCondition::IN) {
            self.read.insert(fd);
            added = true;
        }
        if interest.contains(IoCondition::OUT) {
            self.write.insert(fd);
            added = true;
        }
        if interest.contains(IoCondition::ERR) {
            self.error.insert(fd);
            added = true;
        }
        if added && fd > self.max_fd {
            self.max_fd = fd;
        }
    }

    #[inline]
    pub fn add_read(&mut self, fd: RawFd) {
        self.add(fd, IoCondition::IN);
    }

    #[inline]
    pub fn add_write(&mut self, fd: RawFd) {
        self.add(fd, IoCondition::OUT);
    }

    /// Observed readiness for `fd`, as a mask
    pub fn observed(&self, fd: RawFd) -> IoCondition {
        let mut c = IoCondition::empty();
        if self.read.contains(fd) {
            c |= IoCondition::IN;
        }
        if self.write.contains(fd) {
            c |= IoCondition::OUT;
        }
        if self.error.contains(fd) {
            c |= IoCondition::ERR;
        }
        c
    }

    /// Number of descriptors to pass as `nfds`
    #[inline]
    pub fn nfds(&self) -> libc::c_int {
        self.max_fd + 1
    }
}

impl Default for DescriptorSet {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DescriptorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let members = |set: &FdSet| -> Vec<RawFd> {
            (0..=self.max_fd).filter(|&fd| set.contains(fd)).collect()
        };
        f.debug_struct("DescriptorSet")
            .field("read", &members(&self.read))
            .field("write", &members(&self.write))
            .field("error", &members(&self.error))
            .field("max_fd", &self.max_fd)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_tracks_max_fd() {
        let mut set = DescriptorSet::new();
        assert!(set.is_empty());

        set.add(5, IoCondition::IN);
        set.add(3, IoCondition::OUT | IoCondition::ERR);
        assert_eq!(set.max_fd, 5);
        assert_eq!(set.nfds(), 6);

        assert_eq!(set.observed(5), IoCondition::IN);
        assert_eq!(set.observed(3), IoCondition::OUT | IoCondition::ERR);
        assert_eq!(set.observed(4), IoCondition::empty());
    }

    #[test]
    fn test_interest_without_bits_is_ignored() {
        let mut set = DescriptorSet::new();
        set.add(9, IoCondition::HUP);
        assert!(set.is_empty());
        assert_eq!(set.observed(9), IoCondition::empty());
    }

    #[test]
    fn test_reset() {
        let mut set = DescriptorSet::new();
        set.add_read(7);
        set.reset();
        assert!(set.is_empty());
        assert!(!set.read.contains(7));
    }

    #[test]
    fn test_out_of_range_descriptor_is_skipped() {
        let mut set = DescriptorSet::new();
        set.add_read(FD_SETSIZE as RawFd + 476);
        set.add_write(-3);
        assert!(set.is_empty());

        assert_eq!(
            check_select_range(FD_SETSIZE as RawFd),
            Err(LoopError::DescriptorOutOfRange { fd: FD_SETSIZE as RawFd, limit: FD_SETSIZE })
        );
        assert!(check_select_range(0).is_ok());
    }

    #[test]
    fn test_contains_out_of_range_is_false() {
        let set = FdSet::new();
        assert!(!set.contains(-1));
        assert!(!set.contains(FD_SETSIZE as RawFd));
    }
}
