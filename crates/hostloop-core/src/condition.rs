//! Readiness interest and result masks
//!
//! The event-source framework speaks in `IoCondition` masks; the select path
//! speaks in three descriptor sets. The bit values match `poll(2)` so a
//! mask can be handed to the kernel unchanged.

bitflags::bitflags! {
    /// Interest / result mask for one descriptor or handle
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct IoCondition: u16 {
        /// Readable
        const IN = 0x0001;
        /// Urgent data
        const PRI = 0x0002;
        /// Writable
        const OUT = 0x0004;
        /// Error
        const ERR = 0x0008;
        /// Hung up
        const HUP = 0x0010;
        /// Invalid descriptor
        const NVAL = 0x0020;
    }
}

impl IoCondition {
    /// Interest registered for wait objects and notifier handles
    pub const READABLE: IoCondition = IoCondition::IN;

    /// Conditions `poll(2)` may report even when not requested
    pub const ALWAYS_REPORTED: IoCondition = IoCondition::ERR
        .union(IoCondition::HUP)
        .union(IoCondition::NVAL);

    /// Raw `poll(2)` event bits
    #[inline]
    pub fn to_poll_events(self) -> i16 {
        self.bits() as i16
    }

    /// From raw `poll(2)` revents; unknown bits are dropped
    #[inline]
    pub fn from_poll_events(bits: i16) -> Self {
        IoCondition::from_bits_truncate(bits as u16)
    }
}
