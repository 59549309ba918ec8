//! Seam between the connection core and the host event loop.
//!
//! The host supplies readiness notifications for file descriptors and
//! restartable timers. Everything here is single-threaded: callbacks are
//! dispatched on the loop's thread and none of the handle types are `Send`.

use std::fmt;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;
use thiserror::Error;

/// Loop status delivered to a poll callback when the descriptor never became
/// connectable.
pub const STATUS_UNREACHABLE: i32 = -9;

/// Errors reported by an event loop implementation.
#[derive(Debug, Error)]
pub enum LoopError {
    /// The descriptor could not be registered with the loop.
    #[error("unable to register descriptor {fd} with the event loop: {reason}")]
    Register {
        /// The descriptor that failed to register.
        fd: RawFd,
        /// Loop-specific failure description.
        reason: String,
    },
    /// The loop rejected an interest-mask update.
    #[error("unable to start poll: {0}")]
    PollStart(String),
}

/// Readiness directions a registration is interested in.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest(u32);

impl Interest {
    /// No interest; the registration is parked.
    pub const NONE: Interest = Self(0);
    /// Interest in readable events.
    pub const READABLE: Interest = Self(0b01);
    /// Interest in writable events.
    pub const WRITABLE: Interest = Self(0b10);

    /// Interest in both readable and writable events.
    #[must_use]
    pub const fn both() -> Self {
        Self(0b11)
    }

    /// True if readable interest is set.
    #[must_use]
    pub const fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    /// True if writable interest is set.
    #[must_use]
    pub const fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    /// True if no direction is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Combines interests.
    #[must_use]
    pub const fn add(self, other: Interest) -> Self {
        Self(self.0 | other.0)
    }

    /// Removes an interest.
    #[must_use]
    pub const fn remove(self, other: Interest) -> Self {
        Self(self.0 & !other.0)
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.is_readable(), self.is_writable()) {
            (true, true) => formatter.write_str("readable|writable"),
            (true, false) => formatter.write_str("readable"),
            (false, true) => formatter.write_str("writable"),
            (false, false) => formatter.write_str("none"),
        }
    }
}

/// Readiness bits observed by the loop and handed to a poll callback.
///
/// Loops may report bits beyond the two the core registers for; those are
/// surfaced through [`Events::unexpected`] and treated as a connection
/// failure by the caller.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Events(u32);

impl Events {
    /// Wrap a raw loop-reported bitmask.
    #[must_use]
    pub const fn new(bits: u32) -> Self {
        Self(bits)
    }

    /// The raw bitmask.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// The descriptor is readable.
    #[must_use]
    pub const fn is_readable(self) -> bool {
        self.0 & Interest::READABLE.0 != 0
    }

    /// The descriptor is writable.
    #[must_use]
    pub const fn is_writable(self) -> bool {
        self.0 & Interest::WRITABLE.0 != 0
    }

    /// Bits outside the readable/writable pair are present.
    #[must_use]
    pub const fn unexpected(self) -> bool {
        self.0 & !(Interest::READABLE.0 | Interest::WRITABLE.0) != 0
    }
}

impl From<Interest> for Events {
    fn from(interest: Interest) -> Self {
        Self(interest.0)
    }
}

impl fmt::Debug for Events {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "Events({:#x})", self.0)
    }
}

/// Callback invoked on each readiness notification with the loop-reported
/// status (negative on failure) and the observed readiness bits.
pub type PollCallback = Rc<dyn Fn(i32, Events)>;

/// Callback armed on a timer; replaced wholesale by each restart.
pub type TimerCallback = Box<dyn FnMut()>;

/// Callback invoked once the loop has released a closed poll registration.
pub type CloseCallback = Box<dyn FnOnce()>;

/// Host event loop: readiness polling plus restartable timers.
pub trait EventLoop {
    /// Register a descriptor for readiness callbacks. The registration
    /// starts with no interest; arm it with [`PollHandle::start`].
    fn register(&self, fd: RawFd, callback: PollCallback) -> Result<Box<dyn PollHandle>, LoopError>;

    /// Create an unarmed timer.
    fn timer(&self) -> Box<dyn TimerHandle>;

    /// True while the loop is dispatching; timers armed on a stopped loop
    /// never fire.
    fn is_running(&self) -> bool;
}

/// One readiness registration on the loop.
pub trait PollHandle {
    /// Set the interest mask, (re)arming callback delivery.
    fn start(&self, interest: Interest) -> Result<(), LoopError>;

    /// Cease callback delivery; later dispatches are suppressed.
    fn stop(&self);

    /// Release the registration. The loop must release its own resources
    /// for the handle before invoking `on_closed`; the acknowledgement may
    /// arrive on a later loop turn.
    fn close(self: Box<Self>, on_closed: CloseCallback);
}

/// A restartable one-shot timer.
pub trait TimerHandle {
    /// Arm (or re-arm) the timer to fire once after `after`, replacing any
    /// previously armed callback. Returns false when the timer could not be
    /// scheduled.
    fn restart(&self, after: Duration, callback: TimerCallback) -> bool;

    /// Disarm the timer.
    fn stop(&self);
}

#[cfg(test)]
mod test {
    use super::{Events, Interest};

    #[test]
    fn interest_masks_combine() {
        let mask = Interest::READABLE.add(Interest::WRITABLE);

        assert_eq!(mask, Interest::both());
        assert_eq!(mask.remove(Interest::WRITABLE), Interest::READABLE);
        assert!(Interest::NONE.is_empty());
    }

    #[test]
    fn events_outside_known_bits_are_unexpected() {
        assert!(!Events::from(Interest::both()).unexpected());
        assert!(Events::new(0b100).unexpected());
        assert!(Events::new(0b101).is_readable());
    }
}
