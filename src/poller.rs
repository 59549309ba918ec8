//! Interest-mask bookkeeping over one poll registration.

use std::os::fd::RawFd;

use crate::event::{CloseCallback, EventLoop, Interest, LoopError, PollCallback, PollHandle};

/// Owns one readiness registration and the interest mask currently armed on
/// it, so callers can re-arm unconditionally on phase changes but skip the
/// loop round trip when nothing changed.
pub(crate) struct Poller {
    handle: Box<dyn PollHandle>,
    interest: Interest,
}

impl Poller {
    /// Register `fd` with the loop; the registration starts unarmed.
    pub(crate) fn register(
        event_loop: &dyn EventLoop,
        fd: RawFd,
        callback: PollCallback,
    ) -> Result<Self, LoopError> {
        let handle = event_loop.register(fd, callback)?;

        Ok(Self {
            handle,
            interest: Interest::NONE,
        })
    }

    /// The interest mask currently armed.
    pub(crate) fn interest(&self) -> Interest {
        self.interest
    }

    /// Arm the given mask unconditionally.
    pub(crate) fn start(&mut self, interest: Interest) -> Result<(), LoopError> {
        self.handle.start(interest)?;
        self.interest = interest;
        Ok(())
    }

    /// Arm the given mask only when it differs from the one already armed.
    pub(crate) fn ensure(&mut self, interest: Interest) -> Result<(), LoopError> {
        if interest != self.interest {
            self.start(interest)?;
        }

        Ok(())
    }

    /// Cease callback delivery.
    pub(crate) fn stop(&self) {
        self.handle.stop();
    }

    /// Release the registration; `on_closed` runs once the loop has let go
    /// of it.
    pub(crate) fn close(self, on_closed: CloseCallback) {
        self.handle.close(on_closed);
    }
}
