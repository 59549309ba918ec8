//! Seam between the connection core and the host DNS resolver.

use std::net::IpAddr;

/// Callback receiving the resolved addresses; an empty list means the name
/// did not resolve.
pub type ResolveCallback = Box<dyn FnOnce(Vec<IpAddr>)>;

/// Identifies one in-flight lookup for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolveToken(u64);

impl ResolveToken {
    /// Wrap a resolver-chosen token value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw token value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

/// Host DNS resolver with cancellable lookups.
///
/// Delivery is deferred: the callback is never invoked from inside
/// `resolve`, only from a later loop turn.
pub trait Resolver {
    /// Begin an address lookup for `host`.
    fn resolve(&self, host: &str, callback: ResolveCallback) -> ResolveToken;

    /// Cancel an in-flight lookup. With `deliver` false the pending
    /// callback is suppressed entirely; with `deliver` true it is invoked
    /// with an empty address list.
    fn cancel(&self, token: ResolveToken, deliver: bool);
}
