//! OS readiness multiplexer with an out-of-band trigger channel.
//!
//! Registrations are level-triggered on both backends: unconsumed
//! readiness re-fires on the next wait, which is what lets every loop
//! watch every listener and still decline to accept.

use std::os::unix::io::RawFd;

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(target_os = "linux")]
pub(crate) use epoll::Poller;

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
mod kqueue;
#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub(crate) use kqueue::Poller;

/// Out-of-band event injected into a blocked wait via `Poller::trigger`.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Note {
    /// Periodic tick from the ticker thread. Only posted to loop 0.
    Tick,
    /// Orderly-shutdown request.
    Closing,
    /// Application-initiated wake for a connection. `id` guards against
    /// the fd having been closed and reused since the wake was posted.
    Wake { fd: RawFd, id: u64 },
}
