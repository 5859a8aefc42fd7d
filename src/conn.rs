use std::any::Any;
use std::os::unix::io::RawFd;
use std::sync::Weak;

use bytes::BytesMut;
use socket2::SockAddr;

use crate::handler::Action;
use crate::poll::{Note, Poller};

/// Per-connection state, owned by exactly one event loop.
///
/// Handed to callbacks as `&mut Conn`; the loop restores its event
/// registration after every callback, so mutations here take effect on
/// the next readiness dispatch.
pub struct Conn {
    pub(crate) fd: RawFd,
    pub(crate) listener_index: usize,
    /// Pending outbound bytes. Bytes installed by a `data` callback
    /// replace whatever is here, including an unwritten tail.
    pub(crate) out: BytesMut,
    pub(crate) reuse_input: bool,
    pub(crate) opened: bool,
    pub(crate) action: Action,
    /// Loop-local serial; a wake whose serial no longer matches is stale
    /// (the fd was closed and reused) and is dropped.
    pub(crate) id: u64,
    pub(crate) poll: Weak<Poller>,
    local_addr: Option<SockAddr>,
    peer_addr: Option<SockAddr>,
    ctx: Option<Box<dyn Any + Send>>,
}

impl Conn {
    pub(crate) fn new(
        fd: RawFd,
        listener_index: usize,
        peer_addr: SockAddr,
        local_addr: SockAddr,
        poll: Weak<Poller>,
        id: u64,
    ) -> Self {
        Conn {
            fd,
            listener_index,
            out: BytesMut::new(),
            reuse_input: false,
            opened: false,
            action: Action::None,
            id,
            poll,
            local_addr: Some(local_addr),
            peer_addr: Some(peer_addr),
            ctx: None,
        }
    }

    /// Ephemeral connection synthesized for one UDP datagram. Not stored
    /// in any loop; its waker never fires.
    pub(crate) fn datagram(listener_index: usize, peer_addr: SockAddr, local_addr: SockAddr) -> Self {
        Conn {
            fd: -1,
            listener_index,
            out: BytesMut::new(),
            reuse_input: false,
            opened: true,
            action: Action::None,
            id: 0,
            poll: Weak::new(),
            local_addr: Some(local_addr),
            peer_addr: Some(peer_addr),
            ctx: None,
        }
    }

    /// Index of the listener that accepted this connection.
    pub fn listener_index(&self) -> usize {
        self.listener_index
    }

    /// Bound address of the accepting listener.
    pub fn local_addr(&self) -> Option<&SockAddr> {
        self.local_addr.as_ref()
    }

    /// Remote address captured at accept (or the datagram sender for UDP).
    pub fn peer_addr(&self) -> Option<&SockAddr> {
        self.peer_addr.as_ref()
    }

    /// Attach an application-owned value to this connection.
    pub fn set_context<T: Any + Send>(&mut self, ctx: T) {
        self.ctx = Some(Box::new(ctx));
    }

    /// Borrow the attached context, if any of type `T`.
    pub fn context<T: Any>(&self) -> Option<&T> {
        self.ctx.as_ref().and_then(|c| c.downcast_ref())
    }

    /// Mutably borrow the attached context, if any of type `T`.
    pub fn context_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.ctx.as_mut().and_then(|c| c.downcast_mut())
    }

    /// Remove and return the attached context.
    pub fn take_context<T: Any>(&mut self) -> Option<Box<T>> {
        match self.ctx.take() {
            Some(ctx) => match ctx.downcast() {
                Ok(ctx) => Some(ctx),
                Err(other) => {
                    self.ctx = Some(other);
                    None
                }
            },
            None => None,
        }
    }

    /// Handle for waking this connection from any thread.
    pub fn waker(&self) -> Waker {
        Waker {
            poll: self.poll.clone(),
            fd: self.fd,
            id: self.id,
        }
    }
}

/// Cloneable handle that schedules a `data(conn, &[])` call on the
/// connection's loop. Holds only a weak reference to the loop; the loop
/// owns the connection, never the other way around.
#[derive(Clone)]
pub struct Waker {
    poll: Weak<Poller>,
    fd: RawFd,
    id: u64,
}

impl Waker {
    /// Post a wake. Returns false if the loop has already shut down;
    /// a wake for a connection that closed in the meantime is silently
    /// dropped by the loop.
    pub fn wake(&self) -> bool {
        let Some(poll) = Weak::upgrade(&self.poll) else {
            return false;
        };
        poll.trigger(Note::Wake {
            fd: self.fd,
            id: self.id,
        })
        .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use socket2::SockAddr;
    use std::net::SocketAddr;

    fn addr() -> SockAddr {
        "127.0.0.1:0".parse::<SocketAddr>().unwrap().into()
    }

    #[test]
    fn context_roundtrip() {
        let mut conn = Conn::datagram(0, addr(), addr());
        assert!(conn.context::<u32>().is_none());

        conn.set_context(41u32);
        assert_eq!(conn.context::<u32>(), Some(&41));
        *conn.context_mut::<u32>().unwrap() += 1;
        assert_eq!(conn.context::<u32>(), Some(&42));

        // Wrong type leaves the context in place.
        assert!(conn.take_context::<String>().is_none());
        assert_eq!(*conn.take_context::<u32>().unwrap(), 42);
        assert!(conn.context::<u32>().is_none());
    }

    #[test]
    fn waker_on_dead_loop_reports_failure() {
        let conn = Conn::datagram(0, addr(), addr());
        let waker = conn.waker();
        assert!(!waker.wake());
    }
}
