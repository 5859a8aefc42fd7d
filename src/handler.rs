use std::io;
use std::time::Duration;

use socket2::SockAddr;

use crate::conn::Conn;
use crate::detached::DetachedStream;

/// State change requested by a callback, applied by the owning loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    /// Keep the connection as it is.
    #[default]
    None,
    /// Close the connection.
    Close,
    /// Shut the whole server down.
    Shutdown,
    /// Remove the connection from the loop and hand its fd to the
    /// application as a blocking [`DetachedStream`].
    Detach,
}

/// Per-connection options returned by [`EventHandler::opened`].
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenOptions {
    /// Hand the loop's shared read buffer to [`EventHandler::data`]
    /// without copying. The slice is only valid for the duration of the
    /// callback either way; this saves one copy per read.
    pub reuse_input_buffer: bool,
    /// Enable TCP keep-alive with this idle time (also used as the probe
    /// interval). Ignored on non-TCP listeners.
    pub tcp_keepalive: Option<Duration>,
}

/// Passed to [`EventHandler::serving`] once, before any loop starts.
#[derive(Debug)]
pub struct ServerInfo {
    /// Number of event loops the server will run.
    pub num_loops: usize,
    /// Bound address of each listener, in registration order.
    pub addrs: Vec<SockAddr>,
}

/// The event vector an application implements.
///
/// One handler instance is shared by every loop; callbacks take `&self`
/// and run strictly sequentially within a loop, so cross-loop state needs
/// the application's own interior mutability. Callbacks must not block:
/// a blocked callback stalls every connection on that loop.
///
/// For a single connection the order is `opened`, any number of `data`
/// calls, then `closed` exactly once.
pub trait EventHandler: Send + Sync + 'static {
    /// Fired once before any loop starts. Returning [`Action::Shutdown`]
    /// aborts startup.
    fn serving(&self, _server: &ServerInfo) -> Action {
        Action::None
    }

    /// Fired on the first readiness event of a freshly accepted
    /// connection. Returned bytes are queued for writing.
    fn opened(&self, _conn: &mut Conn) -> (Option<Vec<u8>>, OpenOptions, Action) {
        (None, OpenOptions::default(), Action::None)
    }

    /// Fired when bytes arrive, or with an empty `input` when a
    /// [`Waker`](crate::Waker) wake is delivered. Returned bytes replace
    /// any pending outbound bytes, including an unwritten tail from a
    /// partial write.
    fn data(&self, _conn: &mut Conn, _input: &[u8]) -> (Option<Vec<u8>>, Action) {
        (None, Action::None)
    }

    /// Fired immediately before each write syscall.
    fn pre_write(&self) {}

    /// Fired exactly once when a connection is torn down. `err` carries
    /// the fatal I/O error, if any.
    fn closed(&self, _conn: &mut Conn, _err: Option<io::Error>) -> Action {
        Action::None
    }

    /// Fired when a [`Action::Detach`] has been applied. Dropping the
    /// stream closes the fd; keep it to take over the connection.
    fn detached(&self, _conn: &mut Conn, _stream: DetachedStream) -> Action {
        Action::None
    }

    /// Fired periodically on loop 0 when [`Config::tick`](crate::Config)
    /// is set. Returns the delay before the next tick.
    fn tick(&self) -> (Duration, Action) {
        (Duration::from_secs(1), Action::None)
    }
}
