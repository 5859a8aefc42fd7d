use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use ahash::AHashMap;
use bytes::Buf;
use socket2::SockAddr;
use tracing::{debug, trace, warn};

use crate::config::LoadBalance;
use crate::conn::Conn;
use crate::detached::DetachedStream;
use crate::error::Error;
use crate::handler::{Action, EventHandler};
use crate::listener::{Family, Listener};
use crate::poll::{Note, Poller};
use crate::server::Shared;

/// State private to one event loop. All I/O for the connections in
/// `conns` happens on the owning thread; `count` is shared so peer loops
/// can read it for least-connections decisions.
pub(crate) struct LoopState {
    pub(crate) idx: usize,
    pub(crate) poll: Arc<Poller>,
    pub(crate) count: Arc<AtomicI32>,
    /// Shared read buffer, reused across every read on this loop.
    packet: Vec<u8>,
    conns: AHashMap<RawFd, Conn>,
    next_id: u64,
}

impl LoopState {
    pub(crate) fn new(
        idx: usize,
        poll: Arc<Poller>,
        count: Arc<AtomicI32>,
        read_buffer_size: usize,
    ) -> Self {
        LoopState {
            idx,
            poll,
            count,
            packet: vec![0u8; read_buffer_size],
            conns: AHashMap::new(),
            next_id: 1,
        }
    }

    /// Hand back the connections that were still open when the loop
    /// stopped, for the server's final close pass.
    pub(crate) fn into_conns(self) -> AHashMap<RawFd, Conn> {
        self.conns
    }
}

/// Drive the loop's poller until a closing sentinel or a fatal poller
/// error unwinds it.
pub(crate) fn run<H: EventHandler>(shared: &Shared<H>, state: &mut LoopState) -> Result<(), Error> {
    debug!(idx = state.idx, "event loop started");
    let poll = state.poll.clone();
    let result = poll.wait(|fd, note| match note {
        Some(note) => handle_note(shared, state, note),
        None => {
            if state.conns.contains_key(&fd) {
                dispatch_conn(shared, state, fd)
            } else {
                accept(shared, state, fd)
            }
        }
    });
    debug!(idx = state.idx, "event loop stopped");
    result
}

fn handle_note<H: EventHandler>(
    shared: &Shared<H>,
    state: &mut LoopState,
    note: Note,
) -> Result<(), Error> {
    match note {
        Note::Tick => {
            let (delay, action) = shared.handler.tick();
            // The delay goes out even when shutting down, so the ticker
            // never waits on a channel nobody will send to.
            let _ = shared.tick_tx.try_send(delay);
            if action == Action::Shutdown {
                return Err(Error::Closing);
            }
            Ok(())
        }
        Note::Closing => Err(Error::Closing),
        Note::Wake { fd, id } => wake_conn(shared, state, fd, id),
    }
}

/// Readiness on a connection fd runs exactly one state-machine step,
/// chosen by connection state rather than by which readiness bit fired.
fn dispatch_conn<H: EventHandler>(
    shared: &Shared<H>,
    state: &mut LoopState,
    fd: RawFd,
) -> Result<(), Error> {
    let (opened, has_out, action) = {
        let Some(conn) = state.conns.get(&fd) else {
            return Ok(());
        };
        (conn.opened, !conn.out.is_empty(), conn.action)
    };
    if !opened {
        open_conn(shared, state, fd)
    } else if has_out {
        write_conn(shared, state, fd)
    } else if action != Action::None {
        action_conn(shared, state, fd)
    } else {
        read_conn(shared, state, fd)
    }
}

fn accept<H: EventHandler>(shared: &Shared<H>, state: &mut LoopState, fd: RawFd) -> Result<(), Error> {
    for listener in &shared.listeners {
        if listener.fd() != fd {
            continue;
        }
        if shared.loops.len() > 1 {
            match shared.balance {
                LoadBalance::Random => {}
                LoadBalance::LeastConnections => {
                    // Decline if a peer has strictly fewer connections;
                    // level-triggered readiness re-fires on that peer.
                    let mine = state.count.load(Ordering::Relaxed);
                    let smaller_elsewhere = shared
                        .loops
                        .iter()
                        .enumerate()
                        .any(|(i, h)| i != state.idx && h.count.load(Ordering::Relaxed) < mine);
                    if smaller_elsewhere {
                        return Ok(());
                    }
                }
                LoadBalance::RoundRobin => {
                    let idx = shared.accepted.load(Ordering::Relaxed) % shared.loops.len();
                    if idx != state.idx {
                        return Ok(());
                    }
                    shared.accepted.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        if listener.family == Family::Udp {
            return udp_read(shared, state, listener);
        }

        let (nfd, peer) = match accept_nonblocking(fd) {
            Ok(pair) => pair,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let id = state.next_id;
        state.next_id += 1;
        let conn = Conn::new(
            nfd,
            listener.index,
            peer,
            listener.addr.clone(),
            Arc::downgrade(&state.poll),
            id,
        );
        state.conns.insert(nfd, conn);
        state.count.fetch_add(1, Ordering::Relaxed);
        // Write readiness is immediate on a fresh connection, so the
        // first dispatch runs the open path without waiting for input.
        state.poll.add_read_write(nfd)?;
        trace!(idx = state.idx, fd = nfd, "accepted connection");
        return Ok(());
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn accept_nonblocking(fd: RawFd) -> io::Result<(RawFd, SockAddr)> {
    unsafe {
        SockAddr::try_init(|storage, len| {
            let nfd = unsafe {
                libc::accept4(
                    fd,
                    storage as *mut libc::sockaddr,
                    len,
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if nfd < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(nfd)
        })
    }
}

#[cfg(not(target_os = "linux"))]
fn accept_nonblocking(fd: RawFd) -> io::Result<(RawFd, SockAddr)> {
    unsafe {
        SockAddr::try_init(|storage, len| {
            let nfd = unsafe { libc::accept(fd, storage as *mut libc::sockaddr, len) };
            if nfd < 0 {
                return Err(io::Error::last_os_error());
            }
            unsafe {
                let flags = libc::fcntl(nfd, libc::F_GETFL);
                libc::fcntl(nfd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                libc::fcntl(nfd, libc::F_SETFD, libc::FD_CLOEXEC);
            }
            Ok(nfd)
        })
    }
}

fn open_conn<H: EventHandler>(
    shared: &Shared<H>,
    state: &mut LoopState,
    fd: RawFd,
) -> Result<(), Error> {
    let Some(conn) = state.conns.get_mut(&fd) else {
        return Ok(());
    };
    conn.opened = true;
    let (out, opts, action) = shared.handler.opened(conn);
    if let Some(out) = out
        && !out.is_empty()
    {
        conn.out.extend_from_slice(&out);
    }
    conn.action = action;
    conn.reuse_input = opts.reuse_input_buffer;
    let listener_index = conn.listener_index;
    if let Some(keepalive) = opts.tcp_keepalive
        && shared.listeners[listener_index].family == Family::Tcp
        && let Err(e) = set_keepalive(fd, keepalive)
    {
        warn!(fd, error = %e, "failed to enable keep-alive");
    }
    if conn.out.is_empty() && conn.action == Action::None {
        state.poll.mod_read(fd)?;
    }
    Ok(())
}

fn set_keepalive(fd: RawFd, dur: Duration) -> io::Result<()> {
    let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
    let sock = socket2::SockRef::from(&borrowed);
    sock.set_keepalive(true)?;
    let params = socket2::TcpKeepalive::new().with_time(dur).with_interval(dur);
    sock.set_tcp_keepalive(&params)
}

fn write_conn<H: EventHandler>(
    shared: &Shared<H>,
    state: &mut LoopState,
    fd: RawFd,
) -> Result<(), Error> {
    shared.handler.pre_write();
    let written = {
        let Some(conn) = state.conns.get_mut(&fd) else {
            return Ok(());
        };
        let n = unsafe {
            libc::write(
                fd,
                conn.out.as_ptr() as *const libc::c_void,
                conn.out.len(),
            )
        };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    };
    match written {
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
        Err(e) => close_conn(shared, state, fd, Some(e)),
        Ok(n) => {
            let Some(conn) = state.conns.get_mut(&fd) else {
                return Ok(());
            };
            if n == conn.out.len() {
                conn.out.clear();
            } else {
                conn.out.advance(n);
            }
            if conn.out.is_empty() && conn.action == Action::None {
                state.poll.mod_read(fd)?;
            }
            Ok(())
        }
    }
}

fn action_conn<H: EventHandler>(
    shared: &Shared<H>,
    state: &mut LoopState,
    fd: RawFd,
) -> Result<(), Error> {
    let action = {
        let Some(conn) = state.conns.get_mut(&fd) else {
            return Ok(());
        };
        mem::replace(&mut conn.action, Action::None)
    };
    match action {
        Action::Close => close_conn(shared, state, fd, None),
        Action::Shutdown => Err(Error::Closing),
        Action::Detach => detach_conn(shared, state, fd),
        Action::None => {
            let Some(conn) = state.conns.get(&fd) else {
                return Ok(());
            };
            if conn.out.is_empty() {
                state.poll.mod_read(fd)?;
            }
            Ok(())
        }
    }
}

fn read_conn<H: EventHandler>(
    shared: &Shared<H>,
    state: &mut LoopState,
    fd: RawFd,
) -> Result<(), Error> {
    let n = unsafe {
        libc::read(
            fd,
            state.packet.as_mut_ptr() as *mut libc::c_void,
            state.packet.len(),
        )
    };
    if n == 0 {
        return close_conn(shared, state, fd, None);
    }
    if n < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(());
        }
        return close_conn(shared, state, fd, Some(err));
    }
    let n = n as usize;

    let Some(conn) = state.conns.get_mut(&fd) else {
        return Ok(());
    };
    let copied;
    let input: &[u8] = if conn.reuse_input {
        &state.packet[..n]
    } else {
        copied = state.packet[..n].to_vec();
        &copied
    };
    let (out, action) = shared.handler.data(conn, input);
    conn.action = action;
    if let Some(out) = out
        && !out.is_empty()
    {
        // Replaces any unwritten tail from a previous partial write.
        conn.out.clear();
        conn.out.extend_from_slice(&out);
    }
    if !conn.out.is_empty() || conn.action != Action::None {
        state.poll.mod_read_write(fd)?;
    }
    Ok(())
}

/// A wake behaves like a read that delivered no bytes.
fn wake_conn<H: EventHandler>(
    shared: &Shared<H>,
    state: &mut LoopState,
    fd: RawFd,
    id: u64,
) -> Result<(), Error> {
    let Some(conn) = state.conns.get_mut(&fd) else {
        return Ok(());
    };
    if conn.id != id {
        // The fd was closed and reused since the wake was posted.
        return Ok(());
    }
    let (out, action) = shared.handler.data(conn, &[]);
    conn.action = action;
    if let Some(out) = out
        && !out.is_empty()
    {
        conn.out.clear();
        conn.out.extend_from_slice(&out);
    }
    if !conn.out.is_empty() || conn.action != Action::None {
        state.poll.mod_read_write(fd)?;
    }
    Ok(())
}

fn udp_read<H: EventHandler>(
    shared: &Shared<H>,
    state: &mut LoopState,
    listener: &Listener,
) -> Result<(), Error> {
    let packet = &mut state.packet;
    let received = unsafe {
        SockAddr::try_init(|storage, len| {
            let n = unsafe {
                libc::recvfrom(
                    listener.fd(),
                    packet.as_mut_ptr() as *mut libc::c_void,
                    packet.len(),
                    0,
                    storage as *mut libc::sockaddr,
                    len,
                )
            };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(n as usize)
        })
    };
    let (n, peer) = match received {
        Ok(pair) => pair,
        Err(_) => return Ok(()),
    };
    if n == 0 {
        return Ok(());
    }

    let mut conn = Conn::datagram(listener.index, peer.clone(), listener.addr.clone());
    let input = state.packet[..n].to_vec();
    let (out, action) = shared.handler.data(&mut conn, &input);
    if let Some(out) = out
        && !out.is_empty()
    {
        shared.handler.pre_write();
        unsafe {
            libc::sendto(
                listener.fd(),
                out.as_ptr() as *const libc::c_void,
                out.len(),
                0,
                peer.as_ptr() as *const libc::sockaddr,
                peer.len(),
            );
        }
    }
    if action == Action::Shutdown {
        return Err(Error::Closing);
    }
    Ok(())
}

/// Tear a connection down: drop it from the map, close the fd, and fire
/// the closed callback. Per-connection errors end here; only a Shutdown
/// action propagates.
fn close_conn<H: EventHandler>(
    shared: &Shared<H>,
    state: &mut LoopState,
    fd: RawFd,
    err: Option<io::Error>,
) -> Result<(), Error> {
    let Some(mut conn) = state.conns.remove(&fd) else {
        return Ok(());
    };
    state.count.fetch_sub(1, Ordering::Relaxed);
    unsafe {
        libc::close(fd);
    }
    trace!(idx = state.idx, fd, "connection closed");
    match shared.handler.closed(&mut conn, err) {
        Action::Shutdown => Err(Error::Closing),
        _ => Ok(()),
    }
}

fn detach_conn<H: EventHandler>(
    shared: &Shared<H>,
    state: &mut LoopState,
    fd: RawFd,
) -> Result<(), Error> {
    let Some(mut conn) = state.conns.remove(&fd) else {
        return Ok(());
    };
    state.poll.mod_detach(fd)?;
    state.count.fetch_sub(1, Ordering::Relaxed);
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error().into());
    }
    trace!(idx = state.idx, fd, "connection detached");
    let stream = DetachedStream::from_raw(fd);
    match shared.handler.detached(&mut conn, stream) {
        Action::Shutdown => Err(Error::Closing),
        _ => Ok(()),
    }
}
