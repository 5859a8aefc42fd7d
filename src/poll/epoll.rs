use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;

use parking_lot::Mutex;

use super::Note;
use crate::error::Error;

const MAX_EVENTS: usize = 64;

/// Level-triggered epoll multiplexer with an eventfd wakeup channel.
///
/// All registration calls and `wait` belong to the owning loop thread;
/// `trigger` may be called from any thread.
pub(crate) struct Poller {
    epfd: RawFd,
    wakefd: RawFd,
    queue: Mutex<NoteQueue>,
}

struct NoteQueue {
    notes: VecDeque<Note>,
    /// Collapses eventfd writes: one write outstanding at a time is
    /// enough to make the next wait return, the queue preserves every note.
    wake_pending: bool,
    closed: bool,
}

impl Poller {
    pub(crate) fn new() -> Result<Self, Error> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let wakefd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wakefd < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epfd) };
            return Err(err.into());
        }
        let poller = Poller {
            epfd,
            wakefd,
            queue: Mutex::new(NoteQueue {
                notes: VecDeque::new(),
                wake_pending: false,
                closed: false,
            }),
        };
        poller.ctl(libc::EPOLL_CTL_ADD, wakefd, libc::EPOLLIN as u32)?;
        Ok(poller)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> Result<(), Error> {
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    pub(crate) fn add_read(&self, fd: RawFd) -> Result<(), Error> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, libc::EPOLLIN as u32)
    }

    pub(crate) fn add_read_write(&self, fd: RawFd) -> Result<(), Error> {
        self.ctl(
            libc::EPOLL_CTL_ADD,
            fd,
            (libc::EPOLLIN | libc::EPOLLOUT) as u32,
        )
    }

    pub(crate) fn mod_read(&self, fd: RawFd) -> Result<(), Error> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, libc::EPOLLIN as u32)
    }

    pub(crate) fn mod_read_write(&self, fd: RawFd) -> Result<(), Error> {
        self.ctl(
            libc::EPOLL_CTL_MOD,
            fd,
            (libc::EPOLLIN | libc::EPOLLOUT) as u32,
        )
    }

    /// Remove fd from the multiplexer without closing it.
    pub(crate) fn mod_detach(&self, fd: RawFd) -> Result<(), Error> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0)
    }

    /// Enqueue a note and make a blocked `wait` return promptly.
    /// Thread-safe; fails once the poller has been closed.
    pub(crate) fn trigger(&self, note: Note) -> Result<(), Error> {
        let mut queue = self.queue.lock();
        if queue.closed {
            return Err(Error::LoopClosed);
        }
        queue.notes.push_back(note);
        if !queue.wake_pending {
            queue.wake_pending = true;
            let one: u64 = 1;
            unsafe {
                libc::write(self.wakefd, &one as *const u64 as *const libc::c_void, 8);
            }
        }
        Ok(())
    }

    /// Block until fds are ready or notes arrive, dispatching each.
    /// Ready fds are dispatched as `(fd, None)`; notes drain afterwards
    /// in FIFO order as `(0, Some(note))`. Runs until `dispatch` errors.
    pub(crate) fn wait(
        &self,
        mut dispatch: impl FnMut(RawFd, Option<Note>) -> Result<(), Error>,
    ) -> Result<(), Error> {
        let mut events: [libc::epoll_event; MAX_EVENTS] = unsafe { std::mem::zeroed() };
        loop {
            let n = unsafe {
                libc::epoll_wait(self.epfd, events.as_mut_ptr(), MAX_EVENTS as libc::c_int, -1)
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err.into());
            }
            for i in 0..n as usize {
                let fd = events[i].u64 as RawFd;
                if fd == self.wakefd {
                    let mut buf = [0u8; 8];
                    unsafe {
                        libc::read(self.wakefd, buf.as_mut_ptr() as *mut libc::c_void, 8);
                    }
                    self.queue.lock().wake_pending = false;
                } else {
                    dispatch(fd, None)?;
                }
            }
            loop {
                let note = self.queue.lock().notes.pop_front();
                match note {
                    Some(note) => dispatch(0, Some(note))?,
                    None => break,
                }
            }
        }
    }

    /// Release OS resources. Subsequent triggers fail with `LoopClosed`.
    pub(crate) fn close(&self) {
        let mut queue = self.queue.lock();
        if queue.closed {
            return;
        }
        queue.closed = true;
        unsafe {
            libc::close(self.wakefd);
            libc::close(self.epfd);
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.close();
    }
}
