use std::collections::VecDeque;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;

use parking_lot::Mutex;

use super::Note;
use crate::error::Error;

const MAX_EVENTS: usize = 64;

/// Ident of the EVFILT_USER wakeup event. Never collides with a socket:
/// fd 0 is stdin and is never registered.
const WAKE_IDENT: usize = 0;

/// Level-triggered kqueue multiplexer with an EVFILT_USER wakeup event.
///
/// Read and write interest are separate kqueue filters, so a socket that
/// is both readable and writable produces two dispatches per wait; the
/// connection state machine tolerates repeat visits.
pub(crate) struct Poller {
    kq: RawFd,
    queue: Mutex<NoteQueue>,
}

struct NoteQueue {
    notes: VecDeque<Note>,
    wake_pending: bool,
    closed: bool,
}

// Field types of `struct kevent` differ across the BSDs; build from
// wide integers and cast per-field.
fn kev(ident: usize, filter: i64, flags: u64, fflags: u32) -> libc::kevent {
    let mut ev: libc::kevent = unsafe { mem::zeroed() };
    ev.ident = ident as _;
    ev.filter = filter as _;
    ev.flags = flags as _;
    ev.fflags = fflags as _;
    ev
}

impl Poller {
    pub(crate) fn new() -> Result<Self, Error> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let poller = Poller {
            kq,
            queue: Mutex::new(NoteQueue {
                notes: VecDeque::new(),
                wake_pending: false,
                closed: false,
            }),
        };
        poller.change(kev(
            WAKE_IDENT,
            libc::EVFILT_USER as i64,
            (libc::EV_ADD | libc::EV_CLEAR) as u64,
            0,
        ))?;
        Ok(poller)
    }

    fn change(&self, ev: libc::kevent) -> Result<(), Error> {
        let ret = unsafe { libc::kevent(self.kq, &ev, 1, ptr::null_mut(), 0, ptr::null()) };
        if ret < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    /// Apply a filter change, ignoring ENOENT (deleting an absent filter).
    fn change_lenient(&self, ev: libc::kevent) -> Result<(), Error> {
        match self.change(ev) {
            Err(Error::Io(e)) if e.raw_os_error() == Some(libc::ENOENT) => Ok(()),
            other => other,
        }
    }

    pub(crate) fn add_read(&self, fd: RawFd) -> Result<(), Error> {
        self.change(kev(fd as usize, libc::EVFILT_READ as i64, libc::EV_ADD as u64, 0))
    }

    pub(crate) fn add_read_write(&self, fd: RawFd) -> Result<(), Error> {
        self.change(kev(fd as usize, libc::EVFILT_READ as i64, libc::EV_ADD as u64, 0))?;
        self.change(kev(fd as usize, libc::EVFILT_WRITE as i64, libc::EV_ADD as u64, 0))
    }

    pub(crate) fn mod_read(&self, fd: RawFd) -> Result<(), Error> {
        self.change(kev(fd as usize, libc::EVFILT_READ as i64, libc::EV_ADD as u64, 0))?;
        self.change_lenient(kev(fd as usize, libc::EVFILT_WRITE as i64, libc::EV_DELETE as u64, 0))
    }

    pub(crate) fn mod_read_write(&self, fd: RawFd) -> Result<(), Error> {
        self.add_read_write(fd)
    }

    /// Remove fd from the multiplexer without closing it.
    pub(crate) fn mod_detach(&self, fd: RawFd) -> Result<(), Error> {
        self.change_lenient(kev(fd as usize, libc::EVFILT_READ as i64, libc::EV_DELETE as u64, 0))?;
        self.change_lenient(kev(fd as usize, libc::EVFILT_WRITE as i64, libc::EV_DELETE as u64, 0))
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
            let ev = kev(WAKE_IDENT, libc::EVFILT_USER as i64, 0, libc::NOTE_TRIGGER);
            unsafe {
                libc::kevent(self.kq, &ev, 1, ptr::null_mut(), 0, ptr::null());
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
        let mut events: [libc::kevent; MAX_EVENTS] = unsafe { mem::zeroed() };
        loop {
            let n = unsafe {
                libc::kevent(
                    self.kq,
                    ptr::null(),
                    0,
                    events.as_mut_ptr(),
                    MAX_EVENTS as libc::c_int,
                    ptr::null(),
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err.into());
            }
            for i in 0..n as usize {
                let ev = events[i];
                if ev.filter == libc::EVFILT_USER {
                    self.queue.lock().wake_pending = false;
                } else {
                    dispatch(ev.ident as RawFd, None)?;
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
            libc::close(self.kq);
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.close();
    }
}
