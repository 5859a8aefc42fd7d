use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicUsize};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::config::{Config, LoadBalance, num_cpus};
use crate::error::Error;
use crate::event_loop::{self, LoopState};
use crate::handler::{Action, EventHandler, ServerInfo};
use crate::listener::{self, Listener};
use crate::poll::{Note, Poller};

/// State shared by every event loop of one server.
pub(crate) struct Shared<H> {
    pub(crate) handler: H,
    pub(crate) listeners: Vec<Listener>,
    pub(crate) balance: LoadBalance,
    /// Total accepts so far, read by every loop for round-robin.
    pub(crate) accepted: AtomicUsize,
    pub(crate) loops: Vec<LoopHandle>,
    /// Next-delay channel back to the ticker thread.
    pub(crate) tick_tx: Sender<Duration>,
    shutdown: Mutex<bool>,
    shutdown_cond: Condvar,
}

/// The parts of a loop that peers and the server may touch: the poller
/// (for triggers) and the connection count (for least-connections).
pub(crate) struct LoopHandle {
    pub(crate) poll: Arc<Poller>,
    pub(crate) count: Arc<AtomicI32>,
}

impl<H> Shared<H> {
    fn signal_shutdown(&self) {
        let mut flag = self.shutdown.lock();
        *flag = true;
        self.shutdown_cond.notify_all();
    }

    fn wait_for_shutdown(&self) {
        let mut flag = self.shutdown.lock();
        while !*flag {
            self.shutdown_cond.wait(&mut flag);
        }
    }
}

/// Run a server for the given address specs, blocking until a callback
/// requests shutdown.
///
/// Address specs look like `tcp://127.0.0.1:9000`, `udp://[::1]:5000`,
/// or `unix:///tmp/app.sock`; a bare `host:port` is TCP. All loops share
/// all listeners.
pub fn serve<H: EventHandler>(handler: H, addrs: &[&str], config: Config) -> Result<(), Error> {
    let mut listeners = Vec::with_capacity(addrs.len());
    for (index, spec) in addrs.iter().enumerate() {
        listeners.push(listener::bind(spec, config.backlog, index)?);
    }

    let num_loops = if config.num_loops == 0 {
        num_cpus()
    } else {
        config.num_loops
    };

    let info = ServerInfo {
        num_loops,
        addrs: listeners.iter().map(|l| l.addr.clone()).collect(),
    };
    if handler.serving(&info) == Action::Shutdown {
        return Ok(());
    }

    let mut loop_handles = Vec::with_capacity(num_loops);
    for _ in 0..num_loops {
        let poll = Arc::new(Poller::new()?);
        for listener in &listeners {
            poll.add_read(listener.fd())?;
        }
        loop_handles.push(LoopHandle {
            poll,
            count: Arc::new(AtomicI32::new(0)),
        });
    }

    let (tick_tx, tick_rx) = crossbeam_channel::bounded(1);
    let shared = Arc::new(Shared {
        handler,
        listeners,
        balance: config.load_balance,
        accepted: AtomicUsize::new(0),
        loops: loop_handles,
        tick_tx,
        shutdown: Mutex::new(false),
        shutdown_cond: Condvar::new(),
    });

    let mut joins = Vec::with_capacity(num_loops);
    for idx in 0..num_loops {
        let shared_for_thread = shared.clone();
        let tick_rx = (idx == 0 && config.tick).then(|| tick_rx.clone());
        let read_buffer_size = config.read_buffer_size;
        let spawned = thread::Builder::new()
            .name(format!("levio-loop-{idx}"))
            .spawn(move || {
                let shared = shared_for_thread;
                if let Some(rx) = tick_rx {
                    spawn_ticker(shared.loops[0].poll.clone(), rx);
                }
                let mut state = LoopState::new(
                    idx,
                    shared.loops[idx].poll.clone(),
                    shared.loops[idx].count.clone(),
                    read_buffer_size,
                );
                let result = match event_loop::run(&shared, &mut state) {
                    Err(Error::Closing) => Ok(()),
                    other => other,
                };
                shared.signal_shutdown();
                (result, state.into_conns())
            });
        match spawned {
            Ok(join) => joins.push(join),
            Err(e) => {
                // Unwind the loops that did start before bailing out.
                for handle in &shared.loops {
                    let _ = handle.poll.trigger(Note::Closing);
                }
                for join in joins {
                    let _ = join.join();
                }
                return Err(Error::Io(e));
            }
        }
    }
    drop(tick_rx);

    info!(num_loops, "server started");
    shared.wait_for_shutdown();
    debug!("shutdown signalled");

    // Tell every loop that is still blocked in its wait to unwind.
    for handle in &shared.loops {
        let _ = handle.poll.trigger(Note::Closing);
    }

    let mut first_err = None;
    for join in joins {
        match join.join() {
            Ok((result, conns)) => {
                if let Err(e) = result
                    && first_err.is_none()
                {
                    first_err = Some(e);
                }
                // Residual connections still get their closed callback.
                for (fd, mut conn) in conns {
                    unsafe {
                        libc::close(fd);
                    }
                    let _ = shared.handler.closed(&mut conn, None);
                }
            }
            Err(_) => {
                if first_err.is_none() {
                    first_err = Some(Error::Io(io::Error::other("event loop thread panicked")));
                }
            }
        }
    }

    for handle in &shared.loops {
        handle.poll.close();
    }

    info!("server stopped");
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// The ticker repeatedly pokes loop 0 and sleeps for whatever delay the
/// tick callback returned. It stops when the loop is gone: either the
/// trigger fails or the delay channel disconnects during unwind.
fn spawn_ticker(poll: Arc<Poller>, delays: Receiver<Duration>) {
    let spawned = thread::Builder::new()
        .name("levio-ticker".to_string())
        .spawn(move || {
            loop {
                if poll.trigger(Note::Tick).is_err() {
                    break;
                }
                match delays.recv() {
                    Ok(delay) => thread::sleep(delay),
                    Err(_) => break,
                }
            }
        });
    if let Err(e) = spawned {
        warn!(error = %e, "failed to spawn ticker thread");
    }
}
