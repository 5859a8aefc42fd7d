//! Ticker-driven shutdown: a tick callback returning Shutdown unwinds
//! the whole server and fires `closed` for every live connection.

use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam_channel::{Sender, unbounded};

use levio::{Action, Config, Conn, EventHandler, OpenOptions, ServerInfo};

struct TickShutdown {
    addr_tx: Sender<SocketAddr>,
    opened: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
    ticks: Arc<AtomicUsize>,
}

impl EventHandler for TickShutdown {
    fn serving(&self, server: &ServerInfo) -> Action {
        let _ = self.addr_tx.send(server.addrs[0].as_socket().unwrap());
        Action::None
    }

    fn opened(&self, _conn: &mut Conn) -> (Option<Vec<u8>>, OpenOptions, Action) {
        self.opened.fetch_add(1, Ordering::SeqCst);
        (None, OpenOptions::default(), Action::None)
    }

    fn closed(&self, _conn: &mut Conn, _err: Option<std::io::Error>) -> Action {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Action::None
    }

    fn tick(&self) -> (Duration, Action) {
        self.ticks.fetch_add(1, Ordering::SeqCst);
        // Tick fast until the client is in, then pull the plug.
        if self.opened.load(Ordering::SeqCst) > 0 {
            (Duration::from_millis(10), Action::Shutdown)
        } else {
            (Duration::from_millis(10), Action::None)
        }
    }
}

#[test]
fn tick_shutdown_closes_live_connections() {
    let (addr_tx, addr_rx) = unbounded();
    let opened = Arc::new(AtomicUsize::new(0));
    let closed = Arc::new(AtomicUsize::new(0));
    let ticks = Arc::new(AtomicUsize::new(0));
    let handler = TickShutdown {
        addr_tx,
        opened: opened.clone(),
        closed: closed.clone(),
        ticks: ticks.clone(),
    };
    let config = Config {
        tick: true,
        ..Config::default()
    };
    let join = std::thread::spawn(move || {
        levio::serve(handler, &["tcp://127.0.0.1:0"], config).unwrap();
    });

    let addr = addr_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let _client = TcpStream::connect(addr).unwrap();

    join.join().unwrap();
    assert!(ticks.load(Ordering::SeqCst) >= 1);
    assert_eq!(opened.load(Ordering::SeqCst), 1);
    assert_eq!(closed.load(Ordering::SeqCst), 1);
}
