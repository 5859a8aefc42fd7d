//! Wake-driven pushes: an external thread schedules a `data` call with
//! empty input on the connection's loop.

use std::io::Read;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam_channel::{Sender, unbounded};
use parking_lot::Mutex;

use levio::{Action, Config, Conn, EventHandler, OpenOptions, ServerInfo, Waker};

struct Push {
    addr_tx: Sender<SocketAddr>,
    waker: Arc<Mutex<Option<Waker>>>,
    wake_data_calls: Arc<AtomicUsize>,
}

impl EventHandler for Push {
    fn serving(&self, server: &ServerInfo) -> Action {
        let _ = self.addr_tx.send(server.addrs[0].as_socket().unwrap());
        Action::None
    }

    fn opened(&self, conn: &mut Conn) -> (Option<Vec<u8>>, OpenOptions, Action) {
        *self.waker.lock() = Some(conn.waker());
        (None, OpenOptions::default(), Action::None)
    }

    fn data(&self, _conn: &mut Conn, input: &[u8]) -> (Option<Vec<u8>>, Action) {
        assert!(input.is_empty(), "wake should deliver empty input");
        self.wake_data_calls.fetch_add(1, Ordering::SeqCst);
        (Some(b"ping".to_vec()), Action::None)
    }

    fn closed(&self, _conn: &mut Conn, _err: Option<std::io::Error>) -> Action {
        Action::Shutdown
    }
}

#[test]
fn wake_pushes_bytes_to_client() {
    let (addr_tx, addr_rx) = unbounded();
    let waker = Arc::new(Mutex::new(None));
    let wake_data_calls = Arc::new(AtomicUsize::new(0));
    let handler = Push {
        addr_tx,
        waker: waker.clone(),
        wake_data_calls: wake_data_calls.clone(),
    };
    let join = std::thread::spawn(move || {
        levio::serve(handler, &["tcp://127.0.0.1:0"], Config::default()).unwrap();
    });

    let addr = addr_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let mut client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    // The open callback runs on the connection's first readiness event;
    // wait for it to publish the waker.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    let waker = loop {
        if let Some(waker) = waker.lock().clone() {
            break waker;
        }
        assert!(std::time::Instant::now() < deadline, "opened never fired");
        std::thread::sleep(Duration::from_millis(1));
    };

    std::thread::sleep(Duration::from_millis(10));
    assert!(waker.wake());

    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ping");
    assert_eq!(wake_data_calls.load(Ordering::SeqCst), 1);

    drop(client);
    join.join().unwrap();
}
