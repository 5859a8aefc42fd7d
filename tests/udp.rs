//! UDP listeners: one `data` call per datagram, reply sent to the sender.

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam_channel::{Sender, unbounded};

use levio::{Action, Config, Conn, EventHandler, ServerInfo};

struct UdpEcho {
    addr_tx: Sender<SocketAddr>,
    data_calls: Arc<AtomicUsize>,
    opened: Arc<AtomicUsize>,
}

impl EventHandler for UdpEcho {
    fn serving(&self, server: &ServerInfo) -> Action {
        let _ = self.addr_tx.send(server.addrs[0].as_socket().unwrap());
        Action::None
    }

    fn opened(&self, _conn: &mut Conn) -> (Option<Vec<u8>>, levio::OpenOptions, Action) {
        self.opened.fetch_add(1, Ordering::SeqCst);
        (None, levio::OpenOptions::default(), Action::None)
    }

    fn data(&self, conn: &mut Conn, input: &[u8]) -> (Option<Vec<u8>>, Action) {
        assert!(conn.peer_addr().is_some());
        self.data_calls.fetch_add(1, Ordering::SeqCst);
        if input == b"quit" {
            (None, Action::Shutdown)
        } else {
            (Some(input.to_vec()), Action::None)
        }
    }
}

#[test]
fn datagrams_echo_to_sender() {
    let (addr_tx, addr_rx) = unbounded();
    let data_calls = Arc::new(AtomicUsize::new(0));
    let opened = Arc::new(AtomicUsize::new(0));
    let handler = UdpEcho {
        addr_tx,
        data_calls: data_calls.clone(),
        opened: opened.clone(),
    };
    let join = std::thread::spawn(move || {
        levio::serve(handler, &["udp://127.0.0.1:0"], Config::default()).unwrap();
    });

    let addr = addr_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    let mut buf = [0u8; 16];
    for payload in [&b"ping"[..], &b"pong"[..]] {
        client.send_to(payload, addr).unwrap();
        let (n, from) = client.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], payload);
        assert_eq!(from, addr);
    }
    assert_eq!(data_calls.load(Ordering::SeqCst), 2);

    client.send_to(b"quit", addr).unwrap();
    join.join().unwrap();
    assert_eq!(data_calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        opened.load(Ordering::SeqCst),
        0,
        "UDP datagrams must not run the open path"
    );
}
