use clap::Parser;
use tracing_subscriber::EnvFilter;

use levio::{Action, Config, Conn, EventHandler, ServerInfo};

#[derive(Parser)]
#[command(about = "UDP echo server")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "udp://127.0.0.1:7878")]
    addr: String,
}

struct Echo;

impl EventHandler for Echo {
    fn serving(&self, server: &ServerInfo) -> Action {
        tracing::info!(addrs = ?server.addrs, "serving");
        Action::None
    }

    fn data(&self, conn: &mut Conn, input: &[u8]) -> (Option<Vec<u8>>, Action) {
        tracing::debug!(peer = ?conn.peer_addr(), len = input.len(), "datagram");
        (Some(input.to_vec()), Action::None)
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    if let Err(e) = levio::serve(Echo, &[args.addr.as_str()], Config::default()) {
        eprintln!("server error: {e}");
        std::process::exit(1);
    }
}
