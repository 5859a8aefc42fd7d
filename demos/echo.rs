use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use levio::{Action, Config, Conn, EventHandler, LoadBalance, OpenOptions, ServerInfo};

#[derive(Clone, Copy, ValueEnum)]
enum Balance {
    Random,
    RoundRobin,
    LeastConnections,
}

#[derive(Parser)]
#[command(about = "TCP echo server")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "tcp://127.0.0.1:7878")]
    addr: String,
    /// Number of event loops. 0 = one per CPU.
    #[arg(long, default_value_t = 1)]
    loops: usize,
    /// How accepts are spread across loops.
    #[arg(long, value_enum, default_value = "random")]
    balance: Balance,
}

struct Echo;

impl EventHandler for Echo {
    fn serving(&self, server: &ServerInfo) -> Action {
        tracing::info!(num_loops = server.num_loops, addrs = ?server.addrs, "serving");
        Action::None
    }

    fn opened(&self, conn: &mut Conn) -> (Option<Vec<u8>>, OpenOptions, Action) {
        tracing::debug!(peer = ?conn.peer_addr(), "opened");
        let opts = OpenOptions {
            reuse_input_buffer: true,
            ..OpenOptions::default()
        };
        (None, opts, Action::None)
    }

    fn data(&self, _conn: &mut Conn, input: &[u8]) -> (Option<Vec<u8>>, Action) {
        (Some(input.to_vec()), Action::None)
    }

    fn closed(&self, conn: &mut Conn, err: Option<std::io::Error>) -> Action {
        tracing::debug!(peer = ?conn.peer_addr(), ?err, "closed");
        Action::None
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = Config {
        num_loops: args.loops,
        load_balance: match args.balance {
            Balance::Random => LoadBalance::Random,
            Balance::RoundRobin => LoadBalance::RoundRobin,
            Balance::LeastConnections => LoadBalance::LeastConnections,
        },
        ..Config::default()
    };

    if let Err(e) = levio::serve(Echo, &[args.addr.as_str()], config) {
        eprintln!("server error: {e}");
        std::process::exit(1);
    }
}
