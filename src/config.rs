/// How newly readable listeners are assigned to event loops.
///
/// Every loop registers every listening socket, so a pending connection
/// wakes all of them; the balancing mode decides which loop actually
/// accepts. The others leave the readiness unconsumed and it re-fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadBalance {
    /// Accept on whichever loop the kernel happens to wake first.
    #[default]
    Random,
    /// Accept in strict rotation across loops.
    RoundRobin,
    /// Accept only on a loop with the fewest open connections.
    LeastConnections,
}

/// Configuration for a server.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of event loops. 0 = one per CPU.
    pub num_loops: usize,
    /// How accepts are distributed across loops.
    pub load_balance: LoadBalance,
    /// Spawn the ticker thread that drives `EventHandler::tick` on loop 0.
    pub tick: bool,
    /// Listen backlog for stream listeners.
    pub backlog: i32,
    /// Size of each loop's shared read buffer in bytes.
    pub read_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_loops: 1,
            load_balance: LoadBalance::Random,
            tick: false,
            backlog: 1024,
            read_buffer_size: 64 * 1024,
        }
    }
}

/// Get the number of available CPU cores.
pub(crate) fn num_cpus() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if ret < 1 { 1 } else { ret as usize }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.num_loops, 1);
        assert_eq!(config.load_balance, LoadBalance::Random);
        assert!(!config.tick);
        assert_eq!(config.read_buffer_size, 64 * 1024);
    }

    #[test]
    fn num_cpus_positive() {
        assert!(num_cpus() >= 1);
    }
}
