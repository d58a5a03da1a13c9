use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::transport::server_address::ServerAddress;
use crate::util::random::Random;

struct PoolEntry {
    addr: ServerAddress,
    lame_duck_until: Option<Instant>,
}
impl PoolEntry {
    fn is_lame_duck(&self, now: Instant) -> bool {
        self.lame_duck_until.map_or(false, |until| now < until)
    }
}

/// The servers the client may connect to: the configured seeds plus whatever the cluster
///  advertises. Servers in lame duck mode are avoided for a while.
pub struct ServerPool {
    entries: Vec<PoolEntry>,
    lame_duck_backoff: Duration,
}
impl ServerPool {
    pub fn new(seeds: Vec<ServerAddress>, lame_duck_backoff: Duration) -> ServerPool {
        let mut pool = ServerPool {
            entries: vec![],
            lame_duck_backoff,
        };
        for addr in seeds {
            pool.add(addr);
        }
        pool
    }

    /// returns `false` if the pool already contains the server
    pub fn add(&mut self, addr: ServerAddress) -> bool {
        if self.entries.iter().any(|e| e.addr.same_endpoint(&addr)) {
            return false;
        }
        self.entries.push(PoolEntry {
            addr,
            lame_duck_until: None,
        });
        true
    }

    /// Adds cluster addresses advertised by a server, which come without scheme and
    ///  credentials: those are taken from the server that advertised them. Returns the
    ///  addresses that were new.
    pub fn add_discovered(&mut self, urls: &[String], advertised_by: &ServerAddress) -> Vec<String> {
        let mut added = vec![];
        for url in urls {
            match ServerAddress::parse_discovered(url, advertised_by) {
                Ok(addr) => {
                    let display = addr.to_string();
                    if self.add(addr) {
                        added.push(display);
                    }
                }
                Err(e) => warn!("ignoring advertised server address {:?}: {}", url, e),
            }
        }
        if !added.is_empty() {
            debug!("added {} discovered servers to the pool", added.len());
        }
        added
    }

    pub fn mark_lame_duck(&mut self, addr: &ServerAddress, now: Instant) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.addr.same_endpoint(addr)) {
            debug!("avoiding {} for {:?}", addr, self.lame_duck_backoff);
            entry.lame_duck_until = Some(now + self.lame_duck_backoff);
        }
    }

    /// Picks a random server among those not in lame duck mode. If all servers are in lame duck
    ///  mode, the pick is among all of them.
    pub fn next_server<R: Random>(&self, now: Instant) -> Option<ServerAddress> {
        let mut candidates = self.entries.iter()
            .filter(|e| !e.is_lame_duck(now))
            .collect::<Vec<_>>();
        if candidates.is_empty() {
            candidates = self.entries.iter().collect();
        }

        match candidates.len() {
            0 => None,
            1 => Some(candidates[0].addr.clone()),
            n => Some(candidates[R::gen_usize_range(0..n)].addr.clone()),
        }
    }

    pub fn addresses(&self) -> Vec<ServerAddress> {
        self.entries.iter()
            .map(|e| e.addr.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
