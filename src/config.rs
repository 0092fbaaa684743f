use std::fs::File;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;

use serde::Deserialize;

use crate::error::Error;

/// Default per-socket buffer capacity (8 KiB), used when a configured
/// size of zero is given.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Gateway configuration.
///
/// Constructed once at startup and passed to `Server::new`; the core never
/// mutates it.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// address to listen on for FTP command connections
    pub listen_ip: IpAddr,
    pub listen_port: u16,
    /// upstream FTP server the command channel is relayed to
    pub upstream_addr: SocketAddr,
    /// per-socket buffer capacity; 0 selects `DEFAULT_BUFFER_SIZE`
    pub buffer_size: usize,
    /// backlog passed to listen(2)
    pub backlog: i32,
}

impl GatewayConfig {
    pub fn new(listen_ip: IpAddr, listen_port: u16, upstream_addr: SocketAddr) -> Self {
        Self {
            listen_ip,
            listen_port,
            upstream_addr,
            ..Self::default()
        }
    }

    pub fn with_file(path: &Path) -> Result<Self, Error> {
        let file = File::open(path)?;
        serde_yaml::from_reader(file).map_err(|err| Error::config(err.to_string()))
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_ip, self.listen_port)
    }

    /// Effective buffer capacity; never zero.
    pub fn buffer_size(&self) -> usize {
        if self.buffer_size == 0 {
            DEFAULT_BUFFER_SIZE
        } else {
            self.buffer_size
        }
    }

    pub fn set_buffer_size(&mut self, size: usize) -> &mut Self {
        self.buffer_size = size;
        self
    }

    pub fn set_backlog(&mut self, backlog: i32) -> &mut Self {
        self.backlog = backlog;
        self
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            listen_ip: Ipv4Addr::new(0, 0, 0, 0).into(),
            listen_port: 2121,
            upstream_addr: SocketAddr::new(Ipv4Addr::new(127, 0, 0, 1).into(), 21),
            buffer_size: DEFAULT_BUFFER_SIZE,
            backlog: 128,
        }
    }
}
