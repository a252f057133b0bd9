//! Worker port allocation.
//!
//! Reservations live in the state store, keyed by the operation (or, once
//! bound, the worker) that owns them. Check-and-reserve runs inside one
//! store transaction, so two concurrent callers never receive the same
//! port and a replayed operation gets back the port it already holds.

use std::net::{IpAddr, SocketAddr, TcpListener};
use std::ops::RangeInclusive;

use thiserror::Error;
use tracing::{debug, info};

use crate::config::PortsConfig;
use crate::store::{Store, StoreError};

/// Port allocation errors.
#[derive(Debug, Error)]
pub enum PortError {
    /// Every port in the range is reserved or in use.
    #[error("no free port in {start}..={end}")]
    Exhausted { start: u16, end: u16 },

    /// The reservation could not be read or written.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Hands out ports from a fixed inclusive range.
#[derive(Clone)]
pub struct PortAllocator {
    store: Store,
    range: RangeInclusive<u16>,
    skip_bound: bool,
    host: IpAddr,
}

impl PortAllocator {
    /// Create an allocator over the configured range. Workers bind on `host`.
    pub fn new(store: Store, config: &PortsConfig, host: IpAddr) -> Self {
        Self {
            store,
            range: config.range_start..=config.range_end,
            skip_bound: config.skip_bound,
            host,
        }
    }

    pub fn range(&self) -> RangeInclusive<u16> {
        self.range.clone()
    }

    /// Reserve a port for `owner`, or return the one it already holds.
    pub fn allocate(&self, owner: &str) -> Result<u16, PortError> {
        let skip_bound = self.skip_bound;
        let host = self.host;
        let port = self
            .store
            .reserve_port(owner, self.range.clone(), |port| {
                !skip_bound || is_port_free(host, port)
            })?
            .ok_or(PortError::Exhausted {
                start: *self.range.start(),
                end: *self.range.end(),
            })?;

        debug!(owner = %owner, port = port, "port reserved");
        Ok(port)
    }

    /// Return a port to the pool. Safe to call more than once.
    pub fn release(&self, port: u16) -> Result<(), PortError> {
        if self.store.release_port(port)? {
            info!(port = port, "port released");
        }
        Ok(())
    }
}

/// Whether nothing else on this host is bound to `port`.
fn is_port_free(host: IpAddr, port: u16) -> bool {
    TcpListener::bind(SocketAddr::new(host, port)).is_ok()
}
