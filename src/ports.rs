//! Host port allocation
//!
//! Ports are picked by sampling a random candidate and checking that it can
//! be bound locally. Nothing is reserved: the runtime's create call is the
//! final arbiter, and a port taken in between surfaces as a creation failure.

use std::net::{Ipv4Addr, TcpListener};

use rand::Rng;
use tracing::debug;

use crate::error::{BerthError, Result};

/// Checks whether a host port is free right now
pub trait PortProbe: Send + Sync {
    fn is_free(&self, port: u16) -> bool;
}

/// Binds `0.0.0.0:port` and releases it immediately
#[derive(Debug, Clone, Copy, Default)]
pub struct BindProbe;

impl PortProbe for BindProbe {
    fn is_free(&self, port: u16) -> bool {
        match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)) {
            Ok(_) => true,
            Err(e) => {
                debug!(port, error = %e, "port unavailable");
                false
            }
        }
    }
}

impl<F> PortProbe for F
where
    F: Fn(u16) -> bool + Send + Sync,
{
    fn is_free(&self, port: u16) -> bool {
        self(port)
    }
}

/// Picks free host ports in `[preferred, 65535]`
pub struct PortAllocator {
    probe: Box<dyn PortProbe>,
    max_attempts: Option<usize>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::with_probe(BindProbe)
    }

    pub fn with_probe(probe: impl PortProbe + 'static) -> Self {
        Self {
            probe: Box::new(probe),
            max_attempts: None,
        }
    }

    /// Give up after `attempts` candidates instead of sampling forever
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Return a port in `[preferred, 65535]` that was bindable when probed.
    pub fn allocate(&self, preferred: u16) -> Result<u16> {
        let mut rng = rand::thread_rng();
        let mut attempts = 0usize;

        loop {
            if let Some(max) = self.max_attempts {
                if attempts >= max {
                    return Err(BerthError::Runtime(format!(
                        "no free host port in [{}, 65535] after {} attempts",
                        preferred, attempts
                    )));
                }
            }
            attempts += 1;

            let candidate = rng.gen_range(preferred..=u16::MAX);
            if self.probe.is_free(candidate) {
                debug!(port = candidate, attempts, "allocated host port");
                return Ok(candidate);
            }
        }
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PortAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortAllocator")
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}
