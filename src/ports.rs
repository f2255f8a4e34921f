//! Loopback port allocation for website processes

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{Ipv4Addr, TcpListener};
use tracing::debug;

/// Probing continues here after passing 65535
pub const PORT_WRAP_START: u16 = 1000;

/// Hands out loopback ports to website processes.
///
/// Claims live in process memory only. A port stored in a website record is
/// a hint that is honoured only if it is still unclaimed and bindable.
#[derive(Debug)]
pub struct PortAllocator {
    start: u16,
    /// port -> owning resource key
    claims: Mutex<HashMap<u16, String>>,
}

impl PortAllocator {
    pub fn new(start: u16) -> Self {
        Self {
            start,
            claims: Mutex::new(HashMap::new()),
        }
    }

    /// Whether nothing is currently bound on the loopback interface at `port`
    pub fn is_free(port: u16) -> bool {
        port != 0 && TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
    }

    /// Claim a port for `owner`, preferring `hint` when it is still usable.
    ///
    /// Probing starts at the configured start port, skips ports claimed by
    /// other owners or already bound, and wraps to [`PORT_WRAP_START`] past 65535.
    pub fn allocate(&self, owner: &str, hint: Option<u16>) -> Option<u16> {
        let mut claims = self.claims.lock();

        if let Some(port) = hint {
            let available = claims.get(&port).map_or(true, |o| o == owner);
            if available && Self::is_free(port) {
                claims.retain(|p, o| o != owner || *p == port);
                claims.insert(port, owner.to_string());
                return Some(port);
            }
        }

        claims.retain(|_, o| o != owner);

        let span = u32::from(u16::MAX - PORT_WRAP_START) + 1;
        let mut candidate = self.start.max(PORT_WRAP_START);
        for _ in 0..span {
            if !claims.contains_key(&candidate) && Self::is_free(candidate) {
                claims.insert(candidate, owner.to_string());
                debug!(owner, port = candidate, "Port allocated");
                return Some(candidate);
            }
            candidate = if candidate == u16::MAX {
                PORT_WRAP_START
            } else {
                candidate + 1
            };
        }
        None
    }

    /// Drop every claim held by `owner`
    pub fn release(&self, owner: &str) {
        self.claims.lock().retain(|_, o| o != owner);
    }

    pub fn owner_of(&self, port: u16) -> Option<String> {
        self.claims.lock().get(&port).cloned()
    }
}
