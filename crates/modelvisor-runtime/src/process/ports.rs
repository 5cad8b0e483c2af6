//! Port allocation for engine subprocesses.
//!
//! Ports are tracked as offsets from a base port (the server's own port).
//! Offset 0 is the server itself and is never handed out.

use std::net::TcpListener;
use tracing::debug;

use modelvisor_core::EngineError;

/// Check if a port is available by attempting to bind to it.
/// The listener is dropped immediately, releasing the port.
pub fn is_port_available(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok_and(|listener| listener.local_addr().is_ok())
}

/// In-use flags indexed by offset from `base`.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    base: u16,
    in_use: Vec<bool>,
    verify_free: bool,
}

impl PortAllocator {
    /// `verify_free` additionally skips ports another program already holds.
    pub fn new(base: u16, verify_free: bool) -> Self {
        Self {
            base,
            in_use: vec![true],
            verify_free,
        }
    }

    pub const fn base(&self) -> u16 {
        self.base
    }

    /// Port for `offset`, if it fits in `u16`.
    pub fn port_for(&self, offset: u16) -> Option<u16> {
        self.base.checked_add(offset)
    }

    pub fn is_in_use(&self, offset: u16) -> bool {
        self.in_use
            .get(usize::from(offset))
            .copied()
            .unwrap_or(false)
    }

    /// Claim the lowest free offset in `1..=max_attempts`.
    pub fn allocate(&mut self, max_attempts: u16) -> Result<u16, EngineError> {
        for offset in 1..=max_attempts {
            if self.is_in_use(offset) {
                continue;
            }
            let Some(port) = self.port_for(offset) else {
                break;
            };
            if self.verify_free && !is_port_available(port) {
                debug!(port, "Port unavailable on system, skipping");
                continue;
            }

            let index = usize::from(offset);
            if self.in_use.len() <= index {
                self.in_use.resize(index + 1, false);
            }
            self.in_use[index] = true;
            debug!(port, offset, "Allocated port");
            return Ok(offset);
        }

        Err(EngineError::PortExhaustion {
            attempts: max_attempts,
        })
    }

    /// Return `offset` to the pool. Offset 0 stays reserved.
    pub fn release(&mut self, offset: u16) {
        if offset == 0 {
            return;
        }
        if let Some(flag) = self.in_use.get_mut(usize::from(offset)) {
            *flag = false;
        }
    }

    /// Number of offsets currently held by models.
    pub fn allocated(&self) -> usize {
        self.in_use.iter().skip(1).filter(|used| **used).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_zero_is_never_allocated() {
        let mut ports = PortAllocator::new(39000, false);
        assert!(ports.is_in_use(0));
        assert_eq!(ports.allocate(100).unwrap(), 1);
        assert_eq!(ports.allocate(100).unwrap(), 2);
        ports.release(0);
        assert!(ports.is_in_use(0));
    }

    #[test]
    fn released_offsets_are_reused_lowest_first() {
        let mut ports = PortAllocator::new(39000, false);
        for _ in 0..3 {
            ports.allocate(100).unwrap();
        }
        ports.release(2);
        assert_eq!(ports.allocate(100).unwrap(), 2);
        assert_eq!(ports.allocated(), 3);
    }

    #[test]
    fn scan_is_bounded() {
        let mut ports = PortAllocator::new(39000, false);
        ports.allocate(2).unwrap();
        ports.allocate(2).unwrap();
        assert!(matches!(
            ports.allocate(2),
            Err(EngineError::PortExhaustion { attempts: 2 })
        ));
    }

    #[test]
    fn overflowing_ports_are_not_handed_out() {
        let mut ports = PortAllocator::new(u16::MAX - 1, false);
        assert_eq!(ports.allocate(10).unwrap(), 1);
        assert!(ports.allocate(10).is_err());
    }

    #[test]
    fn verify_free_skips_bound_ports() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = listener.local_addr().unwrap().port();
        let mut ports = PortAllocator::new(taken - 1, true);

        let offset = ports.allocate(100).unwrap();
        assert_ne!(ports.port_for(offset), Some(taken));
    }
}
