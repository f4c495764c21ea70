use std::net::TcpListener;

use crate::error::ClusterError;

const MAX_ATTEMPTS: usize = 10;

/// Finds a loopback TCP port that is currently free.
///
/// Binds port 0 to let the OS assign one, releases it, then re-binds the
/// same port number to confirm it is still free. There is an inherent
/// TOCTOU race between that confirmation and the caller actually using the
/// port; callers are expected to tolerate it (the supervisor reaps and
/// replaces a worker whose subprocess fails to bind).
pub fn allocate_port() -> Result<u16, ClusterError> {
    for _ in 0..MAX_ATTEMPTS {
        let Ok(port) = TcpListener::bind(("127.0.0.1", 0)).and_then(|l| l.local_addr()) else {
            continue;
        };
        let port = port.port();
        // The probing listener above is dropped here, releasing the port.
        if TcpListener::bind(("127.0.0.1", port)).is_ok() {
            return Ok(port);
        }
    }
    Err(ClusterError::PortUnavailable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_a_bindable_port() {
        let port = allocate_port().expect("a port should be available in CI");
        assert!(port > 0);
        // The allocator must release the port before returning it.
        let listener = TcpListener::bind(("127.0.0.1", port));
        assert!(listener.is_ok());
    }

    #[test]
    fn allocates_distinct_ports_when_held() {
        let port_a = allocate_port().unwrap();
        let _held = TcpListener::bind(("127.0.0.1", port_a)).unwrap();
        let port_b = allocate_port().unwrap();
        assert_ne!(port_a, port_b);
    }
}
