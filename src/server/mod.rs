//! HTTP and WebSocket server.
//!
//! - [`routes`]: axum router, REST handlers, startup and shutdown
//! - [`websocket`]: one task per connection speaking the sync protocol

pub mod routes;
pub mod websocket;

use std::net::{IpAddr, SocketAddr, TcpListener};

pub use routes::{AppState, build_router, serve, start_server};

/// Default port for `cograph serve`
pub const DEFAULT_PORT: u16 = 3055;

/// How many ports above the requested one to try
const PORT_SEARCH_RANGE: u16 = 20;

/// Find a free port at or above `start` on `host`.
///
/// Returns `None` if the host does not parse or nothing in range is free.
pub fn find_available_port(host: &str, start: u16) -> Option<u16> {
    let ip: IpAddr = host.parse().ok()?;
    (start..start.saturating_add(PORT_SEARCH_RANGE))
        .find(|port| TcpListener::bind(SocketAddr::from((ip, *port))).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_available_port_skips_taken() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let found = find_available_port("127.0.0.1", port).unwrap();
        assert_ne!(found, port);
    }

    #[test]
    fn test_find_available_port_bad_host() {
        assert_eq!(find_available_port("not-an-ip", DEFAULT_PORT), None);
    }
}
