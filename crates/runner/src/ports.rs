use std::{collections::HashSet, net::TcpListener, ops::Range};

/// True when nothing is listening on the port.
pub fn port_is_free(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).is_ok()
}

/// Lowest port in `range` that no live entry holds and that is not bound by
/// anything else, such as a worker that outlived its entry.
pub fn allocate_port(range: Range<u16>, in_use: &HashSet<u16>) -> Option<u16> {
    range
        .filter(|port| !in_use.contains(port))
        .find(|port| {
            let free = port_is_free(*port);
            if !free {
                tracing::warn!("Port {port} is bound by another process, skipping");
            }
            free
        })
}
