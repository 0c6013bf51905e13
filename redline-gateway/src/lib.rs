//! Redline gateway library surface, exposed for integration tests.

pub mod api;
pub mod config;

use anyhow::Result;
use tokio::net::TcpListener;

/// Check if a port is available.
pub async fn is_port_available(port: u16) -> bool {
    TcpListener::bind(format!("127.0.0.1:{port}")).await.is_ok()
}

/// Find an available port starting from the preferred port.
pub async fn find_available_port(preferred_port: u16) -> Result<u16> {
    if is_port_available(preferred_port).await {
        return Ok(preferred_port);
    }

    for offset in 1..=100 {
        let port = preferred_port.saturating_add(offset);
        if port == 0 {
            break;
        }
        if is_port_available(port).await {
            return Ok(port);
        }
    }

    Err(anyhow::anyhow!(
        "No available ports found near {preferred_port}"
    ))
}
