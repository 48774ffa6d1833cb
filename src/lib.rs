//! Expose a local port on the public internet through a reverse SSH tunnel.
//!
//! Uses the system `ssh` client against free forwarding services such as
//! `localhost.run`, `serveo.net` and `pinggy.io`.
//!
//! ```rust,no_run
//! use sshtunnel::{TunnelOptions, open_tunnel};
//!
//! # async fn example() -> sshtunnel::Result<()> {
//! let mut tunnel = open_tunnel(TunnelOptions::new(8000)).await?;
//! println!("Public URL: {}", tunnel.url());
//! tunnel.close().await;
//! # Ok(())
//! # }
//! ```

pub mod ssh;

pub use ssh::{
    Result, Service, ServiceRef, ServiceRegistry, Tunnel, TunnelEngine, TunnelError,
    TunnelOptions, is_ssh_installed, open_tunnel,
};
