//! Reverse SSH tunnels through public forwarding services.
//!
//! This module provides:
//! - `TunnelEngine` / `open_tunnel` - open a tunnel and get its public URL
//! - `ServiceRegistry` - the known services and random selection among them
//! - `is_ssh_installed` - preflight probe for the system ssh binary
//! - `EventSink` - where lifecycle notifications go

mod buffer;
mod error;
mod events;
mod launcher;
mod preflight;
mod registry;
mod tunnel;
mod types;

pub use buffer::OutputBuffer;
pub use error::{Result, TunnelError};
pub use events::{ChannelSink, EventSink, Level, TracingSink, TunnelEvent, TunnelId, TunnelState};
pub use launcher::{ChildProcess, Launcher, ProcessOutput, Spawned, SystemLauncher};
pub use preflight::{SSH_PROGRAM, is_client_installed, is_ssh_installed};
pub use registry::{ServiceRegistry, ServiceTable, default_services_path};
pub use tunnel::{Tunnel, TunnelEngine, open_tunnel};
pub use types::{
    DEFAULT_SSH_PORT, DEFAULT_URL_TIMEOUT, Service, ServiceRef, TunnelOptions, TunnelRequest,
    UrlPattern,
};
