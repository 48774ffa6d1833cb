//! Notifications emitted while a tunnel is opened and closed.
//!
//! The engine never reads these back. Sinks decide where they go:
//! - `TracingSink` - forwards to `tracing` (the default)
//! - `ChannelSink` - pushes into an async channel for subscribers
//! - any `Fn(TunnelId, &TunnelEvent)` closure

use async_channel::{Receiver, Sender};
use uuid::Uuid;

/// Identifies one `open` call chain, across all its attempts
pub type TunnelId = Uuid;

/// Lifecycle states of an `open` call chain
#[derive(Debug, Clone, PartialEq)]
pub enum TunnelState {
    /// Checking that the ssh client runs
    Preflighting,
    /// Starting ssh against a service
    Spawning { service: String },
    /// ssh is up, reading its output for the URL
    AwaitingUrl,
    /// The last service gave no URL; picking another
    Retrying { excluded: usize },
    /// URL found, handle returned to the caller
    Resolved { url: String },
    /// Terminal failure
    Failed { error: String },
    /// Termination requested by the caller
    Closing,
    /// Subprocess released
    Closed,
}

impl TunnelState {
    /// Returns true if no further transition can follow without a new call
    pub fn is_terminal(&self) -> bool {
        matches!(self, TunnelState::Failed { .. } | TunnelState::Closed)
    }

    /// Returns the public URL if resolved
    pub fn url(&self) -> Option<&str> {
        match self {
            TunnelState::Resolved { url } => Some(url),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TunnelEvent {
    StateChanged(TunnelState),
    CommandIssued {
        program: String,
        args: Vec<String>,
    },
    UrlFound {
        url: String,
    },
    UrlNotFound {
        service: String,
        output: String,
        timed_out: bool,
    },
    /// A termination request failed, usually because ssh had already exited
    TerminationSwallowed {
        error: String,
    },
}

impl TunnelEvent {
    pub fn level(&self) -> Level {
        match self {
            TunnelEvent::StateChanged(TunnelState::Failed { .. }) => Level::Warn,
            TunnelEvent::StateChanged(_) => Level::Debug,
            TunnelEvent::CommandIssued { .. } => Level::Debug,
            TunnelEvent::UrlFound { .. } => Level::Info,
            TunnelEvent::UrlNotFound { .. } => Level::Error,
            TunnelEvent::TerminationSwallowed { .. } => Level::Debug,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            TunnelEvent::StateChanged(TunnelState::Failed { .. }) => "Tunnel failed",
            TunnelEvent::StateChanged(_) => "Tunnel state changed",
            TunnelEvent::CommandIssued { .. } => "Spawning the ssh process",
            TunnelEvent::UrlFound { .. } => "The tunnel URL is found",
            TunnelEvent::UrlNotFound { .. } => "The tunnel URL is not found",
            TunnelEvent::TerminationSwallowed { .. } => "Ignoring failed termination request",
        }
    }

    /// Structured fields, in a fixed order per event kind
    pub fn fields(&self) -> Vec<(&'static str, String)> {
        match self {
            TunnelEvent::StateChanged(TunnelState::Failed { error }) => {
                vec![("error", error.clone())]
            }
            TunnelEvent::StateChanged(state) => vec![("state", format!("{:?}", state))],
            TunnelEvent::CommandIssued { program, args } => vec![
                ("command", program.clone()),
                ("args", args.join(" ")),
            ],
            TunnelEvent::UrlFound { url } => vec![("url", url.clone())],
            TunnelEvent::UrlNotFound {
                service,
                output,
                timed_out,
            } => vec![
                ("service", service.clone()),
                ("stdout", output.clone()),
                ("timed_out", timed_out.to_string()),
            ],
            TunnelEvent::TerminationSwallowed { error } => vec![("error", error.clone())],
        }
    }
}

/// Write-only destination for tunnel events
pub trait EventSink: Send + Sync {
    fn emit(&self, id: TunnelId, event: &TunnelEvent);
}

impl<F> EventSink for F
where
    F: Fn(TunnelId, &TunnelEvent) + Send + Sync,
{
    fn emit(&self, id: TunnelId, event: &TunnelEvent) {
        self(id, event)
    }
}

/// Sends events to the process-wide `tracing` subscriber
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, id: TunnelId, event: &TunnelEvent) {
        let message = event.message();
        let fields = event
            .fields()
            .into_iter()
            .map(|(key, value)| format!("{}={:?}", key, value))
            .collect::<Vec<_>>()
            .join(" ");

        match event.level() {
            Level::Debug => tracing::debug!(tunnel_id = %id, %fields, "{}", message),
            Level::Info => tracing::info!(tunnel_id = %id, %fields, "{}", message),
            Level::Warn => tracing::warn!(tunnel_id = %id, %fields, "{}", message),
            Level::Error => tracing::error!(tunnel_id = %id, %fields, "{}", message),
        }
    }
}

/// Broadcasts events over a channel, dropping them if the channel is full
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Sender<(TunnelId, TunnelEvent)>,
}

impl ChannelSink {
    pub fn new(tx: Sender<(TunnelId, TunnelEvent)>) -> Self {
        Self { tx }
    }

    /// Create a sink with a bounded channel and return its receiving end
    pub fn bounded(capacity: usize) -> (Self, Receiver<(TunnelId, TunnelEvent)>) {
        let (tx, rx) = async_channel::bounded(capacity);
        (Self::new(tx), rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, id: TunnelId, event: &TunnelEvent) {
        let _ = self.tx.try_send((id, event.clone()));
    }
}
