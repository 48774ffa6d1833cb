//! Reverse tunnel implementation using the system ssh binary.
//!
//! Each attempt spawns `ssh -R remote_port:localhost:local_port` against one
//! forwarding service and watches its stdout for the public URL the service
//! assigns. When ssh goes away without printing one, the service is excluded
//! and another one is tried, unless the caller pinned the service.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::AsyncReadExt;
use url::Url;
use uuid::Uuid;

use super::buffer::OutputBuffer;
use super::error::{Result, TunnelError};
use super::events::{EventSink, TracingSink, TunnelEvent, TunnelId, TunnelState};
use super::launcher::{ChildProcess, Launcher, ProcessOutput, Spawned, SystemLauncher};
use super::preflight::{SSH_PROGRAM, is_client_installed};
use super::registry::ServiceRegistry;
use super::types::{Service, TunnelOptions, TunnelRequest};

const READ_CHUNK_SIZE: usize = 4096;

/// How long a failed attempt's ssh gets to exit after SIGTERM before it is
/// killed
const TERMINATE_GRACE: Duration = Duration::from_millis(500);

/// Opens tunnels against a service registry.
///
/// Holds no per-tunnel state, so one engine can serve concurrent `open`
/// calls.
#[derive(Clone)]
pub struct TunnelEngine {
    registry: Arc<ServiceRegistry>,
    launcher: Arc<dyn Launcher>,
    sink: Arc<dyn EventSink>,
    program: String,
}

impl TunnelEngine {
    /// Built-in services, the system `ssh` binary and `tracing` output
    pub fn new() -> Self {
        Self {
            registry: Arc::new(ServiceRegistry::builtin()),
            launcher: Arc::new(SystemLauncher),
            sink: Arc::new(TracingSink),
            program: SSH_PROGRAM.to_string(),
        }
    }

    pub fn with_registry(mut self, registry: ServiceRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_sink(mut self, sink: impl EventSink + 'static) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    /// Use a different ssh client binary
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// Checks if the configured ssh client runs.
    pub async fn is_client_installed(&self) -> bool {
        is_client_installed(self.launcher.as_ref(), &self.program).await
    }

    /// Open a tunnel to `options.local_port`.
    ///
    /// Resolves once a service has printed its public URL. Failures of
    /// individual services are retried with another service and only show up
    /// in the emitted events.
    pub async fn open(&self, options: TunnelOptions) -> Result<Tunnel> {
        let id = Uuid::new_v4();
        let result = self.open_chain(id, &options).await;
        if let Err(e) = &result {
            self.state(
                id,
                TunnelState::Failed {
                    error: e.to_string(),
                },
            );
        }
        result
    }

    async fn open_chain(&self, id: TunnelId, options: &TunnelOptions) -> Result<Tunnel> {
        self.state(id, TunnelState::Preflighting);
        if !self.is_client_installed().await {
            return Err(TunnelError::ClientUnavailable);
        }

        let mut request = self.resolve(options)?;

        // Every failed round excludes one more registered service, so this
        // ends once the registry is exhausted.
        loop {
            let service = match &request.service {
                Some(pinned) => pinned.clone(),
                None => self.registry.choose(&request.exclude)?.clone(),
            };

            match self
                .attempt(id, &service, request.local_port, options.url_timeout)
                .await?
            {
                Attempt::Resolved(tunnel) => return Ok(tunnel),
                Attempt::NoUrl { output } => {
                    if request.is_pinned() {
                        return Err(TunnelError::UrlNotFound {
                            service: self.describe(&service),
                            output,
                        });
                    }
                    request = request.excluding(&service);
                    self.state(
                        id,
                        TunnelState::Retrying {
                            excluded: request.exclude.len(),
                        },
                    );
                }
            }
        }
    }

    /// Turn caller references into concrete services. Exclusions are
    /// irrelevant once a service is pinned.
    fn resolve(&self, options: &TunnelOptions) -> Result<TunnelRequest> {
        let service = options
            .service
            .as_ref()
            .map(|s| self.registry.resolve(s))
            .transpose()?;

        let exclude = if service.is_some() {
            Vec::new()
        } else {
            options
                .exclude
                .iter()
                .map(|s| self.registry.resolve(s))
                .collect::<Result<Vec<_>>>()?
        };

        Ok(TunnelRequest {
            local_port: options.local_port,
            service,
            exclude,
        })
    }

    /// One ssh process against one service.
    async fn attempt(
        &self,
        id: TunnelId,
        service: &Service,
        local_port: u16,
        timeout: Option<Duration>,
    ) -> Result<Attempt> {
        let name = self.describe(service);
        self.state(
            id,
            TunnelState::Spawning {
                service: name.clone(),
            },
        );

        let args = service.ssh_args(local_port);
        self.notify(
            id,
            TunnelEvent::CommandIssued {
                program: self.program.clone(),
                args: args.clone(),
            },
        );

        let Spawned {
            mut stdout,
            process,
        } = self
            .launcher
            .spawn(&self.program, &args)
            .map_err(TunnelError::Spawn)?;
        let guard = ProcessGuard::new(id, process, self.sink.clone());
        self.state(id, TunnelState::AwaitingUrl);

        let mut buffer = OutputBuffer::new();
        let outcome = {
            let read = read_until_url(&mut stdout, &mut buffer, service);
            let deadline = async {
                match timeout {
                    Some(timeout) => {
                        smol::Timer::after(timeout).await;
                    }
                    None => futures::future::pending::<()>().await,
                }
                Outcome::TimedOut
            };
            smol::future::or(read, deadline).await
        };

        match outcome {
            Outcome::Found(url) => {
                self.notify(
                    id,
                    TunnelEvent::UrlFound {
                        url: url.to_string(),
                    },
                );
                self.state(
                    id,
                    TunnelState::Resolved {
                        url: url.to_string(),
                    },
                );
                drain(stdout);

                let process = guard.release();
                Ok(Attempt::Resolved(Tunnel {
                    id,
                    url,
                    local_port,
                    pid: process.as_ref().and_then(|p| p.id()),
                    service: service.clone(),
                    process,
                    sink: self.sink.clone(),
                }))
            }
            other => {
                let timed_out = matches!(other, Outcome::TimedOut);
                drop(stdout);
                guard.shutdown().await;

                let output = buffer.into_string();
                self.notify(
                    id,
                    TunnelEvent::UrlNotFound {
                        service: name,
                        output: output.clone(),
                        timed_out,
                    },
                );
                Ok(Attempt::NoUrl { output })
            }
        }
    }

    /// Registry name of a service, or its destination when unregistered
    fn describe(&self, service: &Service) -> String {
        self.registry
            .name_of(service)
            .map(str::to_string)
            .unwrap_or_else(|| service.to_string())
    }

    fn state(&self, id: TunnelId, state: TunnelState) {
        self.notify(id, TunnelEvent::StateChanged(state));
    }

    fn notify(&self, id: TunnelId, event: TunnelEvent) {
        self.sink.emit(id, &event);
    }
}

impl Default for TunnelEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TunnelEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelEngine")
            .field("registry", &self.registry)
            .field("program", &self.program)
            .finish_non_exhaustive()
    }
}

enum Attempt {
    Resolved(Tunnel),
    NoUrl { output: String },
}

enum Outcome {
    Found(Url),
    Closed,
    TimedOut,
}

/// Read stdout chunk by chunk until the buffered text matches the service's
/// URL pattern or the stream ends.
async fn read_until_url(
    stdout: &mut ProcessOutput,
    buffer: &mut OutputBuffer,
    service: &Service,
) -> Outcome {
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    loop {
        match stdout.read(&mut chunk).await {
            Ok(0) => return Outcome::Closed,
            Ok(n) => {
                buffer.push(&chunk[..n]);
                if let Some(url) = buffer.find_url(&service.url_pattern) {
                    return Outcome::Found(url);
                }
            }
            Err(e) => {
                tracing::debug!("ssh stdout read error: {}", e);
                return Outcome::Closed;
            }
        }
    }
}

/// Keep reading a resolved tunnel's stdout so ssh never blocks on a full pipe.
fn drain(mut stdout: ProcessOutput) {
    smol::spawn(async move {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        while let Ok(n) = stdout.read(&mut chunk).await {
            if n == 0 {
                break;
            }
        }
    })
    .detach();
}

/// Owns an attempt's process until it is handed to a `Tunnel`; terminates it
/// on every other way out of the attempt.
struct ProcessGuard {
    id: TunnelId,
    process: Option<Box<dyn ChildProcess>>,
    sink: Arc<dyn EventSink>,
}

impl ProcessGuard {
    fn new(id: TunnelId, process: Box<dyn ChildProcess>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            id,
            process: Some(process),
            sink,
        }
    }

    fn release(mut self) -> Option<Box<dyn ChildProcess>> {
        self.process.take()
    }

    /// Terminate and wait until the process is gone, killing it if it
    /// outlives the grace period.
    async fn shutdown(mut self) {
        let Some(mut process) = self.process.take() else {
            return;
        };

        terminate_quietly(self.id, process.as_mut(), self.sink.as_ref());

        let exited = smol::future::or(async { Some(process.wait().await) }, async {
            smol::Timer::after(TERMINATE_GRACE).await;
            None
        })
        .await;

        let result = match exited {
            Some(result) => result,
            None => {
                tracing::debug!("ssh ignored the termination request, killing it");
                if let Err(e) = process.kill() {
                    tracing::debug!("Failed to kill ssh process: {}", e);
                }
                process.wait().await
            }
        };
        if let Err(e) = result {
            tracing::debug!("Failed to wait for ssh process: {}", e);
        }
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        if let Some(process) = self.process.as_mut() {
            terminate_quietly(self.id, process.as_mut(), self.sink.as_ref());
        }
    }
}

fn terminate_quietly(id: TunnelId, process: &mut dyn ChildProcess, sink: &dyn EventSink) {
    if let Err(e) = process.terminate() {
        sink.emit(
            id,
            &TunnelEvent::TerminationSwallowed {
                error: e.to_string(),
            },
        );
    }
}

/// An open tunnel.
///
/// Dropping it without calling [`Tunnel::close`] still terminates ssh.
pub struct Tunnel {
    id: TunnelId,
    url: Url,
    local_port: u16,
    pid: Option<u32>,
    service: Service,
    process: Option<Box<dyn ChildProcess>>,
    sink: Arc<dyn EventSink>,
}

impl Tunnel {
    pub fn id(&self) -> TunnelId {
        self.id
    }

    /// The public URL of the tunnel
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The local port being exposed
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// The process ID of the ssh process
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The service the tunnel runs through
    pub fn service(&self) -> &Service {
        &self.service
    }

    pub fn is_closed(&self) -> bool {
        self.process.is_none()
    }

    /// Closes the tunnel.
    ///
    /// Sends one termination request to ssh and returns without waiting for
    /// the process to exit; it is reaped in the background. Calling this again
    /// does nothing. A process that has already exited is not an error.
    pub async fn close(&mut self) {
        let Some(mut process) = self.process.take() else {
            return;
        };

        self.sink
            .emit(self.id, &TunnelEvent::StateChanged(TunnelState::Closing));
        terminate_quietly(self.id, process.as_mut(), self.sink.as_ref());

        smol::spawn(async move {
            let _ = process.wait().await;
        })
        .detach();

        self.sink
            .emit(self.id, &TunnelEvent::StateChanged(TunnelState::Closed));
    }
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("id", &self.id)
            .field("url", &self.url.as_str())
            .field("local_port", &self.local_port)
            .field("pid", &self.pid)
            .field("service", &self.service.to_string())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        if let Some(process) = self.process.as_mut() {
            tracing::warn!("Tunnel {} dropped while still open, terminating ssh", self.url);
            terminate_quietly(self.id, process.as_mut(), self.sink.as_ref());
        }
    }
}

/// Opens a tunnel to the specified port through one of the built-in services.
///
/// # Example
///
/// ```rust,no_run
/// use sshtunnel::{TunnelOptions, open_tunnel};
///
/// # async fn example() -> sshtunnel::Result<()> {
/// let mut tunnel = open_tunnel(TunnelOptions::new(8000)).await?;
/// println!("{}", tunnel.url());
/// tunnel.close().await;
/// # Ok(())
/// # }
/// ```
pub async fn open_tunnel(options: TunnelOptions) -> Result<Tunnel> {
    TunnelEngine::new().open(options).await
}
