//! Process boundary between the tunnel engine and the system ssh binary.
//!
//! The engine only talks to `Launcher`, so tests can script subprocess
//! output without an ssh client on the machine.

use std::io;

use futures::future::BoxFuture;
use futures::io::AsyncRead;
use smol::process::{Child, ChildStdin, Command, Stdio};

/// Incrementally readable stdout of a spawned process
pub type ProcessOutput = Box<dyn AsyncRead + Send + Unpin>;

/// Control over one spawned process
pub trait ChildProcess: Send {
    fn id(&self) -> Option<u32>;

    /// Ask the process to exit. Does not wait for it.
    ///
    /// Fails if the process has already exited.
    fn terminate(&mut self) -> io::Result<()>;

    /// Force the process to exit, for when it ignores `terminate`.
    fn kill(&mut self) -> io::Result<()>;

    /// Wait until the process has exited.
    fn wait(&mut self) -> BoxFuture<'_, io::Result<()>>;
}

/// A freshly started process with its stdout detached for reading
pub struct Spawned {
    pub stdout: ProcessOutput,
    pub process: Box<dyn ChildProcess>,
}

pub trait Launcher: Send + Sync {
    /// Run `program` to completion with all stdio discarded and report
    /// whether it exited successfully. Never fails.
    fn probe<'a>(&'a self, program: &'a str, args: &'a [&'a str]) -> BoxFuture<'a, bool>;

    /// Start `program` with stdout piped and stderr discarded.
    fn spawn(&self, program: &str, args: &[String]) -> io::Result<Spawned>;
}

/// Launches real processes through `smol::process`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLauncher;

impl Launcher for SystemLauncher {
    fn probe<'a>(&'a self, program: &'a str, args: &'a [&'a str]) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            Command::new(program)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await
                .map(|s| s.success())
                .unwrap_or(false)
        })
    }

    fn spawn(&self, program: &str, args: &[String]) -> io::Result<Spawned> {
        let mut cmd = Command::new(program);

        // Kill the ssh process when its handle is dropped
        cmd.kill_on_drop(true);

        // stdin stays open for the lifetime of the tunnel; some services end
        // the session when they see EOF on it
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::null());
        cmd.args(args);

        let mut child = cmd.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("ssh stdout was not captured"))?;
        let stdin = child.stdin.take();

        Ok(Spawned {
            stdout: Box::new(stdout),
            process: Box::new(SystemProcess {
                child,
                _stdin: stdin,
            }),
        })
    }
}

struct SystemProcess {
    child: Child,
    _stdin: Option<ChildStdin>,
}

impl SystemProcess {
    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_status(), Ok(None))
    }
}

impl ChildProcess for SystemProcess {
    fn id(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn terminate(&mut self) -> io::Result<()> {
        if !self.is_alive() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "ssh process has already exited",
            ));
        }

        request_exit(&mut self.child)
    }

    fn kill(&mut self) -> io::Result<()> {
        if !self.is_alive() {
            return Ok(());
        }
        self.child.kill()
    }

    fn wait(&mut self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move { self.child.status().await.map(|_| ()) })
    }
}

/// SIGTERM lets ssh tear down the remote forward
#[cfg(unix)]
fn request_exit(child: &Child) -> io::Result<()> {
    // SAFETY: the pid belongs to a child we have not reaped yet
    let rc = unsafe { libc::kill(child.id() as libc::pid_t, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn request_exit(child: &mut Child) -> io::Result<()> {
    child.kill()
}
